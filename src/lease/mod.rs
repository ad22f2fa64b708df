//! Leases and the per-interface lease store.

use crate::{
    config::{ClientConfig, OptionAction},
    v4::options::{OptionCode, Options},
};
use bytes::{Bytes, BytesMut};
use std::net::Ipv4Addr;

pub mod db;

/// Lease length assumed when the server doesn't send one.
pub const DEFAULT_LEASE_TIME: i64 = 43200;
pub const MIN_LEASE_TIME: i64 = 60;

/// Fixed times given to BOOTP leases, which never carry any.
pub const BOOTP_LEASE_TIME: u32 = 12000;
pub const BOOTP_RENEWAL_TIME: u32 = 8000;
pub const BOOTP_REBINDING_TIME: u32 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOrigin {
    /// Declared in the configuration file. Never persisted.
    Static,
    /// Handed out by a server.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub next_server: Ipv4Addr,
    pub server_name: Option<String>,
    pub filename: Option<String>,
    pub ssid: Bytes,
    pub options: Options,
    pub expiry: i64,
    pub renewal: i64,
    pub rebind: i64,
    pub origin: LeaseOrigin,
    pub resolv_conf: Option<String>,
}

impl Lease {
    pub fn new(address: Ipv4Addr, origin: LeaseOrigin) -> Self {
        Self {
            address,
            next_server: Ipv4Addr::UNSPECIFIED,
            server_name: None,
            filename: None,
            ssid: Bytes::new(),
            options: Options::new(),
            expiry: 0,
            renewal: 0,
            rebind: 0,
            origin,
            resolv_conf: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.origin == LeaseOrigin::Static
    }

    /// BOOTP leases carry no DHCP message type.
    pub fn is_bootp(&self) -> bool {
        !self.options.contains(OptionCode::MESSAGE_TYPE)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        !self.is_static() && self.expiry <= now
    }

    pub fn server_identifier(&self) -> Option<&Bytes> {
        self.options
            .get(OptionCode::SERVER_IDENTIFIER)
            .filter(|id| id.len() == 4)
    }

    pub fn client_identifier(&self) -> Option<&Bytes> {
        self.options
            .get(OptionCode::CLIENT_IDENTIFIER)
            .filter(|id| !id.is_empty())
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.options.get_addr(OptionCode::SUBNET_MASK)
    }

    /// Sets expiry, renewal and rebind from the lease time options,
    /// relative to `now`.
    ///
    /// `0 <= renewal <= rebind <= expiry` always holds afterwards.
    pub fn set_times(&mut self, now: i64) {
        let options = &self.options;
        let expiry = options
            .get_u32(OptionCode::LEASE_TIME)
            .map(|t| i64::from(t).max(MIN_LEASE_TIME))
            .unwrap_or(DEFAULT_LEASE_TIME);
        let renewal = options
            .get_u32(OptionCode::RENEWAL_TIME)
            .map(|t| i64::from(t).min(expiry))
            .unwrap_or(expiry / 2);
        let rebind = options
            .get_u32(OptionCode::REBINDING_TIME)
            .map(|t| i64::from(t).min(expiry))
            .unwrap_or(expiry * 7 / 8)
            .max(renewal);

        self.expiry = now + expiry;
        self.renewal = now + renewal;
        self.rebind = now + rebind;
    }

    /// Gives a BOOTP lease the fixed times such leases get.
    pub fn set_bootp_times(&mut self) {
        let options = &mut self.options;
        options.insert(OptionCode::LEASE_TIME, BOOTP_LEASE_TIME.to_be_bytes().to_vec());
        options.insert(OptionCode::RENEWAL_TIME, BOOTP_RENEWAL_TIME.to_be_bytes().to_vec());
        options.insert(OptionCode::REBINDING_TIME, BOOTP_REBINDING_TIME.to_be_bytes().to_vec());
    }

    /// Whether `other` would configure the interface exactly as this lease
    /// does. Times and cached resolv.conf contents are not compared.
    pub fn same_binding(&self, other: &Lease) -> bool {
        self.address == other.address
            && self.origin == other.origin
            && self.is_bootp() == other.is_bootp()
            && self.server_name == other.server_name
            && self.filename == other.filename
            && self.options == other.options
    }

    /// The lease as it is applied to the system: config overrides and
    /// option actions applied, ignored options removed.
    pub fn with_defaults(&self, config: &ClientConfig) -> Lease {
        let mut lease = self.clone();

        if let Some(filename) = &config.filename {
            lease.filename = Some(filename.clone());
        }
        if let Some(server_name) = &config.server_name {
            lease.server_name = Some(server_name.clone());
        }
        if let Some(address) = config.address {
            lease.address = address;
        }
        if let Some(next_server) = config.next_server {
            lease.next_server = next_server;
        }

        for code in &config.ignored_options {
            lease.options.remove(*code);
        }

        for (code, action) in &config.option_actions {
            if config.ignored_options.contains(code) {
                continue;
            }
            let offered = self.options.get(*code).cloned().unwrap_or_default();
            let value = match action {
                OptionAction::Supersede(value) => value.clone(),
                OptionAction::Prepend(value) => concat(value, &offered),
                OptionAction::Append(value) => concat(&offered, value),
                OptionAction::Default(value) if offered.is_empty() => value.clone(),
                OptionAction::Default(_) => continue,
            };
            if value.is_empty() {
                lease.options.remove(*code);
            } else {
                lease.options.insert(*code, value);
            }
        }

        // Classless routes replace both the router and static route options.
        if lease.options.contains(OptionCode::CLASSLESS_STATIC_ROUTES)
            || lease.options.contains(OptionCode::CLASSLESS_MS_STATIC_ROUTES)
        {
            lease.options.remove(OptionCode::ROUTERS);
            lease.options.remove(OptionCode::STATIC_ROUTES);
        }

        lease
    }
}

fn concat(first: &[u8], second: &[u8]) -> Bytes {
    let mut value = BytesMut::with_capacity(first.len() + second.len());
    value.extend_from_slice(first);
    value.extend_from_slice(second);
    value.freeze()
}

/// The leases known for one interface.
///
/// Dynamic leases are kept newest first; static leases follow them in
/// configuration order.
#[derive(Debug, Clone, Default)]
pub struct LeaseStore {
    dynamic: Vec<Lease>,
    statics: Vec<Lease>,
}

impl LeaseStore {
    pub fn new(dynamic: Vec<Lease>, statics: Vec<Lease>) -> Self {
        Self { dynamic, statics }
    }

    pub fn dynamic(&self) -> &[Lease] {
        &self.dynamic
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.dynamic.iter().chain(self.statics.iter())
    }

    /// The first lease usable on the current network: same ssid, same
    /// client identifier as we send, not configured on another interface,
    /// and not expired. A static lease is returned with fresh times.
    pub fn recorded_lease(
        &self,
        ssid: &[u8],
        client_id: Option<&Bytes>,
        now: i64,
        in_use_elsewhere: impl Fn(Ipv4Addr) -> bool,
    ) -> Option<Lease> {
        let lease = self.iter().find(|lease| {
            lease.ssid.as_ref() == ssid
                && lease.client_identifier().map_or(true, |id| Some(id) == client_id)
                && !in_use_elsewhere(lease.address)
                && !lease.is_expired(now)
        })?;

        let mut lease = lease.clone();
        if lease.is_static() {
            lease.set_times(now);
        }
        Some(lease)
    }

    /// Forgets a dynamic lease the server refused.
    pub fn remove(&mut self, lease: &Lease) {
        self.dynamic
            .retain(|l| !(l.address == lease.address && l.ssid == lease.ssid));
    }

    /// Records the newly bound lease: expired leases and older copies of
    /// the same address on the same network are dropped, and a dynamic
    /// `active` goes to the head of the list.
    pub fn record_bound(&mut self, active: &Lease, now: i64) {
        self.dynamic.retain(|lease| {
            lease.ssid != active.ssid
                || (lease.expiry > now && lease.address != active.address)
        });
        if !active.is_static() {
            let mut lease = active.clone();
            lease.resolv_conf = None;
            self.dynamic.insert(0, lease);
        }
    }

    /// Adds a lease read from the database. Reading goes oldest first, so
    /// each lease goes to the head, replacing any older record of the same
    /// address and client identifier on the same network.
    pub fn push_recorded(&mut self, lease: Lease) {
        self.dynamic.retain(|l| !same_record(l, &lease));
        self.dynamic.insert(0, lease);
    }
}

/// Whether `new` supersedes `old` when both are read from a file.
pub(crate) fn same_record(old: &Lease, new: &Lease) -> bool {
    old.ssid == new.ssid
        && new
            .client_identifier()
            .map_or(true, |id| old.client_identifier() == Some(id))
        && old.address == new.address
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(address: [u8; 4], expiry: i64) -> Lease {
        let mut lease = Lease::new(Ipv4Addr::from(address), LeaseOrigin::Dynamic);
        lease.options.insert(OptionCode::MESSAGE_TYPE, vec![5]);
        lease.expiry = expiry;
        lease
    }

    #[test]
    fn test_set_times_defaults() {
        let mut lease = lease([10, 0, 0, 5], 0);
        lease.set_times(1000);
        assert_eq!(lease.expiry, 1000 + 43200);
        assert_eq!(lease.renewal, 1000 + 21600);
        assert_eq!(lease.rebind, 1000 + 37800);
    }

    #[test]
    fn test_set_times_clamps() {
        let mut lease = lease([10, 0, 0, 5], 0);
        lease.options.insert(OptionCode::LEASE_TIME, 30u32.to_be_bytes().to_vec());
        lease.options.insert(OptionCode::RENEWAL_TIME, 100u32.to_be_bytes().to_vec());
        lease.options.insert(OptionCode::REBINDING_TIME, 10u32.to_be_bytes().to_vec());
        lease.set_times(0);
        assert_eq!(lease.expiry, 60);
        assert_eq!(lease.renewal, 60);
        assert_eq!(lease.rebind, 60);
        assert!(lease.expiry >= lease.rebind && lease.rebind >= lease.renewal);
    }

    #[test]
    fn test_bootp_times() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 9), LeaseOrigin::Dynamic);
        assert!(lease.is_bootp());
        lease.set_bootp_times();
        lease.set_times(0);
        assert_eq!((lease.expiry, lease.renewal, lease.rebind), (12000, 8000, 10000));
    }

    #[test]
    fn test_with_defaults() {
        let mut config = ClientConfig::new("em0".to_string());
        config.option_actions.insert(
            OptionCode::DOMAIN_NAME,
            OptionAction::Supersede(Bytes::from_static(b"example.org")),
        );
        config.option_actions.insert(
            OptionCode::DOMAIN_NAME_SERVERS,
            OptionAction::Prepend(Bytes::from_static(&[127, 0, 0, 1])),
        );
        config.option_actions.insert(
            OptionCode::HOST_NAME,
            OptionAction::Default(Bytes::from_static(b"fallback")),
        );
        config.ignored_options.push(OptionCode::TIME_OFFSET);
        config.filename = Some("boot.img".to_string());

        let mut offer = lease([10, 0, 0, 5], 0);
        offer.options.insert(OptionCode::DOMAIN_NAME, Bytes::from_static(b"corp.net"));
        offer.options.insert(OptionCode::DOMAIN_NAME_SERVERS, vec![10, 0, 0, 1]);
        offer.options.insert(OptionCode::TIME_OFFSET, vec![0, 0, 0, 0]);
        offer.options.insert(OptionCode::ROUTERS, vec![10, 0, 0, 1]);
        offer.options.insert(OptionCode::CLASSLESS_STATIC_ROUTES, vec![0, 10, 0, 0, 1]);

        let effective = offer.with_defaults(&config);
        assert_eq!(effective.options.get(OptionCode::DOMAIN_NAME).unwrap().as_ref(), b"example.org");
        assert_eq!(
            effective.options.get(OptionCode::DOMAIN_NAME_SERVERS).unwrap().as_ref(),
            &[127, 0, 0, 1, 10, 0, 0, 1]
        );
        assert_eq!(effective.options.get(OptionCode::HOST_NAME).unwrap().as_ref(), b"fallback");
        assert!(!effective.options.contains(OptionCode::TIME_OFFSET));
        assert!(!effective.options.contains(OptionCode::ROUTERS));
        assert_eq!(effective.filename.as_deref(), Some("boot.img"));
        // The offer itself is untouched.
        assert!(offer.options.contains(OptionCode::ROUTERS));
    }

    #[test]
    fn test_same_binding_ignores_times() {
        let mut a = lease([10, 0, 0, 5], 100);
        let b = lease([10, 0, 0, 5], 200);
        assert!(a.same_binding(&b));
        a.options.insert(OptionCode::HOST_NAME, Bytes::from_static(b"x"));
        assert!(!a.same_binding(&b));
    }

    #[test]
    fn test_recorded_lease_selection() {
        let now = 1000;
        let mut with_id = lease([10, 0, 0, 6], 5000);
        with_id.options.insert(OptionCode::CLIENT_IDENTIFIER, vec![1, 2, 3]);
        let expired = lease([10, 0, 0, 7], 500);
        let good = lease([10, 0, 0, 8], 5000);
        let store = LeaseStore::new(vec![with_id, expired, good.clone()], Vec::new());

        let own_id = Bytes::from_static(&[9, 9, 9]);
        let found = store.recorded_lease(b"", Some(&own_id), now, |_| false).unwrap();
        assert_eq!(found.address, good.address);

        let found = store
            .recorded_lease(b"", Some(&Bytes::from_static(&[1, 2, 3])), now, |_| false)
            .unwrap();
        assert_eq!(found.address, Ipv4Addr::new(10, 0, 0, 6));

        assert!(store
            .recorded_lease(b"", Some(&own_id), now, |addr| addr == good.address)
            .is_none());
        assert!(store.recorded_lease(b"other", None, now, |_| false).is_none());
    }

    #[test]
    fn test_static_lease_gets_fresh_times() {
        let mut fixed = Lease::new(Ipv4Addr::new(192, 168, 1, 2), LeaseOrigin::Static);
        fixed.options.insert(OptionCode::LEASE_TIME, 600u32.to_be_bytes().to_vec());
        let store = LeaseStore::new(Vec::new(), vec![fixed]);
        let found = store.recorded_lease(b"", None, 5000, |_| false).unwrap();
        assert_eq!(found.expiry, 5600);
    }

    #[test]
    fn test_record_bound_prunes() {
        let now = 1000;
        let old_copy = lease([10, 0, 0, 5], 2000);
        let expired = lease([10, 0, 0, 6], 900);
        let other = lease([10, 0, 0, 7], 3000);
        let mut store = LeaseStore::new(vec![old_copy, expired, other], Vec::new());

        let mut active = lease([10, 0, 0, 5], 50000);
        active.resolv_conf = Some("nameserver 10.0.0.1\n".to_string());
        store.record_bound(&active, now);
        store.record_bound(&active, now);

        let addresses: Vec<_> = store.dynamic().iter().map(|l| l.address).collect();
        assert_eq!(addresses, vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 7)]);
        assert!(store.dynamic()[0].resolv_conf.is_none());
    }

    #[test]
    fn test_push_recorded_replaces_older() {
        let mut store = LeaseStore::default();
        store.push_recorded(lease([10, 0, 0, 5], 100));
        store.push_recorded(lease([10, 0, 0, 6], 100));
        store.push_recorded(lease([10, 0, 0, 5], 200));
        let expiries: Vec<_> = store.dynamic().iter().map(|l| l.expiry).collect();
        assert_eq!(expiries, vec![200, 100]);
    }
}
