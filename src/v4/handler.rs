//! DHCPv4 state machine implementation
//!
//! The handler never touches a socket or the kernel. Every input carries
//! the current time, and every effect is queued as an [`Action`] for the
//! dispatcher to carry out. Exactly one timer is pending at a time.

use super::{
    framing::assemble_frame,
    message::{make_decline, make_discover, make_request, DhcpPacket, RequestContext, BOOTREPLY},
    options::{OptionCode, Options},
    pretty::{decode_domain_search, is_hostname, is_hostname_list, pretty_print},
};
use crate::{
    config::ClientConfig,
    lease::{
        db::{leases_as_string, option_db_string},
        Lease, LeaseOrigin, LeaseStore,
    },
    network::{
        host::Host,
        kernel::{link_is_up, Arbiter, RouteEvent, Verdict, IFF_UP},
        routes::{lease_routes, resolv_conf_contents},
        Interface,
    },
    privsep::PrivRequest,
};
use bytes::Bytes;
use dhcproto::v4::MessageType;
use rand::{rngs::StdRng, Rng};
use std::{fmt, mem, net::Ipv4Addr, time::Duration};

/// Smallest MTU an interface may be given.
const MIN_MTU: u16 = 68;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DhcpV4State {
    Preboot,
    Rebooting,
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Panic,
}

impl fmt::Display for DhcpV4State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DhcpV4State::Preboot => "PREBOOT",
            DhcpV4State::Rebooting => "REBOOTING",
            DhcpV4State::Init => "INIT",
            DhcpV4State::Selecting => "SELECTING",
            DhcpV4State::Requesting => "REQUESTING",
            DhcpV4State::Bound => "BOUND",
            DhcpV4State::Renewing => "RENEWING",
            DhcpV4State::Rebinding => "REBINDING",
            DhcpV4State::Panic => "PANIC",
        };
        f.write_str(name)
    }
}

/// What runs when the pending timer expires.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Timer {
    Preboot,
    Reboot,
    Discover,
    Select,
    Request,
    Renew,
    Init,
}

/// Effects the handler asks the dispatcher to carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A complete Ethernet frame for the packet socket.
    Broadcast { frame: Bytes },
    /// A BOOTP payload for the UDP socket.
    Unicast { to: Ipv4Addr, payload: Bytes },
    Priv(PrivRequest),
    /// New contents of the lease database.
    WriteLeases(String),
    /// New contents of the option dump.
    WriteOptionDb(String),
    TruncateOptionDb,
    Daemonize,
    /// Stop the client.
    Fatal(String),
}

/// A read-only view of the handler, for logging and dump tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: DhcpV4State,
    pub xid: u32,
    pub active: Option<Lease>,
    pub link_up: bool,
    pub in_charge: bool,
    pub responsible: bool,
    pub deadline: Option<(i64, Timer)>,
}

/// One step of retransmission backoff: start at `initial`, then add a
/// random amount in `[0, 2 * interval)`, never going past `cutoff`.
pub fn next_interval(interval: i64, initial: i64, cutoff: i64, rng: &mut impl Rng) -> i64 {
    let next = if interval <= 0 {
        initial
    } else {
        interval + rng.random_range(0..2 * interval)
    };
    next.min(cutoff).max(1)
}

fn seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

pub struct DhcpV4Handler {
    interface: Interface,
    config: ClientConfig,
    leases: LeaseStore,
    host: Box<dyn Host>,
    rng: StdRng,
    arbiter: Option<Arbiter>,
    parameter_requests: Vec<u8>,

    state: DhcpV4State,
    xid: u32,
    active: Option<Lease>,
    offer: Option<Lease>,
    requested_address: Option<Ipv4Addr>,
    /// The DHCPDISCOVER or DHCPREQUEST being retransmitted.
    sent: Option<DhcpPacket>,
    destination: Ipv4Addr,
    first_sending: i64,
    interval: i64,
    secs: u16,
    startup_time: i64,

    link_up: bool,
    responsible: bool,
    detached: bool,
    adding: Option<Ipv4Addr>,
    /// Addresses we asked to delete whose DELADDR hasn't arrived yet.
    deleting: Vec<Ipv4Addr>,

    timer: Option<(i64, Timer)>,
    outbox: Vec<Action>,
}

impl DhcpV4Handler {
    pub fn new(interface: Interface, config: ClientConfig, leases: LeaseStore, host: Box<dyn Host>, mut rng: StdRng) -> Self {
        let xid = rng.random();
        let parameter_requests = config.parameter_request_list();
        Self {
            interface,
            config,
            leases,
            host,
            rng,
            arbiter: None,
            parameter_requests,
            state: DhcpV4State::Preboot,
            xid,
            active: None,
            offer: None,
            requested_address: None,
            sent: None,
            destination: Ipv4Addr::BROADCAST,
            first_sending: 0,
            interval: 0,
            secs: 0,
            startup_time: 0,
            link_up: false,
            responsible: false,
            detached: false,
            adding: None,
            deleting: Vec::new(),
            timer: None,
            outbox: Vec::new(),
        }
    }

    /// Hands over the arbiter that won the interface at startup. Rival
    /// proposals seen afterwards make the client exit.
    pub fn with_arbiter(mut self, arbiter: Arbiter) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn state(&self) -> DhcpV4State {
        self.state
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    pub fn active(&self) -> Option<&Lease> {
        self.active.as_ref()
    }

    pub fn is_responsible(&self) -> bool {
        self.responsible
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            xid: self.xid,
            active: self.active.clone(),
            link_up: self.link_up,
            in_charge: self.arbiter.as_ref().is_some_and(Arbiter::in_charge),
            responsible: self.responsible,
            deadline: self.timer,
        }
    }

    /// When the pending timer fires, in unix seconds.
    pub fn next_deadline(&self) -> Option<i64> {
        self.timer.map(|(deadline, _)| deadline)
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        mem::take(&mut self.outbox)
    }

    /// The resolv.conf contents of the active lease, once the client is
    /// responsible for the interface.
    pub fn resolv_conf(&self) -> Option<&str> {
        if !self.responsible {
            return None;
        }
        self.active.as_ref()?.resolv_conf.as_deref()
    }

    pub fn start(&mut self, now: i64) {
        self.startup_time = now;
        self.state_preboot(now);
    }

    /// Fires every timer that is due by `now`.
    pub fn handle_timeout(&mut self, now: i64) {
        while let Some((deadline, timer)) = self.timer {
            if deadline > now {
                break;
            }
            self.timer = None;
            tracing::trace!("Timer {:?} fired in state {}", timer, self.state);
            match timer {
                Timer::Preboot => self.state_preboot(now),
                Timer::Reboot => self.state_reboot(now),
                Timer::Discover => self.send_discover(now),
                Timer::Select => self.state_selecting(now),
                Timer::Request => self.send_request(now),
                Timer::Renew => self.state_bound(now),
                Timer::Init => self.state_init(now),
            }
        }
    }

    fn set_timeout(&mut self, deadline: i64, timer: Timer) {
        self.timer = Some((deadline, timer));
    }

    fn cancel_timeout(&mut self) {
        self.timer = None;
    }

    fn daemonize(&mut self) {
        if !self.detached {
            self.detached = true;
            self.outbox.push(Action::Daemonize);
        }
    }

    fn fatal(&mut self, message: String) {
        tracing::error!("{}", message);
        self.outbox.push(Action::Fatal(message));
    }

    fn request_priv(&mut self, request: PrivRequest) {
        self.outbox.push(Action::Priv(request));
    }

    fn context(&self) -> RequestContext<'_> {
        RequestContext {
            xid: self.xid,
            hw: self.interface.hw,
            requested_options: &self.parameter_requests,
            send_options: &self.config.send_options,
        }
    }

    fn transmit(&mut self, payload: Bytes, from: Ipv4Addr, to: Ipv4Addr) {
        if to == Ipv4Addr::BROADCAST {
            let frame = assemble_frame(&payload, from, to, self.interface.hw);
            self.outbox.push(Action::Broadcast { frame });
        } else {
            self.outbox.push(Action::Unicast { to, payload });
        }
    }

    fn state_preboot(&mut self, now: i64) {
        let interval = now - self.startup_time;
        self.link_up = match self.host.interface_flags(&self.interface.name) {
            Ok(flags) => link_is_up(flags),
            Err(e) => {
                tracing::warn!("Cannot read flags of {}: {}", self.interface.name, e);
                false
            }
        };

        if self.link_up {
            self.state = DhcpV4State::Rebooting;
            self.set_timeout(now + 1, Timer::Reboot);
        } else {
            if interval > seconds(self.config.link_timeout) {
                if !self.detached {
                    tracing::info!("No link on {}, sleeping", self.interface.name);
                }
                self.daemonize();
            }
            self.state = DhcpV4State::Preboot;
            self.set_timeout(now + 1, Timer::Preboot);
        }
    }

    /// Link came up: try to confirm the last lease we had here.
    fn state_reboot(&mut self, now: i64) {
        self.cancel_timeout();
        self.deleting.clear();
        self.adding = None;

        let ifname = &self.interface.name;
        let host = &self.host;
        self.active = self.leases.recorded_lease(
            &self.interface.ssid,
            self.config.client_identifier(),
            now,
            |address| host.address_in_use_elsewhere(ifname, address),
        );
        let Some(address) = self.active.as_ref().filter(|lease| !lease.is_bootp()).map(|lease| lease.address) else {
            self.state = DhcpV4State::Init;
            self.state_init(now);
            return;
        };

        self.state = DhcpV4State::Rebooting;
        self.xid = self.rng.random();
        self.requested_address = Some(address);
        let packet = make_request(&self.context(), Ipv4Addr::UNSPECIFIED, Some(address), None);
        match packet {
            Ok(packet) => self.sent = Some(packet),
            Err(e) => return self.fatal(e.to_string()),
        }
        self.destination = Ipv4Addr::BROADCAST;
        self.first_sending = now;
        self.interval = 0;
        self.send_request(now);
    }

    fn state_init(&mut self, now: i64) {
        self.xid = self.rng.random();
        self.requested_address = self.active.as_ref().map(|lease| lease.address);
        let packet = make_discover(&self.context(), self.requested_address);
        match packet {
            Ok(packet) => self.sent = Some(packet),
            Err(e) => return self.fatal(e.to_string()),
        }
        self.offer = None;
        self.destination = Ipv4Addr::BROADCAST;
        self.state = DhcpV4State::Selecting;
        self.first_sending = now;
        self.interval = 0;
        self.send_discover(now);
    }

    /// The selection window closed.
    fn state_selecting(&mut self, now: i64) {
        self.cancel_timeout();

        let Some(offer) = self.offer.as_mut() else {
            self.state_panic(now);
            return;
        };

        if offer.is_bootp() {
            offer.set_bootp_times();
            self.state = DhcpV4State::Requesting;
            self.bind_lease(now);
            return;
        }

        // Keep the xid: every offer answered the same DISCOVER. The offer
        // itself comes back in the ACK.
        let Some(offer) = self.offer.take() else {
            return;
        };
        self.destination = Ipv4Addr::BROADCAST;
        self.state = DhcpV4State::Requesting;
        self.first_sending = now;
        self.interval = 0;
        self.requested_address = Some(offer.address);
        let packet = make_request(
            &self.context(),
            Ipv4Addr::UNSPECIFIED,
            Some(offer.address),
            offer.server_identifier(),
        );
        match packet {
            Ok(packet) => self.sent = Some(packet),
            Err(e) => return self.fatal(e.to_string()),
        }
        self.send_request(now);
    }

    /// Renewal time: ask the server that gave us the lease to extend it.
    fn state_bound(&mut self, now: i64) {
        let Some(active) = self.active.as_ref() else {
            self.state_init(now);
            return;
        };
        let address = active.address;
        let destination = active
            .server_identifier()
            .map(|id| Ipv4Addr::new(id[0], id[1], id[2], id[3]))
            .unwrap_or(Ipv4Addr::BROADCAST);

        self.xid = self.rng.random();
        let packet = make_request(&self.context(), address, None, None);
        match packet {
            Ok(packet) => self.sent = Some(packet),
            Err(e) => return self.fatal(e.to_string()),
        }
        self.destination = destination;
        self.first_sending = now;
        self.interval = 0;
        self.state = DhcpV4State::Renewing;
        self.send_request(now);
    }

    /// No usable answer: fall back to a recorded lease, or start over
    /// after `retry_interval`.
    fn state_panic(&mut self, now: i64) {
        self.state = DhcpV4State::Panic;
        tracing::info!("No acceptable DHCPOFFERS received.");

        let ifname = &self.interface.name;
        let host = &self.host;
        self.offer = self.leases.recorded_lease(
            &self.interface.ssid,
            self.config.client_identifier(),
            now,
            |address| host.address_in_use_elsewhere(ifname, address),
        );
        if self.offer.is_some() {
            self.state = DhcpV4State::Requesting;
            self.bind_lease(now);
            return;
        }

        tracing::info!("No working leases in persistent database - sleeping.");
        self.state = DhcpV4State::Init;
        self.set_timeout(now + seconds(self.config.retry_interval), Timer::Init);
        self.daemonize();
    }

    fn send_discover(&mut self, now: i64) {
        let deadline = self.first_sending + seconds(self.config.timeout);
        if now >= deadline {
            self.state_panic(now);
            return;
        }

        self.interval = next_interval(
            self.interval,
            seconds(self.config.initial_interval),
            seconds(self.config.backoff_cutoff),
            &mut self.rng,
        )
        .min(deadline - now);

        let elapsed = now - self.first_sending;
        self.secs = u16::try_from(elapsed).unwrap_or(u16::MAX);
        let Some(packet) = self.sent.as_mut() else {
            return;
        };
        packet.secs = self.secs;
        let payload = packet.to_bytes();

        tracing::info!("DHCPDISCOVER on {} - interval {}", self.interface.name, self.interval);
        self.transmit(payload, Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST);
        self.set_timeout(now + self.interval, Timer::Discover);
    }

    fn send_request(&mut self, now: i64) {
        let elapsed = now - self.first_sending;
        let expiry = self.active.as_ref().map_or(i64::MAX, |lease| lease.expiry);

        match self.state {
            DhcpV4State::Rebooting if elapsed >= seconds(self.config.reboot_timeout) => {
                self.cancel_timeout();
                self.state = DhcpV4State::Init;
                self.state_init(now);
                return;
            }
            DhcpV4State::Requesting if elapsed >= seconds(self.config.timeout) => {
                self.state_panic(now);
                return;
            }
            DhcpV4State::Rebooting | DhcpV4State::Renewing | DhcpV4State::Rebinding if now >= expiry => {
                if let Some(address) = self.active.as_ref().map(|lease| lease.address) {
                    tracing::info!("Lease on {} expired", address);
                    self.delete_address(address);
                }
                self.active = None;
                self.state = DhcpV4State::Init;
                self.state_init(now);
                return;
            }
            DhcpV4State::Renewing if self.active.as_ref().is_some_and(|lease| now >= lease.rebind) => {
                tracing::info!("Rebinding lease on {}", self.interface.name);
                self.state = DhcpV4State::Rebinding;
            }
            _ => {}
        }

        let deadline = match self.state {
            DhcpV4State::Rebooting => expiry.min(self.first_sending + seconds(self.config.reboot_timeout)),
            DhcpV4State::Requesting => self.first_sending + seconds(self.config.timeout),
            _ => expiry,
        };
        let interval = if self.interval == 0 && self.state == DhcpV4State::Rebooting {
            seconds(self.config.reboot_timeout).max(1)
        } else {
            next_interval(
                self.interval,
                seconds(self.config.initial_interval),
                seconds(self.config.backoff_cutoff),
                &mut self.rng,
            )
        };
        self.interval = interval.min(deadline - now);

        let (from, to) = match self.state {
            DhcpV4State::Requesting | DhcpV4State::Rebooting => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST),
            DhcpV4State::Rebinding => (self.active_address(), Ipv4Addr::BROADCAST),
            _ => (self.active_address(), self.destination),
        };

        let secs = if self.state == DhcpV4State::Requesting {
            self.secs
        } else {
            u16::try_from(elapsed).unwrap_or(u16::MAX)
        };
        let Some(packet) = self.sent.as_mut() else {
            return;
        };
        packet.secs = secs;
        let payload = packet.to_bytes();

        tracing::info!("DHCPREQUEST on {} to {}", self.interface.name, to);
        self.transmit(payload, from, to);
        self.set_timeout(now + self.interval, Timer::Request);
    }

    fn active_address(&self) -> Ipv4Addr {
        self.active
            .as_ref()
            .map_or(Ipv4Addr::UNSPECIFIED, |lease| lease.address)
    }

    fn send_decline(&mut self, address: Ipv4Addr, server_id: Option<&Bytes>) {
        let packet = make_decline(
            self.xid,
            self.interface.hw,
            address,
            server_id,
            self.config.client_identifier(),
        );
        match packet {
            Ok(packet) => {
                tracing::info!("DHCPDECLINE of {} on {}", address, self.interface.name);
                self.transmit(packet.to_bytes(), Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST);
            }
            Err(e) => self.fatal(e.to_string()),
        }
    }

    /// Takes a BOOTP payload received on the client port.
    pub fn handle_packet(&mut self, now: i64, from: Ipv4Addr, payload: &[u8]) {
        let packet = match DhcpPacket::parse(payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Discarding packet from {}: {}", from, e);
                return;
            }
        };

        if usize::from(packet.hlen) != self.interface.hw.len() || packet.chaddr[..6] != self.interface.hw {
            tracing::debug!("Discarding packet for another client");
            return;
        }
        if packet.xid != self.xid {
            tracing::debug!("Discarding packet with XID {:#x} != {:#x}", packet.xid, self.xid);
            return;
        }
        if self.config.is_rejected(from) {
            tracing::debug!("Discarding packet from address on reject list ({})", from);
            return;
        }
        let options = match packet.decode_options() {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!("Discarding packet from {}: {}", from, e);
                return;
            }
        };

        match options.message_type() {
            Some(MessageType::Offer) => self.dhcpoffer(now, &packet, &options, &format!("DHCPOFFER from {from}")),
            Some(MessageType::Ack) => self.dhcpack(now, &packet, &options, &format!("DHCPACK from {from}")),
            Some(MessageType::Nak) => self.dhcpnak(now, &format!("DHCPNAK from {from}")),
            Some(other) => tracing::debug!("Discarding DHCP packet of type {:?}", other),
            None if packet.op == BOOTREPLY => {
                self.dhcpoffer(now, &packet, &options, &format!("BOOTREPLY from {from}"))
            }
            None => tracing::debug!("Discarding packet which is neither DHCP nor BOOTP"),
        }
    }

    fn dhcpoffer(&mut self, now: i64, packet: &DhcpPacket, options: &Options, info: &str) {
        if self.state != DhcpV4State::Selecting {
            tracing::debug!("Unexpected {}. State {}", info, self.state);
            return;
        }
        tracing::info!("{}", info);

        if let Some(lease) = self.packet_to_lease(packet, options) {
            let declined = match self.offer.take() {
                None => {
                    self.offer = Some(lease);
                    None
                }
                Some(current) if Some(lease.address) == self.requested_address && current.address != lease.address => {
                    self.offer = Some(lease);
                    Some(current)
                }
                Some(current) => {
                    let declined = (current.address != lease.address).then_some(lease);
                    self.offer = Some(current);
                    declined
                }
            };
            if let Some(lease) = declined {
                let server_id = lease.server_identifier().cloned();
                self.send_decline(lease.address, server_id.as_ref());
            }
        }

        let stop_selecting = self.first_sending + seconds(self.config.select_interval);
        if stop_selecting <= now {
            self.state_selecting(now);
        } else {
            self.set_timeout(stop_selecting, Timer::Select);
        }
    }

    fn dhcpack(&mut self, now: i64, packet: &DhcpPacket, options: &Options, info: &str) {
        if !self.awaiting_reply() {
            tracing::debug!("Unexpected {}. State {}", info, self.state);
            return;
        }
        tracing::info!("{}", info);

        let Some(lease) = self.packet_to_lease(packet, options) else {
            self.state = DhcpV4State::Init;
            self.state_init(now);
            return;
        };
        self.offer = Some(lease);

        self.cancel_timeout();
        self.bind_lease(now);
    }

    fn dhcpnak(&mut self, now: i64, info: &str) {
        if !self.awaiting_reply() {
            tracing::debug!("Unexpected {}. State {}", info, self.state);
            return;
        }
        tracing::info!("{}", info);

        if let Some(active) = self.active.take() {
            if !active.is_static() {
                self.leases.remove(&active);
            }
        }

        self.cancel_timeout();
        self.state = DhcpV4State::Init;
        self.state_init(now);
    }

    fn awaiting_reply(&self) -> bool {
        matches!(
            self.state,
            DhcpV4State::Rebooting | DhcpV4State::Requesting | DhcpV4State::Renewing | DhcpV4State::Rebinding
        )
    }

    /// Builds a lease from a server's reply, or declines it.
    fn packet_to_lease(&mut self, packet: &DhcpPacket, options: &Options) -> Option<Lease> {
        let mut lease = Lease::new(packet.yiaddr, LeaseOrigin::Dynamic);
        lease.ssid = self.interface.ssid.clone();
        let server_id = options.get(OptionCode::SERVER_IDENTIFIER).cloned();

        for (code, value) in options.iter() {
            if value.is_empty() {
                continue;
            }
            if !self.config.unknown_ok && !code.is_known() {
                tracing::warn!("lease declined: unknown option {}", code.get());
                self.send_decline(lease.address, server_id.as_ref());
                return None;
            }
            let pretty = match pretty_print(code, value, false) {
                Ok(pretty) if !pretty.is_empty() => pretty,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Ignoring {} in offer: {}", code.name(), e);
                    continue;
                }
            };
            let valid = match code {
                OptionCode::DOMAIN_SEARCH => decode_domain_search(value).is_some_and(|names| is_hostname_list(&names)),
                // Several names in domain-name are historically tolerated.
                OptionCode::DOMAIN_NAME => is_hostname_list(&pretty),
                OptionCode::HOST_NAME | OptionCode::NIS_DOMAIN => is_hostname(&pretty),
                _ => true,
            };
            if !valid {
                tracing::warn!("Ignoring {} in offer: invalid host name(s)", code.name());
                continue;
            }
            lease.options.insert(code, value.clone());
        }

        if let Some(missing) = self
            .config
            .required_options
            .iter()
            .find(|code| !lease.options.contains(**code))
        {
            tracing::warn!("lease declined: {} required but missing", missing.name());
            self.send_decline(lease.address, server_id.as_ref());
            return None;
        }

        if self.host.address_in_use_elsewhere(&self.interface.name, lease.address) {
            tracing::warn!("lease declined: {} already configured on another interface", lease.address);
            self.send_decline(lease.address, server_id.as_ref());
            return None;
        }

        lease.next_server = packet.siaddr;

        let overload = lease
            .options
            .get(OptionCode::OPTION_OVERLOAD)
            .and_then(|v| v.first().copied())
            .unwrap_or(0);
        if overload & 2 == 0 {
            if let Some(server_name) = packet.server_name() {
                if !is_hostname(&server_name) {
                    tracing::warn!("lease declined: invalid host name in SNAME");
                    self.send_decline(lease.address, server_id.as_ref());
                    return None;
                }
                lease.server_name = Some(server_name);
            }
        }
        if overload & 1 == 0 {
            lease.filename = packet.filename();
        }
        Some(lease)
    }

    /// Makes the accepted offer the active lease and configures the
    /// interface for it.
    fn bind_lease(&mut self, now: i64) {
        let Some(mut offer) = self.offer.take() else {
            return;
        };
        offer.resolv_conf = None;

        let mut effective = offer.with_defaults(&self.config);
        effective.set_times(now);
        offer.expiry = effective.expiry;
        offer.renewal = effective.renewal;
        offer.rebind = effective.rebind;

        let unchanged = self.responsible
            && self.state == DhcpV4State::Renewing
            && self.active.as_ref().is_some_and(|active| active.same_binding(&offer));

        if unchanged {
            offer.resolv_conf = self.active.take().and_then(|active| active.resolv_conf);
            tracing::info!(
                "bound to {} -- renewal in {} seconds.",
                offer.address,
                offer.renewal - now
            );
            self.active = Some(offer);
        } else {
            offer.resolv_conf = resolv_conf_contents(
                &self.interface.name,
                &effective.options,
                self.config.resolv_tail.as_deref(),
            );
            self.active = Some(offer);

            // Deleting the addresses also clears out ARP entries.
            self.delete_addresses();
            self.request_priv(PrivRequest::FlushRoutes);

            if let Some(mtu) = effective.options.get_u16(OptionCode::INTERFACE_MTU) {
                if mtu < MIN_MTU {
                    tracing::warn!("mtu size {} < {}: ignored", mtu, MIN_MTU);
                } else {
                    self.request_priv(PrivRequest::SetMtu { mtu });
                }
            }

            // The address goes in before the routes that use it.
            let mask = effective.subnet_mask().unwrap_or(Ipv4Addr::UNSPECIFIED);
            self.add_address(effective.address, mask);
            for route in lease_routes(effective.address, mask, &effective.options) {
                self.request_priv(PrivRequest::AddRoute(route));
            }
        }

        let Some(active) = self.active.as_ref() else {
            return;
        };
        let dump = option_db_string(&self.interface.name, active, &effective);
        self.outbox.push(Action::WriteOptionDb(dump));

        self.leases.record_bound(active, now);
        let renewal = active.renewal;
        let contents = leases_as_string(&self.leases, &self.interface.name, now);
        self.outbox.push(Action::WriteLeases(contents));

        self.state = DhcpV4State::Bound;
        self.set_timeout(renewal, Timer::Renew);
    }

    fn add_address(&mut self, address: Ipv4Addr, mask: Ipv4Addr) {
        self.adding = Some(address);
        self.request_priv(PrivRequest::AddAddress { address, mask });
    }

    fn delete_address(&mut self, address: Ipv4Addr) {
        if !self.deleting.contains(&address) {
            self.deleting.push(address);
        }
        self.request_priv(PrivRequest::DeleteAddress { address });
    }

    fn delete_addresses(&mut self) {
        for address in self.host.interface_addresses(&self.interface.name) {
            self.delete_address(address);
        }
    }

    /// Takes one notification from the routing socket.
    pub fn handle_route_event(&mut self, now: i64, event: RouteEvent) {
        if event.ifindex().is_some_and(|index| index != self.interface.index) {
            return;
        }

        match event {
            RouteEvent::Proposal { ifindex, xid } => {
                let verdict = match self.arbiter.as_mut() {
                    Some(arbiter) => arbiter.observe(ifindex, xid),
                    None => Verdict::Ignore,
                };
                if verdict == Verdict::Yield {
                    self.fatal(format!("yielding responsibility for {}", self.interface.name));
                }
            }
            RouteEvent::NewAddress { address, .. } => self.address_added(now, address),
            RouteEvent::DelAddress { address, .. } => self.address_deleted(address),
            RouteEvent::Link { flags, hw_address, .. } => self.link_changed(now, flags, hw_address),
            RouteEvent::LinkGone { .. } => self.fatal(format!("{} departed", self.interface.name)),
            // The client re-runs the resolv.conf election.
            RouteEvent::DefaultRouteChanged => {}
            RouteEvent::Overrun => tracing::warn!("route socket buffer overflow"),
        }
    }

    fn address_added(&mut self, now: i64, address: Ipv4Addr) {
        if address.is_unspecified() {
            return;
        }
        // Our own add coming back.
        if Some(address) == self.adding {
            self.adding = None;
            if let Some(active) = self.active.as_ref() {
                tracing::info!(
                    "bound to {} -- renewal in {} seconds.",
                    active.address,
                    active.renewal - now
                );
            }
            self.responsible = true;
            self.daemonize();
            return;
        }
        if !self.responsible {
            return;
        }
        let message = match self.adding {
            Some(adding) => format!("{}, not {}, added to {}", address, adding, self.interface.name),
            None => format!("{} added to {}", address, self.interface.name),
        };
        self.fatal(message);
    }

    fn address_deleted(&mut self, address: Ipv4Addr) {
        if address.is_unspecified() {
            return;
        }
        if let Some(pos) = self.deleting.iter().position(|a| *a == address) {
            self.deleting.remove(pos);
            return;
        }
        if !self.responsible {
            return;
        }
        if self.adding.is_none() && self.active.as_ref().is_some_and(|lease| lease.address == address) {
            self.fatal(format!("Active address ({address}) deleted; exiting"));
            return;
        }
        let message = match self.deleting.first() {
            Some(deleting) => format!("{}, not {}, deleted from {}", address, deleting, self.interface.name),
            None => format!("{} deleted from {}", address, self.interface.name),
        };
        self.fatal(message);
    }

    fn link_changed(&mut self, now: i64, flags: u32, hw_address: Option<[u8; 6]>) {
        if flags & IFF_UP == 0 {
            self.fatal(format!("{} down", self.interface.name));
            return;
        }
        if let Some(hw) = hw_address.filter(|hw| *hw != self.interface.hw) {
            tracing::warn!(
                "LLADDR of {} changed to {}; restarting",
                self.interface.name,
                hw.map(|b| format!("{b:02x}")).join(":")
            );
            self.request_priv(PrivRequest::Hangup);
            return;
        }

        let link_up = link_is_up(flags);
        if link_up == self.link_up {
            return;
        }
        tracing::debug!(
            "link state {} -> {}",
            if self.link_up { "up" } else { "down" },
            if link_up { "up" } else { "down" }
        );
        self.link_up = link_up;
        if link_up {
            if self.state == DhcpV4State::Preboot {
                self.state_preboot(now);
            } else {
                self.state = DhcpV4State::Rebooting;
                self.state_reboot(now);
            }
        } else {
            // Let monitoring programs see link loss.
            self.outbox.push(Action::TruncateOptionDb);
            // Nothing to wait for but the link.
            self.cancel_timeout();
        }
    }
}
