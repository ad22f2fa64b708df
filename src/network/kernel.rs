//! Kernel state the client reads and changes: the route label, the events
//! arriving on the routing socket, the operations the privileged process
//! performs, and the arbitration between competing clients.

use crate::privsep::message::RouteSpec;
use std::{fmt, io, net::Ipv4Addr, str::FromStr};

/// Marks a route as installed by the client running as `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLabel {
    pub pid: u32,
}

impl RouteLabel {
    pub const PREFIX: &'static str = "CLIENT ";

    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl fmt::Display for RouteLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.pid)
    }
}

impl FromStr for RouteLabel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pid = s.strip_prefix(Self::PREFIX).ok_or(())?;
        pid.parse().map(RouteLabel::new).map_err(|_| ())
    }
}

/// A route as found in the kernel's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub oif: Option<u32>,
    pub table: u32,
    pub metric: u32,
    pub label: Option<RouteLabel>,
}

impl RouteEntry {
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

/// Whether a flush removes `route` from the interface `ifindex`.
///
/// Routes carrying our label or the label of a client that is no longer
/// running are removed, as are unlabeled default routes through the
/// interface. Routes of a live competing client are left alone.
pub fn should_flush(route: &RouteEntry, own: RouteLabel, ifindex: u32, is_alive: impl Fn(u32) -> bool) -> bool {
    match route.label {
        Some(label) if label == own => true,
        Some(label) => !is_alive(label.pid),
        None => route.is_default() && route.oif == Some(ifindex),
    }
}

/// Something the routing socket reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// A client announced it is taking charge of `ifindex`.
    Proposal { ifindex: u32, xid: u32 },
    NewAddress { ifindex: u32, address: Ipv4Addr },
    DelAddress { ifindex: u32, address: Ipv4Addr },
    /// Interface flags or hardware address as last reported.
    Link {
        ifindex: u32,
        flags: u32,
        hw_address: Option<[u8; 6]>,
    },
    LinkGone { ifindex: u32 },
    /// A default route was added or removed somewhere.
    DefaultRouteChanged,
    /// The socket buffer overflowed and events were lost.
    Overrun,
}

impl RouteEvent {
    pub fn ifindex(&self) -> Option<u32> {
        match self {
            RouteEvent::Proposal { ifindex, .. }
            | RouteEvent::NewAddress { ifindex, .. }
            | RouteEvent::DelAddress { ifindex, .. }
            | RouteEvent::Link { ifindex, .. }
            | RouteEvent::LinkGone { ifindex } => Some(*ifindex),
            RouteEvent::DefaultRouteChanged | RouteEvent::Overrun => None,
        }
    }
}

pub const IFF_UP: u32 = libc::IFF_UP as u32;
pub const IFF_RUNNING: u32 = libc::IFF_RUNNING as u32;

/// Link state derived from interface flags.
pub fn link_is_up(flags: u32) -> bool {
    flags & IFF_UP != 0 && flags & IFF_RUNNING != 0
}

/// The changes the privileged process makes on behalf of the client.
pub trait Kernel {
    fn delete_address(&mut self, address: Ipv4Addr) -> io::Result<()>;
    fn add_address(&mut self, address: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()>;
    /// Removes the routes [`should_flush`] selects.
    fn flush_routes(&mut self) -> io::Result<()>;
    fn add_route(&mut self, route: &RouteSpec) -> io::Result<()>;
    fn set_mtu(&mut self, mtu: u16) -> io::Result<()>;
    fn write_resolv_conf(&mut self, contents: &[u8]) -> io::Result<()>;
}

/// Outcome of observing a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing changes.
    Ignore,
    /// Our own proposal came back: we are in charge.
    InCharge,
    /// A newer client claimed the interface; this one must exit.
    Yield,
}

/// Decides which of several clients started on one interface manages it.
/// The last one to propose wins.
#[derive(Debug, Clone)]
pub struct Arbiter {
    ifindex: u32,
    xid: u32,
    in_charge: bool,
}

impl Arbiter {
    pub fn new(ifindex: u32, xid: u32) -> Self {
        Self {
            ifindex,
            xid,
            in_charge: false,
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn in_charge(&self) -> bool {
        self.in_charge
    }

    pub fn observe(&mut self, ifindex: u32, xid: u32) -> Verdict {
        if ifindex != self.ifindex {
            return Verdict::Ignore;
        }
        if xid == self.xid {
            if self.in_charge {
                return Verdict::Ignore;
            }
            self.in_charge = true;
            return Verdict::InCharge;
        }
        if self.in_charge {
            Verdict::Yield
        } else {
            Verdict::Ignore
        }
    }
}

/// Whether `pid` names a running process.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for the process's existence.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_label_text() {
        let label = RouteLabel::new(4242);
        assert_eq!(label.to_string(), "CLIENT 4242");
        assert_eq!("CLIENT 4242".parse::<RouteLabel>(), Ok(label));
        assert!("DHCLIENT 4242".parse::<RouteLabel>().is_err());
        assert!("CLIENT x".parse::<RouteLabel>().is_err());
    }

    fn route(label: Option<u32>, prefix_len: u8, oif: u32) -> RouteEntry {
        RouteEntry {
            destination: Ipv4Addr::UNSPECIFIED,
            prefix_len,
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            oif: Some(oif),
            table: 254,
            metric: 0,
            label: label.map(RouteLabel::new),
        }
    }

    #[test]
    fn test_flush_classification() {
        let own = RouteLabel::new(100);
        let alive = |pid| pid == 200;

        assert!(should_flush(&route(Some(100), 24, 2), own, 2, alive));
        assert!(should_flush(&route(Some(300), 24, 2), own, 2, alive));
        assert!(!should_flush(&route(Some(200), 0, 2), own, 2, alive));
        assert!(should_flush(&route(None, 0, 2), own, 2, alive));
        assert!(!should_flush(&route(None, 0, 3), own, 2, alive));
        assert!(!should_flush(&route(None, 24, 2), own, 2, alive));
    }

    #[test]
    fn test_link_flags() {
        assert!(link_is_up(IFF_UP | IFF_RUNNING));
        assert!(!link_is_up(IFF_UP));
        assert!(!link_is_up(IFF_RUNNING));
    }

    #[test]
    fn test_exactly_one_arbiter_stays_in_charge() {
        let mut first = Arbiter::new(2, 0x1111);
        let mut second = Arbiter::new(2, 0x2222);

        // The routing socket delivers proposals to every listener in the
        // same order.
        let proposals = [(2, first.xid()), (2, second.xid())];
        let mut yielded = [false, false];
        for (ifindex, xid) in proposals {
            for (i, arbiter) in [&mut first, &mut second].into_iter().enumerate() {
                if arbiter.observe(ifindex, xid) == Verdict::Yield {
                    yielded[i] = true;
                }
            }
        }

        let survivors: Vec<bool> = [&first, &second]
            .iter()
            .zip(yielded)
            .map(|(arbiter, yielded)| arbiter.in_charge() && !yielded)
            .collect();
        assert_eq!(survivors, vec![false, true]);
        assert_eq!(yielded, [true, false]);
    }

    #[test]
    fn test_arbiter_ignores_other_interfaces() {
        let mut arbiter = Arbiter::new(2, 7);
        assert_eq!(arbiter.observe(3, 7), Verdict::Ignore);
        assert_eq!(arbiter.observe(2, 7), Verdict::InCharge);
        assert_eq!(arbiter.observe(2, 7), Verdict::Ignore);
        assert_eq!(arbiter.observe(3, 8), Verdict::Ignore);
        assert_eq!(arbiter.observe(2, 8), Verdict::Yield);
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
