//! The rtnetlink routing socket.
//!
//! Three kinds of socket are opened here: a listener subscribed to link,
//! address and route notifications, request sockets that change or dump
//! kernel tables, and short-lived senders for take-charge proposals. A
//! proposal is a private message type multicast to the address group so
//! every client listening on the host sees it, the sender included.

use super::kernel::{process_alive, should_flush, Arbiter, Kernel, RouteEntry, RouteEvent, RouteLabel, Verdict};
use crate::privsep::message::RouteSpec;
use bytes::{BufMut, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    fs,
    io::{self, Read},
    mem,
    net::Ipv4Addr,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::io::unix::AsyncFd;

pub const NLMSG_HDR_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTMSG_LEN: usize = 12;
const IFINFOMSG_LEN: usize = 16;
const NLA_HDR_LEN: usize = 4;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_SETLINK: u16 = 19;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;
/// Take-charge proposal. Outside the range the kernel defines.
pub const RTM_PROPOSAL: u16 = 0x7d00;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_DUMP: u16 = 0x300;

pub const RTMGRP_LINK: u32 = 0x01;
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTMGRP_IPV4_ROUTE: u32 = 0x40;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;
const RTA_PREFSRC: u16 = 7;
const RTA_FLOW: u16 = 11;
const RTA_TABLE: u16 = 15;

const IFLA_ADDRESS: u16 = 1;
const IFLA_MTU: u16 = 4;

pub const RT_TABLE_MAIN: u32 = 254;
/// Routes installed by a DHCP client.
pub const RTPROT_DHCP: u8 = 16;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
const RTN_UNICAST: u8 = 1;

const RECV_BUFFER_LEN: usize = 32 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const ADD_ROUTE_ATTEMPTS: usize = 5;
const ADD_ROUTE_BACKOFF: Duration = Duration::from_secs(1);

/// How long to wait for our own proposal before sending another.
pub const PROPOSAL_WINDOW: Duration = Duration::from_secs(3);
pub const PROPOSAL_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("Failed to open routing socket")]
    Open(#[source] io::Error),

    #[error("Routing socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Proposal for interface {ifindex} not seen after {attempts} attempts")]
    TakeCharge { ifindex: u32, attempts: u32 },

    #[error("Another client took charge of interface {0}")]
    Yielded(u32),
}

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Assembles one netlink message.
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn new(kind: u16, flags: u16) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32_ne(0);
        buf.put_u16_ne(kind);
        buf.put_u16_ne(flags);
        buf.put_u32_ne(0);
        buf.put_u32_ne(0);
        Self { buf }
    }

    /// Appends a fixed family header, padded to alignment.
    pub fn put_struct(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self.pad();
        self
    }

    pub fn attr(mut self, kind: u16, value: &[u8]) -> Self {
        self.buf.put_u16_ne((NLA_HDR_LEN + value.len()) as u16);
        self.buf.put_u16_ne(kind);
        self.buf.put_slice(value);
        self.pad();
        self
    }

    pub fn attr_u32(self, kind: u16, value: u32) -> Self {
        self.attr(kind, &value.to_ne_bytes())
    }

    pub fn attr_addr(self, kind: u16, address: Ipv4Addr) -> Self {
        self.attr(kind, &address.octets())
    }

    fn pad(&mut self) {
        let padded = align(self.buf.len());
        self.buf.resize(padded, 0);
    }

    /// Fills in length and sequence number.
    pub fn finish(mut self, seq: u32) -> BytesMut {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

/// A message as read from the socket.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    /// Everything after the netlink header.
    pub payload: &'a [u8],
    /// The whole message, header included.
    pub raw: &'a [u8],
}

fn ne_u16(bytes: &[u8]) -> u16 {
    u16::from_ne_bytes([bytes[0], bytes[1]])
}

fn ne_u32(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn addr(bytes: &[u8]) -> Option<Ipv4Addr> {
    <[u8; 4]>::try_from(bytes).ok().map(Ipv4Addr::from)
}

/// Iterates over the messages in one datagram. Stops at the first
/// truncated message.
pub fn parse_messages(buf: &[u8]) -> Messages<'_> {
    Messages { buf }
}

pub struct Messages<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Messages<'a> {
    type Item = Message<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDR_LEN {
            return None;
        }
        let len = ne_u32(&self.buf[0..4]) as usize;
        if len < NLMSG_HDR_LEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let raw = &self.buf[..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some(Message {
            kind: ne_u16(&raw[4..6]),
            flags: ne_u16(&raw[6..8]),
            seq: ne_u32(&raw[8..12]),
            pid: ne_u32(&raw[12..16]),
            payload: &raw[NLMSG_HDR_LEN..],
            raw,
        })
    }
}

/// Iterates over the `(type, value)` attributes in `buf`.
pub fn attributes(buf: &[u8]) -> Attributes<'_> {
    Attributes { buf }
}

pub struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDR_LEN {
            return None;
        }
        let len = ne_u16(&self.buf[0..2]) as usize;
        if len < NLA_HDR_LEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        // The top bits flag nesting and byte order.
        let kind = ne_u16(&self.buf[2..4]) & 0x3fff;
        let value = &self.buf[NLA_HDR_LEN..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some((kind, value))
    }
}

/// Builds the proposal that announces `xid` is taking charge of `ifindex`.
pub fn proposal(ifindex: u32, xid: u32) -> MessageBuilder {
    let mut body = [0u8; 8];
    body[0..4].copy_from_slice(&ifindex.to_ne_bytes());
    body[4..8].copy_from_slice(&xid.to_ne_bytes());
    MessageBuilder::new(RTM_PROPOSAL, NLM_F_REQUEST).put_struct(&body)
}

/// Translates a notification into an event. Messages the client has no
/// use for yield `None`.
pub fn decode_event(msg: &Message<'_>) -> Option<RouteEvent> {
    match msg.kind {
        RTM_PROPOSAL if msg.payload.len() >= 8 => Some(RouteEvent::Proposal {
            ifindex: ne_u32(&msg.payload[0..4]),
            xid: ne_u32(&msg.payload[4..8]),
        }),
        RTM_NEWADDR | RTM_DELADDR if msg.payload.len() >= IFADDRMSG_LEN => {
            if i32::from(msg.payload[0]) != libc::AF_INET {
                return None;
            }
            let ifindex = ne_u32(&msg.payload[4..8]);
            let mut local = None;
            let mut address = None;
            for (kind, value) in attributes(&msg.payload[IFADDRMSG_LEN..]) {
                match kind {
                    IFA_LOCAL => local = addr(value),
                    IFA_ADDRESS => address = addr(value),
                    _ => {}
                }
            }
            let address = local.or(address)?;
            Some(if msg.kind == RTM_NEWADDR {
                RouteEvent::NewAddress { ifindex, address }
            } else {
                RouteEvent::DelAddress { ifindex, address }
            })
        }
        RTM_NEWLINK if msg.payload.len() >= IFINFOMSG_LEN => {
            let ifindex = ne_u32(&msg.payload[4..8]);
            let flags = ne_u32(&msg.payload[8..12]);
            let hw_address = attributes(&msg.payload[IFINFOMSG_LEN..])
                .find(|(kind, _)| *kind == IFLA_ADDRESS)
                .and_then(|(_, value)| <[u8; 6]>::try_from(value).ok());
            Some(RouteEvent::Link {
                ifindex,
                flags,
                hw_address,
            })
        }
        // rtmsg: family, dst_len, ...
        RTM_NEWROUTE | RTM_DELROUTE
            if msg.payload.len() >= RTMSG_LEN
                && i32::from(msg.payload[0]) == libc::AF_INET
                && msg.payload[1] == 0 =>
        {
            Some(RouteEvent::DefaultRouteChanged)
        }
        RTM_DELLINK if msg.payload.len() >= IFINFOMSG_LEN => Some(RouteEvent::LinkGone {
            ifindex: ne_u32(&msg.payload[4..8]),
        }),
        NLMSG_OVERRUN => Some(RouteEvent::Overrun),
        _ => None,
    }
}

/// Reads an IPv4 route from a `RTM_NEWROUTE` message.
///
/// Routes we install carry `RTPROT_DHCP` and the owning pid in the route
/// realm. A DHCP route without a realm is treated as unlabeled.
pub fn decode_route(msg: &Message<'_>) -> Option<RouteEntry> {
    if msg.kind != RTM_NEWROUTE || msg.payload.len() < RTMSG_LEN {
        return None;
    }
    let rtm = msg.payload;
    if i32::from(rtm[0]) != libc::AF_INET {
        return None;
    }
    let protocol = rtm[5];
    let mut route = RouteEntry {
        destination: Ipv4Addr::UNSPECIFIED,
        prefix_len: rtm[1],
        gateway: None,
        oif: None,
        table: u32::from(rtm[4]),
        metric: 0,
        label: None,
    };
    for (kind, value) in attributes(&rtm[RTMSG_LEN..]) {
        match kind {
            RTA_DST => route.destination = addr(value)?,
            RTA_GATEWAY => route.gateway = addr(value),
            RTA_OIF if value.len() == 4 => route.oif = Some(ne_u32(value)),
            RTA_PRIORITY if value.len() == 4 => route.metric = ne_u32(value),
            RTA_TABLE if value.len() == 4 => route.table = ne_u32(value),
            RTA_FLOW if value.len() == 4 && protocol == RTPROT_DHCP => {
                let pid = ne_u32(value);
                route.label = (pid != 0).then(|| RouteLabel::new(pid));
            }
            _ => {}
        }
    }
    Some(route)
}

fn netlink_addr(groups: u32) -> SockAddr {
    // SAFETY: an all-zero sockaddr_storage is valid, and sockaddr_nl fits
    // inside it with compatible alignment.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let nl = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_nl;
        (*nl).nl_family = libc::AF_NETLINK as libc::sa_family_t;
        (*nl).nl_groups = groups;
        SockAddr::new(storage, mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t)
    }
}

fn nlmsgerr_code(payload: &[u8]) -> Option<i32> {
    (payload.len() >= 4).then(|| ne_u32(&payload[0..4]) as i32)
}

/// A blocking routing socket.
pub struct NetlinkSocket {
    socket: Socket,
    seq: u32,
    buf: Vec<u8>,
}

impl NetlinkSocket {
    /// Opens a socket subscribed to `groups`. Zero subscribes to nothing.
    pub fn open(groups: u32) -> Result<Self, NetlinkError> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::RAW,
            Some(Protocol::from(libc::NETLINK_ROUTE)),
        )
        .map_err(NetlinkError::Open)?;
        socket.bind(&netlink_addr(groups)).map_err(NetlinkError::Open)?;
        Ok(Self {
            socket,
            seq: 0,
            buf: vec![0; RECV_BUFFER_LEN],
        })
    }

    /// A socket for requests, with a bounded wait for replies.
    pub fn request() -> Result<Self, NetlinkError> {
        let socket = Self::open(0)?;
        socket
            .socket
            .set_read_timeout(Some(REQUEST_TIMEOUT))
            .map_err(NetlinkError::Open)?;
        Ok(socket)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends to the kernel. Returns the sequence number used.
    pub fn send(&mut self, message: MessageBuilder) -> io::Result<u32> {
        let seq = self.next_seq();
        self.socket.send_to(&message.finish(seq), &netlink_addr(0))?;
        Ok(seq)
    }

    /// Multicasts to `groups`.
    pub fn broadcast(&mut self, message: MessageBuilder, groups: u32) -> io::Result<()> {
        let seq = self.next_seq();
        self.socket.send_to(&message.finish(seq), &netlink_addr(groups))?;
        Ok(())
    }

    fn recv_raw(&mut self) -> io::Result<usize> {
        let mut socket = &self.socket;
        socket.read(&mut self.buf)
    }

    /// Receives one datagram and decodes the events in it.
    pub fn recv_events(&mut self) -> io::Result<Vec<RouteEvent>> {
        match self.recv_raw() {
            Ok(n) => Ok(parse_messages(&self.buf[..n])
                .filter_map(|msg| decode_event(&msg))
                .collect()),
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => Ok(vec![RouteEvent::Overrun]),
            Err(e) => Err(e),
        }
    }

    /// Sends a request and waits for the kernel's acknowledgement.
    pub fn transact(&mut self, message: MessageBuilder) -> io::Result<()> {
        let seq = self.send(message)?;
        self.wait_ack(seq)
    }

    fn wait_ack(&mut self, seq: u32) -> io::Result<()> {
        loop {
            let n = self.recv_raw()?;
            for msg in parse_messages(&self.buf[..n]) {
                if msg.seq != seq || msg.kind != NLMSG_ERROR {
                    continue;
                }
                return match nlmsgerr_code(msg.payload) {
                    Some(0) => Ok(()),
                    Some(code) => Err(io::Error::from_raw_os_error(-code)),
                    None => Err(io::Error::new(io::ErrorKind::InvalidData, "short netlink error")),
                };
            }
        }
    }

    /// Sends a dump request and collects the raw replies.
    pub fn dump(&mut self, message: MessageBuilder) -> io::Result<Vec<Vec<u8>>> {
        let seq = self.send(message)?;
        let mut replies = Vec::new();
        loop {
            let n = self.recv_raw()?;
            for msg in parse_messages(&self.buf[..n]) {
                if msg.seq != seq {
                    continue;
                }
                match msg.kind {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => match nlmsgerr_code(msg.payload) {
                        Some(0) => return Ok(replies),
                        Some(code) => return Err(io::Error::from_raw_os_error(-code)),
                        None => {
                            return Err(io::Error::new(io::ErrorKind::InvalidData, "short netlink error"));
                        }
                    },
                    _ => replies.push(msg.raw.to_vec()),
                }
            }
        }
    }

    /// All IPv4 routes the kernel knows.
    pub fn routes(&mut self) -> io::Result<Vec<(RouteEntry, Vec<u8>)>> {
        let mut rtm = [0u8; RTMSG_LEN];
        rtm[0] = libc::AF_INET as u8;
        let request = MessageBuilder::new(RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP).put_struct(&rtm);
        let replies = self.dump(request)?;
        Ok(replies
            .into_iter()
            .filter_map(|raw| {
                let msg = parse_messages(&raw).next()?;
                let route = decode_route(&msg)?;
                Some((route, raw))
            })
            .collect())
    }

    /// The label of the preferred default route in `table`, if any.
    pub fn default_route_label(&mut self, table: u32) -> io::Result<Option<RouteLabel>> {
        let best = self
            .routes()?
            .into_iter()
            .map(|(route, _)| route)
            .filter(|route| route.table == table && route.is_default())
            .min_by_key(|route| route.metric);
        Ok(best.and_then(|route| route.label))
    }

    /// Switches to non-blocking mode for use with tokio.
    pub fn into_async(self) -> Result<RoutingSocket, NetlinkError> {
        self.socket.set_nonblocking(true)?;
        Ok(RoutingSocket {
            fd: AsyncFd::new(self.socket)?,
            buf: self.buf,
        })
    }
}

/// The listener, driven by the event loop.
pub struct RoutingSocket {
    fd: AsyncFd<Socket>,
    buf: Vec<u8>,
}

impl RoutingSocket {
    /// Waits for the next datagram. Cancel safe.
    pub async fn recv_events(&mut self) -> Result<Vec<RouteEvent>, NetlinkError> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            match guard.try_io(|fd| {
                let mut socket = fd.get_ref();
                socket.read(buf)
            }) {
                Ok(Ok(n)) => {
                    return Ok(parse_messages(&self.buf[..n])
                        .filter_map(|msg| decode_event(&msg))
                        .collect());
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    return Ok(vec![RouteEvent::Overrun]);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Multicasts a proposal from a fresh socket. The kernel doesn't loop a
/// broadcast back to the socket that sent it.
pub fn send_proposal(ifindex: u32, xid: u32) -> Result<(), NetlinkError> {
    let mut sender = NetlinkSocket::open(0)?;
    sender.broadcast(proposal(ifindex, xid), RTMGRP_IPV4_IFADDR)?;
    Ok(())
}

/// Proposes until `listener` sees our own proposal come back.
///
/// `listener` must already be subscribed to `RTMGRP_IPV4_IFADDR`.
pub fn take_charge(listener: &mut NetlinkSocket, arbiter: &mut Arbiter, ifindex: u32) -> Result<(), NetlinkError> {
    let attempts = PROPOSAL_RETRIES + 1;
    for attempt in 1..=attempts {
        tracing::debug!("Proposing xid {:#010x} for interface {} (attempt {})", arbiter.xid(), ifindex, attempt);
        send_proposal(ifindex, arbiter.xid())?;

        let deadline = Instant::now() + PROPOSAL_WINDOW;
        while let Some(left) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) {
            listener.socket.set_read_timeout(Some(left))?;
            let events = match listener.recv_events() {
                Ok(events) => events,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            for event in events {
                let RouteEvent::Proposal { ifindex: i, xid } = event else {
                    continue;
                };
                match arbiter.observe(i, xid) {
                    Verdict::InCharge => {
                        listener.socket.set_read_timeout(None)?;
                        return Ok(());
                    }
                    Verdict::Yield => return Err(NetlinkError::Yielded(ifindex)),
                    Verdict::Ignore => {}
                }
            }
        }
    }
    Err(NetlinkError::TakeCharge { ifindex, attempts })
}

/// [`Kernel`] over rtnetlink, used by the privileged process.
pub struct NetlinkKernel {
    socket: NetlinkSocket,
    ifindex: u32,
    table: u32,
    label: RouteLabel,
    resolv_conf: PathBuf,
}

impl NetlinkKernel {
    pub fn new(ifindex: u32, label: RouteLabel) -> Result<Self, NetlinkError> {
        Ok(Self {
            socket: NetlinkSocket::request()?,
            ifindex,
            table: RT_TABLE_MAIN,
            label,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        })
    }

    fn ifaddrmsg(&self, prefix_len: u8) -> [u8; IFADDRMSG_LEN] {
        let mut ifa = [0u8; IFADDRMSG_LEN];
        ifa[0] = libc::AF_INET as u8;
        ifa[1] = prefix_len;
        ifa[3] = RT_SCOPE_UNIVERSE;
        ifa[4..8].copy_from_slice(&self.ifindex.to_ne_bytes());
        ifa
    }

    fn route_message(&self, route: &RouteSpec, flags: u16) -> MessageBuilder {
        let prefix_len = route.prefix_len();
        let mut rtm = [0u8; RTMSG_LEN];
        rtm[0] = libc::AF_INET as u8;
        rtm[1] = prefix_len;
        rtm[4] = self.table as u8;
        rtm[5] = RTPROT_DHCP;
        rtm[6] = if route.has_gateway() {
            RT_SCOPE_UNIVERSE
        } else {
            RT_SCOPE_LINK
        };
        rtm[7] = RTN_UNICAST;

        let mut message = MessageBuilder::new(RTM_NEWROUTE, NLM_F_REQUEST | flags)
            .put_struct(&rtm)
            .attr_u32(RTA_TABLE, self.table);
        if prefix_len > 0 {
            message = message.attr_addr(RTA_DST, route.destination);
        }
        if route.has_gateway() {
            message = message.attr_addr(RTA_GATEWAY, route.gateway);
        }
        if route.addrs & RouteSpec::ADDR_IFA != 0 && !route.source.is_unspecified() {
            message = message.attr_addr(RTA_PREFSRC, route.source);
        }
        message
            .attr_u32(RTA_OIF, self.ifindex)
            .attr_u32(RTA_FLOW, self.label.pid)
    }
}

impl Kernel for NetlinkKernel {
    fn delete_address(&mut self, address: Ipv4Addr) -> io::Result<()> {
        // A zero prefix length matches the address whatever its mask.
        let message = MessageBuilder::new(RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK)
            .put_struct(&self.ifaddrmsg(0))
            .attr_addr(IFA_LOCAL, address);
        match self.socket.transact(message) {
            Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => Ok(()),
            other => other,
        }
    }

    fn add_address(&mut self, address: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()> {
        let prefix_len = u32::from(mask).leading_ones() as u8;
        let mut message = MessageBuilder::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        )
        .put_struct(&self.ifaddrmsg(prefix_len))
        .attr_addr(IFA_LOCAL, address)
        .attr_addr(IFA_ADDRESS, address);
        if prefix_len < 31 {
            let broadcast = Ipv4Addr::from(u32::from(address) | !u32::from(mask));
            message = message.attr_addr(IFA_BROADCAST, broadcast);
        }
        self.socket.transact(message)
    }

    fn flush_routes(&mut self) -> io::Result<()> {
        let routes = self.socket.routes()?;
        for (route, mut raw) in routes {
            if route.table != self.table
                || !should_flush(&route, self.label, self.ifindex, process_alive)
            {
                continue;
            }
            raw[4..6].copy_from_slice(&RTM_DELROUTE.to_ne_bytes());
            raw[6..8].copy_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
            let seq = self.socket.next_seq();
            raw[8..12].copy_from_slice(&seq.to_ne_bytes());
            self.socket.socket.send_to(&raw, &netlink_addr(0))?;
            match self.socket.wait_ack(seq) {
                Ok(()) => tracing::debug!("Deleted route {}/{}", route.destination, route.prefix_len),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => tracing::warn!("Failed to delete route {}/{}: {}", route.destination, route.prefix_len, e),
            }
        }
        Ok(())
    }

    fn add_route(&mut self, route: &RouteSpec) -> io::Result<()> {
        let mut attempt = 1;
        loop {
            let message = self.route_message(route, NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL);
            match self.socket.transact(message) {
                // A competing client may still be flushing.
                Err(e)
                    if matches!(e.raw_os_error(), Some(libc::EEXIST) | Some(libc::ENETUNREACH))
                        && attempt < ADD_ROUTE_ATTEMPTS =>
                {
                    attempt += 1;
                    thread::sleep(ADD_ROUTE_BACKOFF);
                }
                other => return other,
            }
        }
    }

    fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
        let mut ifi = [0u8; IFINFOMSG_LEN];
        ifi[0] = libc::AF_UNSPEC as u8;
        ifi[4..8].copy_from_slice(&self.ifindex.to_ne_bytes());
        let message = MessageBuilder::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK)
            .put_struct(&ifi)
            .attr_u32(IFLA_MTU, u32::from(mtu));
        self.socket.transact(message)
    }

    fn write_resolv_conf(&mut self, contents: &[u8]) -> io::Result<()> {
        fs::write(&self.resolv_conf, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_message(attrs: &[(u16, Vec<u8>)], protocol: u8, dst_len: u8) -> BytesMut {
        let mut rtm = [0u8; RTMSG_LEN];
        rtm[0] = libc::AF_INET as u8;
        rtm[1] = dst_len;
        rtm[4] = RT_TABLE_MAIN as u8;
        rtm[5] = protocol;
        let mut message = MessageBuilder::new(RTM_NEWROUTE, NLM_F_MULTI).put_struct(&rtm);
        for (kind, value) in attrs {
            message = message.attr(*kind, value);
        }
        message.finish(9)
    }

    #[test]
    fn test_builder_layout() {
        let buf = MessageBuilder::new(RTM_NEWADDR, NLM_F_REQUEST)
            .put_struct(&[1, 2, 3])
            .attr(IFA_LOCAL, &[10, 0, 0, 1])
            .attr(99, &[7])
            .finish(42);

        // 16 header + 4 padded struct + 8 address + 8 padded attribute.
        assert_eq!(buf.len(), 36);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(msg.kind, RTM_NEWADDR);
        assert_eq!(msg.seq, 42);
        assert_eq!(msg.raw.len(), 36);

        let attrs: Vec<_> = attributes(&msg.payload[4..]).collect();
        assert_eq!(attrs, vec![(IFA_LOCAL, &[10, 0, 0, 1][..]), (99, &[7][..])]);
    }

    #[test]
    fn test_parse_stops_at_truncation() {
        let mut buf = proposal(2, 7).finish(1).to_vec();
        buf.extend_from_slice(&proposal(3, 8).finish(2));
        let len = buf.len();
        buf.truncate(len - 2);
        let kinds: Vec<_> = parse_messages(&buf).map(|msg| msg.seq).collect();
        assert_eq!(kinds, vec![1]);
    }

    #[test]
    fn test_proposal_event() {
        let buf = proposal(5, 0xdead_beef).finish(1);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(
            decode_event(&msg),
            Some(RouteEvent::Proposal {
                ifindex: 5,
                xid: 0xdead_beef
            })
        );
    }

    #[test]
    fn test_address_and_link_events() {
        let mut ifa = [0u8; IFADDRMSG_LEN];
        ifa[0] = libc::AF_INET as u8;
        ifa[4..8].copy_from_slice(&3u32.to_ne_bytes());
        let buf = MessageBuilder::new(RTM_DELADDR, 0)
            .put_struct(&ifa)
            .attr_addr(IFA_ADDRESS, Ipv4Addr::new(10, 0, 0, 255))
            .attr_addr(IFA_LOCAL, Ipv4Addr::new(10, 0, 0, 5))
            .finish(0);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(
            decode_event(&msg),
            Some(RouteEvent::DelAddress {
                ifindex: 3,
                address: Ipv4Addr::new(10, 0, 0, 5)
            })
        );

        let mut ifi = [0u8; IFINFOMSG_LEN];
        ifi[4..8].copy_from_slice(&3u32.to_ne_bytes());
        ifi[8..12].copy_from_slice(&(libc::IFF_UP as u32).to_ne_bytes());
        let buf = MessageBuilder::new(RTM_NEWLINK, 0)
            .put_struct(&ifi)
            .attr(IFLA_ADDRESS, &[0, 1, 2, 3, 4, 5])
            .finish(0);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(
            decode_event(&msg),
            Some(RouteEvent::Link {
                ifindex: 3,
                flags: libc::IFF_UP as u32,
                hw_address: Some([0, 1, 2, 3, 4, 5])
            })
        );
    }

    #[test]
    fn test_default_route_events() {
        let buf = route_message(&[(RTA_OIF, 2u32.to_ne_bytes().to_vec())], RTPROT_DHCP, 0);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(decode_event(&msg), Some(RouteEvent::DefaultRouteChanged));

        let buf = route_message(&[(RTA_DST, vec![10, 0, 0, 0])], RTPROT_DHCP, 24);
        let msg = parse_messages(&buf).next().unwrap();
        assert_eq!(decode_event(&msg), None);
    }

    #[test]
    fn test_route_labels() {
        let buf = route_message(
            &[
                (RTA_GATEWAY, vec![10, 0, 0, 1]),
                (RTA_OIF, 2u32.to_ne_bytes().to_vec()),
                (RTA_PRIORITY, 100u32.to_ne_bytes().to_vec()),
                (RTA_FLOW, 4242u32.to_ne_bytes().to_vec()),
            ],
            RTPROT_DHCP,
            0,
        );
        let route = decode_route(&parse_messages(&buf).next().unwrap()).unwrap();
        assert!(route.is_default());
        assert_eq!(route.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(route.oif, Some(2));
        assert_eq!(route.metric, 100);
        assert_eq!(route.table, RT_TABLE_MAIN);
        assert_eq!(route.label, Some(RouteLabel::new(4242)));

        // A realm on a route some other program installed is not a label.
        let buf = route_message(&[(RTA_FLOW, 4242u32.to_ne_bytes().to_vec())], 4, 0);
        let route = decode_route(&parse_messages(&buf).next().unwrap()).unwrap();
        assert_eq!(route.label, None);

        let buf = route_message(&[(RTA_DST, vec![192, 168, 0, 0])], 3, 16);
        let route = decode_route(&parse_messages(&buf).next().unwrap()).unwrap();
        assert_eq!(route.destination, Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(route.prefix_len, 16);
    }

    #[test]
    fn test_kernel_route_message() {
        let kernel_route = RouteSpec {
            destination: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            source: Ipv4Addr::new(10, 0, 0, 5),
            addrs: RouteSpec::ADDR_DST | RouteSpec::ADDR_GATEWAY | RouteSpec::ADDR_NETMASK | RouteSpec::ADDR_IFA,
            flags: RouteSpec::FLAG_GATEWAY,
        };
        let Ok(kernel) = NetlinkKernel::new(2, RouteLabel::new(77)) else {
            // No netlink in this sandbox.
            return;
        };
        let buf = kernel.route_message(&kernel_route, NLM_F_CREATE).finish(1);
        let msg = parse_messages(&buf).next().unwrap();
        let route = decode_route(&msg).unwrap();
        assert!(route.is_default());
        assert_eq!(route.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(route.oif, Some(2));
        assert_eq!(route.label, Some(RouteLabel::new(77)));
        assert_eq!(msg.payload[6], RT_SCOPE_UNIVERSE);
    }
}
