//! Requests the unprivileged process sends to the privileged one.
//!
//! Each request is a fixed header (kind `u32`, payload length `u32`, both
//! native endian) followed by a payload whose size is fixed per kind.
//! Only `WriteResolvConf` is variable, and it declares its own length.
//! A frame whose length doesn't match its kind is dropped unexecuted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{io, net::Ipv4Addr};
use thiserror::Error;

pub const HEADER_LEN: usize = 8;
pub const MAX_RESOLV_CONF_LEN: usize = 16384;
/// The largest payload any request can have.
pub const MAX_PAYLOAD_LEN: usize = 4 + MAX_RESOLV_CONF_LEN;

const KIND_DELETE_ADDRESS: u32 = 1;
const KIND_ADD_ADDRESS: u32 = 2;
const KIND_FLUSH_ROUTES: u32 = 3;
const KIND_ADD_ROUTE: u32 = 4;
const KIND_SET_MTU: u32 = 5;
const KIND_WRITE_RESOLV_CONF: u32 = 6;
const KIND_HANGUP: u32 = 7;
const KIND_TERMINATE: u32 = 8;

#[derive(Error, Debug)]
pub enum PrivsepError {
    #[error("frame of {0} bytes exceeds the maximum")]
    Oversized(usize),

    #[error("resolv.conf contents of {0} bytes exceed the maximum")]
    ResolvConfTooLong(usize),

    #[error("channel closed by peer")]
    Closed,

    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fields of a route to install. `addrs` says which of the addresses are
/// meaningful and `flags` how to install it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub source: Ipv4Addr,
    pub addrs: u32,
    pub flags: u32,
}

impl RouteSpec {
    pub const ADDR_DST: u32 = 0x01;
    pub const ADDR_GATEWAY: u32 = 0x02;
    pub const ADDR_NETMASK: u32 = 0x04;
    pub const ADDR_IFA: u32 = 0x20;

    /// Reach the destination through `gateway`.
    pub const FLAG_GATEWAY: u32 = 0x02;
    /// The destination is a single host.
    pub const FLAG_HOST: u32 = 0x04;

    pub fn has_gateway(&self) -> bool {
        self.flags & Self::FLAG_GATEWAY != 0 && self.addrs & Self::ADDR_GATEWAY != 0
    }

    pub fn prefix_len(&self) -> u8 {
        if self.flags & Self::FLAG_HOST != 0 {
            return 32;
        }
        u32::from(self.netmask).leading_ones() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivRequest {
    DeleteAddress { address: Ipv4Addr },
    AddAddress { address: Ipv4Addr, mask: Ipv4Addr },
    FlushRoutes,
    AddRoute(RouteSpec),
    SetMtu { mtu: u16 },
    WriteResolvConf { contents: Bytes },
    Hangup,
    /// The client got SIGTERM; exit leaving the interface configured.
    Terminate,
}

impl PrivRequest {
    fn kind(&self) -> u32 {
        match self {
            PrivRequest::DeleteAddress { .. } => KIND_DELETE_ADDRESS,
            PrivRequest::AddAddress { .. } => KIND_ADD_ADDRESS,
            PrivRequest::FlushRoutes => KIND_FLUSH_ROUTES,
            PrivRequest::AddRoute(_) => KIND_ADD_ROUTE,
            PrivRequest::SetMtu { .. } => KIND_SET_MTU,
            PrivRequest::WriteResolvConf { .. } => KIND_WRITE_RESOLV_CONF,
            PrivRequest::Hangup => KIND_HANGUP,
            PrivRequest::Terminate => KIND_TERMINATE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrivRequest::DeleteAddress { .. } => "delete-address",
            PrivRequest::AddAddress { .. } => "add-address",
            PrivRequest::FlushRoutes => "flush-routes",
            PrivRequest::AddRoute(_) => "add-route",
            PrivRequest::SetMtu { .. } => "set-mtu",
            PrivRequest::WriteResolvConf { .. } => "write-resolv-conf",
            PrivRequest::Hangup => "hangup",
            PrivRequest::Terminate => "terminate",
        }
    }

    /// Appends the framed request to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), PrivsepError> {
        let mut payload = BytesMut::new();
        match self {
            PrivRequest::DeleteAddress { address } => payload.put_slice(&address.octets()),
            PrivRequest::AddAddress { address, mask } => {
                payload.put_slice(&address.octets());
                payload.put_slice(&mask.octets());
            }
            PrivRequest::FlushRoutes | PrivRequest::Hangup | PrivRequest::Terminate => {}
            PrivRequest::AddRoute(route) => {
                payload.put_slice(&route.destination.octets());
                payload.put_slice(&route.netmask.octets());
                payload.put_slice(&route.gateway.octets());
                payload.put_slice(&route.source.octets());
                payload.put_u32_ne(route.addrs);
                payload.put_u32_ne(route.flags);
            }
            PrivRequest::SetMtu { mtu } => payload.put_u16_ne(*mtu),
            PrivRequest::WriteResolvConf { contents } => {
                if contents.len() > MAX_RESOLV_CONF_LEN {
                    return Err(PrivsepError::ResolvConfTooLong(contents.len()));
                }
                payload.put_u32_ne(contents.len() as u32);
                payload.put_slice(contents);
            }
        }

        out.reserve(HEADER_LEN + payload.len());
        out.put_u32_ne(self.kind());
        out.put_u32_ne(payload.len() as u32);
        out.put_slice(&payload);
        Ok(())
    }

    /// Decodes one frame. `None` for unknown kinds and for payloads whose
    /// size doesn't match the kind.
    pub fn decode(frame: &Frame) -> Option<PrivRequest> {
        let mut p = frame.payload.clone();
        let expected = match frame.kind {
            KIND_DELETE_ADDRESS => 4,
            KIND_ADD_ADDRESS => 8,
            KIND_FLUSH_ROUTES | KIND_HANGUP | KIND_TERMINATE => 0,
            KIND_ADD_ROUTE => 24,
            KIND_SET_MTU => 2,
            KIND_WRITE_RESOLV_CONF => {
                if p.len() < 4 {
                    return None;
                }
                let len = (&p[..4]).get_u32_ne() as usize;
                if len > MAX_RESOLV_CONF_LEN {
                    return None;
                }
                4 + len
            }
            _ => return None,
        };
        if p.len() != expected {
            return None;
        }

        let request = match frame.kind {
            KIND_DELETE_ADDRESS => PrivRequest::DeleteAddress {
                address: get_addr(&mut p),
            },
            KIND_ADD_ADDRESS => PrivRequest::AddAddress {
                address: get_addr(&mut p),
                mask: get_addr(&mut p),
            },
            KIND_FLUSH_ROUTES => PrivRequest::FlushRoutes,
            KIND_ADD_ROUTE => PrivRequest::AddRoute(RouteSpec {
                destination: get_addr(&mut p),
                netmask: get_addr(&mut p),
                gateway: get_addr(&mut p),
                source: get_addr(&mut p),
                addrs: p.get_u32_ne(),
                flags: p.get_u32_ne(),
            }),
            KIND_SET_MTU => PrivRequest::SetMtu { mtu: p.get_u16_ne() },
            KIND_WRITE_RESOLV_CONF => {
                p.advance(4);
                PrivRequest::WriteResolvConf { contents: p }
            }
            KIND_HANGUP => PrivRequest::Hangup,
            _ => PrivRequest::Terminate,
        };
        Some(request)
    }
}

fn get_addr(p: &mut Bytes) -> Ipv4Addr {
    Ipv4Addr::from(p.get_u32())
}

/// A header plus its payload, not yet checked against its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u32,
    pub payload: Bytes,
}

/// Reassembles frames from a byte stream read in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// The next complete frame, if one has arrived. A header declaring a
    /// payload larger than any request can carry is an error; the stream
    /// cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, PrivsepError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &self.buf[..HEADER_LEN];
        let kind = header.get_u32_ne();
        let len = header.get_u32_ne() as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(PrivsepError::Oversized(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}
