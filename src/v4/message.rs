//! BOOTP/DHCP message layout and the three messages a client originates.

use super::options::{
    decode_options, encode_options, OptionCode, OptionError, Options, MAGIC_COOKIE,
    OPTIONS_MIN_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dhcproto::v4::MessageType;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of the fixed BOOTP header, everything before the options.
pub const DHCP_FIXED_LEN: usize = 236;
pub const BOOTP_MIN_LEN: usize = 300;
pub const CHADDR_LEN: usize = 16;
pub const SNAME_LEN: usize = 64;
pub const FILE_LEN: usize = 128;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHER: u8 = 1;
pub const ETHER_ADDR_LEN: u8 = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    #[error(transparent)]
    Options(#[from] OptionError),

    #[error("options do not fit in {0} packet")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_LEN],
    pub sname: [u8; SNAME_LEN],
    pub file: [u8; FILE_LEN],
    /// Raw options area, cookie included.
    pub options: Bytes,
}

impl DhcpPacket {
    /// An empty BOOTREQUEST from `hw`.
    pub fn request(xid: u32, hw: [u8; 6]) -> Self {
        let mut chaddr = [0u8; CHADDR_LEN];
        chaddr[..6].copy_from_slice(&hw);
        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHER,
            hlen: ETHER_ADDR_LEN,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0; SNAME_LEN],
            file: [0; FILE_LEN],
            options: Bytes::new(),
        }
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < DHCP_FIXED_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }
        let op = buf.get_u8();
        let htype = buf.get_u8();
        let hlen = buf.get_u8();
        let hops = buf.get_u8();
        let xid = buf.get_u32();
        let secs = buf.get_u16();
        let flags = buf.get_u16();
        let ciaddr = Ipv4Addr::from(buf.get_u32());
        let yiaddr = Ipv4Addr::from(buf.get_u32());
        let siaddr = Ipv4Addr::from(buf.get_u32());
        let giaddr = Ipv4Addr::from(buf.get_u32());
        let mut chaddr = [0u8; CHADDR_LEN];
        buf.copy_to_slice(&mut chaddr);
        let mut sname = [0u8; SNAME_LEN];
        buf.copy_to_slice(&mut sname);
        let mut file = [0u8; FILE_LEN];
        buf.copy_to_slice(&mut file);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options: Bytes::copy_from_slice(buf),
        })
    }

    /// Serializes the packet, padded to the BOOTP minimum length.
    pub fn to_bytes(&self) -> Bytes {
        let len = (DHCP_FIXED_LEN + self.options.len()).max(BOOTP_MIN_LEN);
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_slice(&self.ciaddr.octets());
        buf.put_slice(&self.yiaddr.octets());
        buf.put_slice(&self.siaddr.octets());
        buf.put_slice(&self.giaddr.octets());
        buf.put_slice(&self.chaddr);
        buf.put_slice(&self.sname);
        buf.put_slice(&self.file);
        buf.put_slice(&self.options);
        buf.resize(len, 0);
        buf.freeze()
    }

    /// The client hardware address, as long as `hlen` says.
    pub fn hw_address(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(CHADDR_LEN)]
    }

    pub fn has_cookie(&self) -> bool {
        self.options.starts_with(&MAGIC_COOKIE)
    }

    /// Decodes the options area, following option overload into `file`
    /// and then `sname`. A packet without the cookie has no options.
    pub fn decode_options(&self) -> Result<Options, OptionError> {
        let mut options = Options::new();
        if !self.has_cookie() {
            return Ok(options);
        }
        decode_options(&self.options[MAGIC_COOKIE.len()..], &mut options)?;

        if options.contains(OptionCode::MESSAGE_TYPE) {
            let overload = options
                .get(OptionCode::OPTION_OVERLOAD)
                .and_then(|v| v.first().copied())
                .unwrap_or(0);
            if overload & 1 != 0 {
                decode_options(&self.file, &mut options)?;
            }
            if overload & 2 != 0 {
                decode_options(&self.sname, &mut options)?;
            }
        }
        Ok(options)
    }

    pub fn server_name(&self) -> Option<String> {
        c_string(&self.sname)
    }

    pub fn filename(&self) -> Option<String> {
        c_string(&self.file)
    }

    /// Encodes `options` into the options area; `what` names the message
    /// for the overflow error.
    fn set_options(&mut self, options: &Options, what: &'static str) -> Result<(), PacketError> {
        let encoded = encode_options(options, OPTIONS_MIN_LEN);
        if !encoded.is_complete() {
            return Err(PacketError::Overflow(what));
        }
        self.options = encoded.bytes.freeze();
        Ok(())
    }
}

fn c_string(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// What the client asks for in every DISCOVER and REQUEST.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub xid: u32,
    pub hw: [u8; 6],
    pub requested_options: &'a [u8],
    pub send_options: &'a Options,
}

fn base_options(kind: MessageType, ctx: &RequestContext<'_>) -> Options {
    let mut options = Options::new();
    options.insert(OptionCode::MESSAGE_TYPE, vec![u8::from(kind)]);
    options.insert(
        OptionCode::PARAMETER_REQUEST_LIST,
        Bytes::copy_from_slice(ctx.requested_options),
    );
    options
}

/// Fills in user supplied options for codes the message doesn't set.
fn add_send_options(options: &mut Options, send: &Options) {
    for (code, value) in send.iter() {
        if !options.contains(code) {
            options.insert(code, value.clone());
        }
    }
}

pub fn make_discover(
    ctx: &RequestContext<'_>,
    requested: Option<Ipv4Addr>,
) -> Result<DhcpPacket, PacketError> {
    let mut options = base_options(MessageType::Discover, ctx);
    if let Some(address) = requested {
        options.insert(OptionCode::REQUESTED_ADDRESS, address.octets().to_vec());
    }
    add_send_options(&mut options, ctx.send_options);

    let mut packet = DhcpPacket::request(ctx.xid, ctx.hw);
    packet.set_options(&options, "DHCPDISCOVER")?;
    Ok(packet)
}

/// A DHCPREQUEST. `ciaddr` is set only once the address is ours
/// (renewing or rebinding); `requested` and `server_id` are set while
/// still acquiring it.
pub fn make_request(
    ctx: &RequestContext<'_>,
    ciaddr: Ipv4Addr,
    requested: Option<Ipv4Addr>,
    server_id: Option<&Bytes>,
) -> Result<DhcpPacket, PacketError> {
    let mut options = base_options(MessageType::Request, ctx);
    if let Some(server_id) = server_id {
        options.insert(OptionCode::SERVER_IDENTIFIER, server_id.clone());
    }
    if let Some(address) = requested {
        options.insert(OptionCode::REQUESTED_ADDRESS, address.octets().to_vec());
    }
    add_send_options(&mut options, ctx.send_options);

    let mut packet = DhcpPacket::request(ctx.xid, ctx.hw);
    packet.ciaddr = ciaddr;
    packet.set_options(&options, "DHCPREQUEST")?;
    Ok(packet)
}

pub fn make_decline(
    xid: u32,
    hw: [u8; 6],
    address: Ipv4Addr,
    server_id: Option<&Bytes>,
    client_id: Option<&Bytes>,
) -> Result<DhcpPacket, PacketError> {
    let mut options = Options::new();
    options.insert(OptionCode::MESSAGE_TYPE, vec![u8::from(MessageType::Decline)]);
    if let Some(server_id) = server_id {
        options.insert(OptionCode::SERVER_IDENTIFIER, server_id.clone());
    }
    options.insert(OptionCode::REQUESTED_ADDRESS, address.octets().to_vec());
    if let Some(client_id) = client_id.filter(|id| !id.is_empty()) {
        options.insert(OptionCode::CLIENT_IDENTIFIER, client_id.clone());
    }

    let mut packet = DhcpPacket::request(xid, hw);
    packet.set_options(&options, "DHCPDECLINE")?;
    Ok(packet)
}
