//! DHCP option storage and the TLV option codec.
//!
//! Options are kept in a map keyed by a validated [`OptionCode`]. Repeated
//! occurrences of a code while decoding are concatenated (RFC 3396), so a
//! decoded set never holds two entries for the same code.

use bytes::{BufMut, Bytes, BytesMut};
use dhcproto::v4::MessageType;
use std::{borrow::Cow, collections::BTreeMap, fmt, net::Ipv4Addr};
use thiserror::Error;

pub const DHO_PAD: u8 = 0;
pub const DHO_END: u8 = 255;

/// The four bytes that introduce the options area of a DHCP packet.
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Room for options in a minimal 576 byte packet, cookie included.
pub const OPTIONS_MIN_LEN: usize = 576 - 264;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option code {0} is reserved")]
    InvalidCode(u8),

    #[error("option {name} ({len}) larger than buffer")]
    Truncated { name: String, len: usize },

    #[error("option {0} has no length field")]
    MissingLength(String),
}

/// A DHCP option code in the range 1..=254.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionCode(u8);

impl OptionCode {
    pub const SUBNET_MASK: OptionCode = OptionCode(1);
    pub const TIME_OFFSET: OptionCode = OptionCode(2);
    pub const ROUTERS: OptionCode = OptionCode(3);
    pub const DOMAIN_NAME_SERVERS: OptionCode = OptionCode(6);
    pub const HOST_NAME: OptionCode = OptionCode(12);
    pub const DOMAIN_NAME: OptionCode = OptionCode(15);
    pub const INTERFACE_MTU: OptionCode = OptionCode(26);
    pub const BROADCAST_ADDRESS: OptionCode = OptionCode(28);
    pub const STATIC_ROUTES: OptionCode = OptionCode(33);
    pub const NIS_DOMAIN: OptionCode = OptionCode(40);
    pub const REQUESTED_ADDRESS: OptionCode = OptionCode(50);
    pub const LEASE_TIME: OptionCode = OptionCode(51);
    pub const OPTION_OVERLOAD: OptionCode = OptionCode(52);
    pub const MESSAGE_TYPE: OptionCode = OptionCode(53);
    pub const SERVER_IDENTIFIER: OptionCode = OptionCode(54);
    pub const PARAMETER_REQUEST_LIST: OptionCode = OptionCode(55);
    pub const MESSAGE: OptionCode = OptionCode(56);
    pub const RENEWAL_TIME: OptionCode = OptionCode(58);
    pub const REBINDING_TIME: OptionCode = OptionCode(59);
    pub const CLIENT_IDENTIFIER: OptionCode = OptionCode(61);
    pub const TFTP_SERVER_NAME: OptionCode = OptionCode(66);
    pub const BOOTFILE_NAME: OptionCode = OptionCode(67);
    pub const DOMAIN_SEARCH: OptionCode = OptionCode(119);
    pub const CLASSLESS_STATIC_ROUTES: OptionCode = OptionCode(121);
    pub const CLASSLESS_MS_STATIC_ROUTES: OptionCode = OptionCode(249);

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The option's name as written in lease files, `option-N` if unknown.
    pub fn name(self) -> Cow<'static, str> {
        match lookup(self.0) {
            Some((name, _)) => Cow::Borrowed(name),
            None => Cow::Owned(format!("option-{}", self.0)),
        }
    }

    /// Format string driving pretty printing and parsing.
    pub fn format(self) -> &'static str {
        lookup(self.0).map(|(_, format)| format).unwrap_or("X")
    }

    /// Whether the option has an entry in the option table.
    pub fn is_known(self) -> bool {
        lookup(self.0).is_some()
    }

    /// Resolves a name (case-insensitive) or an `option-N` spelling.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(number) = name.strip_prefix("option-") {
            return number.parse::<u8>().ok().and_then(|c| c.try_into().ok());
        }
        OPTION_TABLE
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(code, _, _)| OptionCode(*code))
    }
}

impl TryFrom<u8> for OptionCode {
    type Error = OptionError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            DHO_PAD | DHO_END => Err(OptionError::InvalidCode(code)),
            _ => Ok(OptionCode(code)),
        }
    }
}

impl From<OptionCode> for u8 {
    fn from(code: OptionCode) -> u8 {
        code.0
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn lookup(code: u8) -> Option<(&'static str, &'static str)> {
    OPTION_TABLE
        .binary_search_by_key(&code, |(c, _, _)| *c)
        .ok()
        .map(|i| (OPTION_TABLE[i].1, OPTION_TABLE[i].2))
}

// (code, name, format), sorted by code.
static OPTION_TABLE: &[(u8, &str, &str)] = &[
    (1, "subnet-mask", "I"),
    (2, "time-offset", "l"),
    (3, "routers", "IA"),
    (4, "time-servers", "IA"),
    (5, "ien116-name-servers", "IA"),
    (6, "domain-name-servers", "IA"),
    (7, "log-servers", "IA"),
    (8, "cookie-servers", "IA"),
    (9, "lpr-servers", "IA"),
    (10, "impress-servers", "IA"),
    (11, "resource-location-servers", "IA"),
    (12, "host-name", "t"),
    (13, "boot-size", "S"),
    (14, "merit-dump", "t"),
    (15, "domain-name", "t"),
    (16, "swap-server", "I"),
    (17, "root-path", "t"),
    (18, "extensions-path", "t"),
    (19, "ip-forwarding", "f"),
    (20, "non-local-source-routing", "f"),
    (21, "policy-filter", "IIA"),
    (22, "max-dgram-reassembly", "S"),
    (23, "default-ip-ttl", "B"),
    (24, "path-mtu-aging-timeout", "L"),
    (25, "path-mtu-plateau-table", "SA"),
    (26, "interface-mtu", "S"),
    (27, "all-subnets-local", "f"),
    (28, "broadcast-address", "I"),
    (29, "perform-mask-discovery", "f"),
    (30, "mask-supplier", "f"),
    (31, "router-discovery", "f"),
    (32, "router-solicitation-address", "I"),
    (33, "static-routes", "IIA"),
    (34, "trailer-encapsulation", "f"),
    (35, "arp-cache-timeout", "L"),
    (36, "ieee802-3-encapsulation", "f"),
    (37, "default-tcp-ttl", "B"),
    (38, "tcp-keepalive-interval", "L"),
    (39, "tcp-keepalive-garbage", "f"),
    (40, "nis-domain", "t"),
    (41, "nis-servers", "IA"),
    (42, "ntp-servers", "IA"),
    (43, "vendor-encapsulated-options", "X"),
    (44, "netbios-name-servers", "IA"),
    (45, "netbios-dd-server", "IA"),
    (46, "netbios-node-type", "B"),
    (47, "netbios-scope", "t"),
    (48, "font-servers", "IA"),
    (49, "x-display-manager", "IA"),
    (50, "dhcp-requested-address", "I"),
    (51, "dhcp-lease-time", "L"),
    (52, "dhcp-option-overload", "B"),
    (53, "dhcp-message-type", "B"),
    (54, "dhcp-server-identifier", "I"),
    (55, "dhcp-parameter-request-list", "BA"),
    (56, "dhcp-message", "t"),
    (57, "dhcp-max-message-size", "S"),
    (58, "dhcp-renewal-time", "L"),
    (59, "dhcp-rebinding-time", "L"),
    (60, "dhcp-class-identifier", "t"),
    (61, "dhcp-client-identifier", "X"),
    (64, "nisplus-domain", "t"),
    (65, "nisplus-servers", "IA"),
    (66, "tftp-server-name", "t"),
    (67, "bootfile-name", "t"),
    (68, "mobile-ip-home-agent", "IA"),
    (69, "smtp-server", "IA"),
    (70, "pop-server", "IA"),
    (71, "nntp-server", "IA"),
    (72, "www-server", "IA"),
    (73, "finger-server", "IA"),
    (74, "irc-server", "IA"),
    (75, "streettalk-server", "IA"),
    (76, "streettalk-directory-assistance-server", "IA"),
    (77, "user-class", "t"),
    (119, "domain-search", "X"),
    (121, "classless-static-routes", "CIA"),
    (249, "classless-ms-static-routes", "CIA"),
    (252, "autoproxy-script", "t"),
];

/// The option set of a packet or lease. At most one value per code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<OptionCode, Bytes>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: OptionCode) -> Option<&Bytes> {
        self.0.get(&code)
    }

    pub fn contains(&self, code: OptionCode) -> bool {
        self.0.contains_key(&code)
    }

    /// Replaces any previous value for `code`.
    pub fn insert(&mut self, code: OptionCode, value: impl Into<Bytes>) {
        self.0.insert(code, value.into());
    }

    /// Appends `value` to any previous value for `code`.
    pub fn insert_merge(&mut self, code: OptionCode, value: &[u8]) {
        match self.0.get_mut(&code) {
            Some(existing) => {
                let mut merged = BytesMut::with_capacity(existing.len() + value.len());
                merged.extend_from_slice(existing);
                merged.extend_from_slice(value);
                *existing = merged.freeze();
            }
            None => {
                self.0.insert(code, Bytes::copy_from_slice(value));
            }
        }
    }

    pub fn remove(&mut self, code: OptionCode) -> Option<Bytes> {
        self.0.remove(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OptionCode, &Bytes)> {
        self.0.iter().map(|(code, value)| (*code, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(OptionCode::MESSAGE_TYPE) {
            Some(value) if !value.is_empty() => Some(MessageType::from(value[0])),
            _ => None,
        }
    }

    /// A single IPv4 address value; `None` unless exactly four bytes.
    pub fn get_addr(&self, code: OptionCode) -> Option<Ipv4Addr> {
        let value = self.get(code)?;
        let octets: [u8; 4] = value.as_ref().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn get_u32(&self, code: OptionCode) -> Option<u32> {
        let value = self.get(code)?;
        let bytes: [u8; 4] = value.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn get_u16(&self, code: OptionCode) -> Option<u16> {
        let value = self.get(code)?;
        let bytes: [u8; 2] = value.as_ref().try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }
}

impl FromIterator<(OptionCode, Bytes)> for Options {
    fn from_iter<T: IntoIterator<Item = (OptionCode, Bytes)>>(iter: T) -> Self {
        Options(iter.into_iter().collect())
    }
}

/// Scans `buffer` for option TLVs, merging them into `options`.
///
/// Scanning stops at END or at the end of the buffer. A length byte or
/// value running past the buffer fails the whole scan.
pub fn decode_options(buffer: &[u8], options: &mut Options) -> Result<(), OptionError> {
    let mut pos = 0;
    while pos < buffer.len() && buffer[pos] != DHO_END {
        let raw = buffer[pos];
        if raw == DHO_PAD {
            pos += 1;
            continue;
        }
        let code = OptionCode(raw);

        let Some(&len) = buffer.get(pos + 1) else {
            return Err(OptionError::MissingLength(code.name().into_owned()));
        };
        let len = usize::from(len);
        let start = pos + 2;
        if start + len > buffer.len() {
            return Err(OptionError::Truncated {
                name: code.name().into_owned(),
                len,
            });
        }

        let mut value = &buffer[start..start + len];
        if code.format().starts_with('t') {
            while let [rest @ .., 0] = value {
                value = rest;
            }
        }
        options.insert_merge(code, value);
        pos = start + len;
    }
    Ok(())
}

/// Result of [`encode_options`].
#[derive(Debug)]
pub struct EncodedOptions {
    /// Cookie followed by the option TLVs, and END when it fit.
    pub bytes: BytesMut,
    /// Offset of the start of the last option copied.
    pub last: Option<usize>,
}

impl EncodedOptions {
    /// True when every option fit and END was appended.
    pub fn is_complete(&self) -> bool {
        matches!(self.last, Some(i) if self.bytes.get(i) == Some(&DHO_END))
    }
}

/// Writes `options` into at most `capacity` bytes.
///
/// The message type goes first after the cookie, then the remaining codes
/// in ascending order. Values longer than 255 bytes are split into
/// consecutive TLVs with the same code. Encoding stops at the first option
/// that would not fit.
pub fn encode_options(options: &Options, capacity: usize) -> EncodedOptions {
    let mut buf = BytesMut::with_capacity(capacity);
    let mut last = None;

    buf.put_slice(&MAGIC_COOKIE);
    if let Some(kind) = options.get(OptionCode::MESSAGE_TYPE).and_then(|v| v.first()) {
        buf.put_slice(&[OptionCode::MESSAGE_TYPE.get(), 1, *kind]);
    }

    for (code, value) in options.iter() {
        if code == OptionCode::MESSAGE_TYPE {
            continue;
        }
        let length = value.len();
        if buf.len() + length + 2 * length.div_ceil(255) >= capacity {
            return EncodedOptions { bytes: buf, last };
        }
        last = Some(buf.len());
        for chunk in value.chunks(255) {
            buf.put_u8(code.get());
            buf.put_u8(chunk.len() as u8);
            buf.put_slice(chunk);
        }
    }

    if buf.len() < capacity {
        last = Some(buf.len());
        buf.put_u8(DHO_END);
    }
    EncodedOptions { bytes: buf, last }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(c: u8) -> OptionCode {
        OptionCode::try_from(c).unwrap()
    }

    #[test]
    fn test_option_code_rejects_pad_and_end() {
        assert_eq!(OptionCode::try_from(0), Err(OptionError::InvalidCode(0)));
        assert_eq!(OptionCode::try_from(255), Err(OptionError::InvalidCode(255)));
        assert_eq!(OptionCode::try_from(1), Ok(OptionCode::SUBNET_MASK));
    }

    #[test]
    fn test_option_names() {
        assert_eq!(OptionCode::ROUTERS.name(), "routers");
        assert_eq!(code(200).name(), "option-200");
        assert_eq!(code(200).format(), "X");
        assert_eq!(OptionCode::from_name("Domain-Name-Servers"), Some(OptionCode::DOMAIN_NAME_SERVERS));
        assert_eq!(OptionCode::from_name("option-200"), Some(code(200)));
        assert_eq!(OptionCode::from_name("option-255"), None);
        assert_eq!(OptionCode::from_name("no-such-option"), None);
    }

    #[test]
    fn test_option_table_is_sorted() {
        assert!(OPTION_TABLE.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_decode_skips_pad_and_stops_at_end() {
        let buf = [0, 0, 1, 4, 255, 255, 255, 0, 255, 3, 4, 10, 0, 0, 1];
        let mut options = Options::new();
        decode_options(&buf, &mut options).unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options.get_addr(OptionCode::SUBNET_MASK), Some(Ipv4Addr::new(255, 255, 255, 0)));
    }

    #[test]
    fn test_decode_rejects_truncated_value() {
        let mut options = Options::new();
        let err = decode_options(&[3, 8, 10, 0, 0, 1], &mut options).unwrap_err();
        assert!(matches!(err, OptionError::Truncated { len: 8, .. }));

        let err = decode_options(&[3], &mut options).unwrap_err();
        assert!(matches!(err, OptionError::MissingLength(_)));
    }

    #[test]
    fn test_decode_merges_fragments_and_strips_text_nuls() {
        let buf = [15, 4, b'e', b'x', 0, 0, 6, 4, 1, 1, 1, 1, 6, 4, 2, 2, 2, 2, 15, 4, b'.', b'o', b'r', b'g'];
        let mut options = Options::new();
        decode_options(&buf, &mut options).unwrap();
        assert_eq!(options.get(OptionCode::DOMAIN_NAME).unwrap().as_ref(), b"ex.org");
        assert_eq!(options.get(OptionCode::DOMAIN_NAME_SERVERS).unwrap().as_ref(), &[1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_encode_puts_message_type_first() {
        let mut options = Options::new();
        options.insert(OptionCode::PARAMETER_REQUEST_LIST, vec![1, 3, 6]);
        options.insert(OptionCode::MESSAGE_TYPE, vec![1]);
        options.insert(OptionCode::SUBNET_MASK, vec![255, 255, 255, 0]);

        let encoded = encode_options(&options, OPTIONS_MIN_LEN);
        assert!(encoded.is_complete());
        assert_eq!(&encoded.bytes[..4], &MAGIC_COOKIE);
        assert_eq!(&encoded.bytes[4..7], &[53, 1, 1]);
        assert_eq!(&encoded.bytes[7..13], &[1, 4, 255, 255, 255, 0]);
        assert_eq!(&encoded.bytes[13..18], &[55, 3, 1, 3, 6]);
        assert_eq!(encoded.bytes[18], DHO_END);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut options = Options::new();
        options.insert(OptionCode::MESSAGE_TYPE, vec![3]);
        options.insert(OptionCode::REQUESTED_ADDRESS, vec![10, 0, 0, 5]);
        options.insert(OptionCode::CLIENT_IDENTIFIER, vec![1, 0, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);
        options.insert(OptionCode::HOST_NAME, &b"tether"[..]);

        let encoded = encode_options(&options, OPTIONS_MIN_LEN);
        assert!(encoded.is_complete());
        let mut decoded = Options::new();
        decode_options(&encoded.bytes[4..], &mut decoded).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_long_values_are_fragmented() {
        let value: Vec<u8> = (0..280u32).map(|i| (i % 251) as u8).collect();
        let mut options = Options::new();
        options.insert(code(43), value.clone());

        let encoded = encode_options(&options, OPTIONS_MIN_LEN);
        assert!(encoded.is_complete());
        assert_eq!(encoded.bytes[4], 43);
        assert_eq!(encoded.bytes[5], 255);
        assert_eq!(encoded.bytes[4 + 2 + 255], 43);
        assert_eq!(encoded.bytes[4 + 2 + 255 + 1], 25);

        let mut decoded = Options::new();
        decode_options(&encoded.bytes[4..], &mut decoded).unwrap();
        assert_eq!(decoded.get(code(43)).unwrap().as_ref(), value.as_slice());
    }

    #[test]
    fn test_encode_stops_at_last_complete_option() {
        let mut options = Options::new();
        options.insert(code(43), vec![7u8; 200]);
        options.insert(code(60), vec![b'a'; 200]);

        let encoded = encode_options(&options, OPTIONS_MIN_LEN);
        assert!(!encoded.is_complete());
        assert_eq!(encoded.last, Some(4));
        assert_eq!(encoded.bytes.len(), 4 + 2 + 200);
    }
}
