//! Human readable rendering of option values, and the reverse.
//!
//! The rendering is driven by each option's format string (see
//! [`OptionCode::format`]) and is what the lease database stores.

use super::options::OptionCode;
use bytes::Bytes;
use std::{fmt::Write as _, net::Ipv4Addr};
use thiserror::Error;

/// Longest `search` list resolv.conf accepts, in bytes and in names.
pub const DOMAIN_SEARCH_LEN: usize = 1024;
pub const DOMAIN_SEARCH_CNT: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("{name}: {len} bytes do not match format '{format}'")]
    Length {
        name: String,
        format: &'static str,
        len: usize,
    },

    #[error("{name}: invalid prefix width {width}")]
    PrefixWidth { name: String, width: u8 },

    #[error("{name}: cannot parse '{text}'")]
    Value { name: String, text: String },
}

/// Renders `value` according to the format of `code`.
///
/// With `punct`, text is quoted and array elements are separated by
/// commas, which is the form written to lease files.
pub fn pretty_print(code: OptionCode, value: &[u8], punct: bool) -> Result<String, FormatError> {
    let format = code.format();
    match format {
        "t" => Ok(print_text(value, punct)),
        "X" if value.iter().all(|b| is_printable(*b)) => Ok(print_text(value, punct)),
        "X" => Ok(value
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")),
        _ => print_hunks(code, format, value, punct),
    }
}

fn print_hunks(
    code: OptionCode,
    format: &'static str,
    value: &[u8],
    punct: bool,
) -> Result<String, FormatError> {
    let (elements, array) = match format.strip_suffix('A') {
        Some(elements) => (elements, true),
        None => (format, false),
    };
    let length_error = || FormatError::Length {
        name: code.name().into_owned(),
        format,
        len: value.len(),
    };

    let mut out = String::new();
    let mut data = value;
    loop {
        if !out.is_empty() {
            out.push(if punct { ',' } else { ' ' });
        }
        for (i, element) in elements.chars().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            data = print_element(code, element, data, &mut out)?.ok_or_else(length_error)?;
        }
        if !array || data.is_empty() {
            break;
        }
    }

    if !data.is_empty() {
        return Err(length_error());
    }
    Ok(out)
}

/// Prints one element, returning the unread remainder, or `None` if
/// `data` is too short.
fn print_element<'a>(
    code: OptionCode,
    element: char,
    data: &'a [u8],
    out: &mut String,
) -> Result<Option<&'a [u8]>, FormatError> {
    let width = match element {
        'I' | 'l' | 'L' => 4,
        's' | 'S' => 2,
        'b' | 'B' | 'f' | 'C' => 1,
        _ => 0,
    };
    if data.len() < width {
        return Ok(None);
    }
    let (head, rest) = data.split_at(width);

    // write! into a String cannot fail
    let _ = match element {
        'I' => write!(out, "{}", Ipv4Addr::new(head[0], head[1], head[2], head[3])),
        'l' => write!(out, "{}", i32::from_be_bytes([head[0], head[1], head[2], head[3]])),
        'L' => write!(out, "{}", u32::from_be_bytes([head[0], head[1], head[2], head[3]])),
        's' => write!(out, "{}", i16::from_be_bytes([head[0], head[1]])),
        'S' => write!(out, "{}", u16::from_be_bytes([head[0], head[1]])),
        'b' => write!(out, "{}", head[0] as i8),
        'B' => write!(out, "{}", head[0]),
        'f' => write!(out, "{}", head[0] != 0),
        'C' => {
            let prefix = head[0];
            if prefix > 32 {
                return Err(FormatError::PrefixWidth {
                    name: code.name().into_owned(),
                    width: prefix,
                });
            }
            let significant = usize::from(prefix).div_ceil(8);
            if rest.len() < significant {
                return Ok(None);
            }
            let mut octets = [0u8; 4];
            octets[..significant].copy_from_slice(&rest[..significant]);
            let _ = write!(out, "{}/{}", Ipv4Addr::from(octets), prefix);
            return Ok(Some(&rest[significant..]));
        }
        _ => return Ok(None),
    };
    Ok(Some(rest))
}

fn is_printable(b: u8) -> bool {
    (0x20..0x7f).contains(&b)
}

pub fn print_text(value: &[u8], punct: bool) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    if punct {
        out.push('"');
    }
    for (i, &b) in value.iter().enumerate() {
        match b {
            b'"' | b'\'' | b'$' | b'`' | b'\\' => {
                out.push('\\');
                out.push(char::from(b));
            }
            b if is_printable(b) => out.push(char::from(b)),
            0 if i + 1 == value.len() => {}
            b => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    if punct {
        out.push('"');
    }
    out
}

/// Parses the textual form produced by [`pretty_print`] back into bytes.
pub fn parse_option_value(code: OptionCode, text: &str) -> Result<Bytes, FormatError> {
    let text = text.trim();
    let format = code.format();
    let value_error = || FormatError::Value {
        name: code.name().into_owned(),
        text: text.to_string(),
    };

    match format {
        "t" => unquote(text).ok_or_else(value_error),
        "X" if text.starts_with('"') => unquote(text).ok_or_else(value_error),
        "X" if text.is_empty() => Ok(Bytes::new()),
        "X" => text
            .split(':')
            .map(|h| u8::from_str_radix(h.trim(), 16).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from)
            .ok_or_else(value_error),
        _ => {
            let (elements, array) = match format.strip_suffix('A') {
                Some(elements) => (elements, true),
                None => (format, false),
            };
            let hunks: Vec<&str> = if array {
                text.split(',').map(str::trim).collect()
            } else {
                vec![text]
            };
            let mut out = Vec::new();
            for hunk in hunks {
                let fields: Vec<&str> = hunk.split_whitespace().collect();
                if fields.len() != elements.len() {
                    return Err(value_error());
                }
                for (element, field) in elements.chars().zip(fields) {
                    parse_element(element, field, &mut out).ok_or_else(value_error)?;
                }
            }
            Ok(Bytes::from(out))
        }
    }
}

fn parse_element(element: char, field: &str, out: &mut Vec<u8>) -> Option<()> {
    match element {
        'I' => out.extend_from_slice(&field.parse::<Ipv4Addr>().ok()?.octets()),
        'l' => out.extend_from_slice(&field.parse::<i32>().ok()?.to_be_bytes()),
        'L' => out.extend_from_slice(&field.parse::<u32>().ok()?.to_be_bytes()),
        's' => out.extend_from_slice(&field.parse::<i16>().ok()?.to_be_bytes()),
        'S' => out.extend_from_slice(&field.parse::<u16>().ok()?.to_be_bytes()),
        'b' => out.push(field.parse::<i8>().ok()? as u8),
        'B' => out.push(field.parse::<u8>().ok()?),
        'f' => match field {
            "true" | "on" => out.push(1),
            "false" | "off" => out.push(0),
            _ => return None,
        },
        'C' => {
            let (addr, prefix) = field.split_once('/')?;
            let addr: Ipv4Addr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            if prefix > 32 {
                return None;
            }
            out.push(prefix);
            out.extend_from_slice(&addr.octets()[..usize::from(prefix).div_ceil(8)]);
        }
        _ => return None,
    }
    Some(())
}

/// Undoes the quoting and escaping of [`print_text`]. Unquoted input is
/// taken literally.
pub fn unquote(text: &str) -> Option<Bytes> {
    let inner = match text.strip_prefix('"') {
        Some(rest) => rest.strip_suffix('"')?,
        None => return Some(Bytes::copy_from_slice(text.as_bytes())),
    };

    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let escaped = bytes.get(i + 1..i + 4);
        match escaped {
            Some(digits) if digits.iter().all(|d| (b'0'..=b'7').contains(d)) => {
                let octal = std::str::from_utf8(digits).ok()?;
                out.push(u8::from_str_radix(octal, 8).ok()?);
                i += 4;
            }
            _ => {
                out.push(*bytes.get(i + 1)?);
                i += 2;
            }
        }
    }
    Some(Bytes::from(out))
}

/// Decodes an RFC 1035 encoded name list (option 119) into
/// space-separated names. Compression pointers are resolved against the
/// start of the option value.
pub fn decode_domain_search(data: &[u8]) -> Option<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (name, next) = read_name(data, pos)?;
        names.push(name);
        pos = next;
    }
    Some(names.join(" "))
}

fn read_name(data: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos)?;
        match len & 0xc0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = data.get(pos + 1..pos + 1 + usize::from(len))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + usize::from(len);
            }
            0xc0 => {
                let low = *data.get(pos + 1)?;
                let target = usize::from(len & 0x3f) << 8 | usize::from(low);
                jumps += 1;
                if target >= data.len() || jumps > data.len() {
                    return None;
                }
                resume.get_or_insert(pos + 2);
                pos = target;
            }
            _ => return None,
        }
    }

    let name = labels.join(".");
    if name.is_empty() {
        return None;
    }
    Some((name, resume.unwrap_or(pos)))
}

/// Whether `name` is an acceptable host name.
///
/// Labels start and end with an alphanumeric character and otherwise hold
/// alphanumerics, `-` or `_`.
pub fn is_hostname(name: &str) -> bool {
    let bytes = name.as_bytes();
    let mut warned = false;
    for (i, &ch) in bytes.iter().enumerate() {
        if ch == b'.' {
            continue;
        }
        let prev = if i == 0 { b'.' } else { bytes[i - 1] };
        let next = bytes.get(i + 1).copied().unwrap_or(b'.');
        if prev == b'.' || next == b'.' {
            if !ch.is_ascii_alphanumeric() {
                return false;
            }
        } else if !ch.is_ascii_alphanumeric() && ch != b'-' && ch != b'_' {
            return false;
        } else if ch == b'_' && !warned {
            tracing::warn!("host name {} contains an underscore which violates RFC 952", name);
            warned = true;
        }
    }
    !name.is_empty()
}

/// Whether `names` is a whitespace separated list of between one and six
/// host names that fits a resolv.conf `search` line.
pub fn is_hostname_list(names: &str) -> bool {
    if names.len() >= DOMAIN_SEARCH_LEN {
        return false;
    }
    let mut count = 0;
    for name in names.split([' ', '\t']).filter(|n| !n.is_empty()) {
        if !is_hostname(name) {
            return false;
        }
        count += 1;
    }
    count > 0 && count <= DOMAIN_SEARCH_CNT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(c: u8) -> OptionCode {
        OptionCode::try_from(c).unwrap()
    }

    #[test]
    fn test_print_addresses_and_integers() {
        let servers = [10, 0, 0, 1, 10, 0, 0, 2];
        assert_eq!(pretty_print(OptionCode::DOMAIN_NAME_SERVERS, &servers, true).unwrap(), "10.0.0.1,10.0.0.2");
        assert_eq!(pretty_print(OptionCode::DOMAIN_NAME_SERVERS, &servers, false).unwrap(), "10.0.0.1 10.0.0.2");
        assert_eq!(pretty_print(OptionCode::LEASE_TIME, &3600u32.to_be_bytes(), true).unwrap(), "3600");
        assert_eq!(pretty_print(OptionCode::TIME_OFFSET, &(-3600i32).to_be_bytes(), true).unwrap(), "-3600");
        assert_eq!(pretty_print(OptionCode::INTERFACE_MTU, &1500u16.to_be_bytes(), true).unwrap(), "1500");
        assert_eq!(pretty_print(code(19), &[1], true).unwrap(), "true");
        assert_eq!(pretty_print(code(55), &[1, 3, 6], true).unwrap(), "1,3,6");
    }

    #[test]
    fn test_print_rejects_wrong_lengths() {
        assert!(pretty_print(OptionCode::SUBNET_MASK, &[255, 255, 255], true).is_err());
        assert!(pretty_print(OptionCode::SUBNET_MASK, &[255, 255, 255, 0, 0], true).is_err());
        assert!(pretty_print(OptionCode::ROUTERS, &[], true).is_err());
        assert!(pretty_print(OptionCode::STATIC_ROUTES, &[10, 0, 0, 0, 10, 0, 0], true).is_err());
    }

    #[test]
    fn test_print_text_escapes() {
        assert_eq!(pretty_print(OptionCode::HOST_NAME, b"host", true).unwrap(), "\"host\"");
        assert_eq!(pretty_print(OptionCode::HOST_NAME, b"a\"b$", false).unwrap(), "a\\\"b\\$");
        assert_eq!(pretty_print(OptionCode::HOST_NAME, b"a\x01b", false).unwrap(), "a\\001b");
    }

    #[test]
    fn test_print_hex_and_cidr() {
        let id = [1, 0, 0x0c, 0x29, 0xa8, 0x92, 0xf4];
        assert_eq!(pretty_print(OptionCode::CLIENT_IDENTIFIER, &id, true).unwrap(), "01:00:0c:29:a8:92:f4");

        let routes = [8, 10, 192, 168, 1, 1, 0, 192, 168, 1, 254];
        assert_eq!(
            pretty_print(OptionCode::CLASSLESS_STATIC_ROUTES, &routes, true).unwrap(),
            "10.0.0.0/8 192.168.1.1,0.0.0.0/0 192.168.1.254"
        );
        assert!(pretty_print(OptionCode::CLASSLESS_STATIC_ROUTES, &[33, 0, 0, 0, 0], true).is_err());
    }

    #[test]
    fn test_parse_reverses_print() {
        let cases: Vec<(OptionCode, Vec<u8>)> = vec![
            (OptionCode::DOMAIN_NAME_SERVERS, vec![10, 0, 0, 1, 10, 0, 0, 2]),
            (OptionCode::DOMAIN_NAME, b"example.org".to_vec()),
            (OptionCode::HOST_NAME, b"we\"ird\\name\x07".to_vec()),
            (OptionCode::CLIENT_IDENTIFIER, vec![1, 0, 0x0c, 0x29, 0xa8, 0x92, 0xf4]),
            (OptionCode::CLASSLESS_STATIC_ROUTES, vec![24, 10, 1, 2, 10, 0, 0, 1, 0, 10, 0, 0, 1]),
            (OptionCode::STATIC_ROUTES, vec![10, 9, 0, 0, 10, 0, 0, 1]),
            (OptionCode::TIME_OFFSET, (-5i32).to_be_bytes().to_vec()),
            (code(19), vec![0]),
        ];
        for (code, value) in cases {
            let text = pretty_print(code, &value, true).unwrap();
            assert_eq!(parse_option_value(code, &text).unwrap().as_ref(), value.as_slice(), "{text}");
        }
    }

    #[test]
    fn test_parse_accepts_config_spellings() {
        let value = parse_option_value(OptionCode::DOMAIN_NAME_SERVERS, "1.1.1.1, 8.8.8.8").unwrap();
        assert_eq!(value.as_ref(), &[1, 1, 1, 1, 8, 8, 8, 8]);
        assert!(parse_option_value(OptionCode::SUBNET_MASK, "255.255.0").is_err());
        assert!(parse_option_value(OptionCode::LEASE_TIME, "-1").is_err());
    }

    #[test]
    fn test_decode_domain_search_with_pointers() {
        // example.org, then eng.(pointer to example.org)
        let mut data = vec![7];
        data.extend_from_slice(b"example");
        data.push(3);
        data.extend_from_slice(b"org");
        data.push(0);
        data.push(3);
        data.extend_from_slice(b"eng");
        data.extend_from_slice(&[0xc0, 0x00]);
        assert_eq!(decode_domain_search(&data).unwrap(), "example.org eng.example.org");

        assert_eq!(decode_domain_search(&[0xc0, 0x00]), None);
        assert_eq!(decode_domain_search(&[5, b'a']), None);
    }

    #[test]
    fn test_hostname_rules() {
        assert!(is_hostname("example.org"));
        assert!(is_hostname("a-b_c.example"));
        assert!(!is_hostname("-bad.example"));
        assert!(!is_hostname("bad-.example"));
        assert!(!is_hostname("sp ace"));
        assert!(!is_hostname(""));
        assert!(is_hostname_list("a.org b.org"));
        assert!(!is_hostname_list("a b c d e f g"));
        assert!(!is_hostname_list("   "));
        assert!(!is_hostname_list("ok.org bad!.org"));
    }
}
