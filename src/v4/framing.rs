//! Ethernet/IPv4/UDP framing for packets sent and received before the
//! interface has an address.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

pub const ETHERTYPE_IP: u16 = 0x0800;
const ETHER_HEADER_LEN: usize = 14;
const IP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_UDP: u8 = 17;
const IPTOS_LOWDELAY: u8 = 0x10;
const IP_TTL: u8 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("not an IPv4 frame")]
    NotIpv4,

    #[error("bad IP checksum")]
    BadIpChecksum,

    #[error("not a UDP datagram")]
    NotUdp,

    #[error("datagram for port {0}")]
    WrongPort(u16),

    #[error("bad UDP length {0}")]
    BadUdpLength(usize),

    #[error("bad UDP checksum")]
    BadUdpChecksum,
}

/// Adds `data` to a running ones'-complement sum, folding carries back in.
pub fn checksum(data: &[u8], mut sum: u32) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        if sum > 0xffff {
            sum -= 0xffff;
        }
    }
    if let Some(&last) = words.remainder().first() {
        sum += u32::from(last) << 8;
        if sum > 0xffff {
            sum -= 0xffff;
        }
    }
    sum
}

/// Final complement of a running sum, ready to store in a header.
pub fn wrapsum(sum: u32) -> u16 {
    !(sum as u16)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, udp_len: usize) -> u32 {
    let mut sum = checksum(&src.octets(), 0);
    sum = checksum(&dst.octets(), sum);
    sum = checksum(&[0, IPPROTO_UDP], sum);
    checksum(&(udp_len as u16).to_be_bytes(), sum)
}

/// Wraps a BOOTP payload in a broadcast Ethernet frame from `hw`.
pub fn assemble_frame(payload: &[u8], from: Ipv4Addr, to: Ipv4Addr, hw: [u8; 6]) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IP_HEADER_LEN + udp_len;
    let mut frame = BytesMut::with_capacity(ETHER_HEADER_LEN + total_len);

    frame.put_slice(&[0xff; 6]);
    frame.put_slice(&hw);
    frame.put_u16(ETHERTYPE_IP);

    let mut ip = [0u8; IP_HEADER_LEN];
    ip[0] = 0x45;
    ip[1] = IPTOS_LOWDELAY;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = IP_TTL;
    ip[9] = IPPROTO_UDP;
    ip[12..16].copy_from_slice(&from.octets());
    ip[16..20].copy_from_slice(&to.octets());
    let sum = wrapsum(checksum(&ip, 0));
    ip[10..12].copy_from_slice(&sum.to_be_bytes());
    frame.put_slice(&ip);

    let mut udp = [0u8; UDP_HEADER_LEN];
    udp[0..2].copy_from_slice(&CLIENT_PORT.to_be_bytes());
    udp[2..4].copy_from_slice(&SERVER_PORT.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    let mut sum = checksum(&udp, pseudo_header_sum(from, to, udp_len));
    sum = checksum(payload, sum);
    let sum = match wrapsum(sum) {
        0 => 0xffff,
        sum => sum,
    };
    udp[6..8].copy_from_slice(&sum.to_be_bytes());
    frame.put_slice(&udp);

    frame.put_slice(payload);
    frame.freeze()
}

/// A UDP payload received on the client port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram<'a> {
    pub from: Ipv4Addr,
    pub hw_from: [u8; 6],
    pub payload: &'a [u8],
}

/// Unwraps an Ethernet frame, checking the IP and UDP headers.
///
/// `udp_checksum_ready` is false when the kernel reports the UDP checksum
/// as not yet computed (a sender on this host, or checksum offload). The
/// field then holds only the pseudo-header sum and is not verified.
pub fn decode_frame(frame: &[u8], udp_checksum_ready: bool) -> Result<ReceivedDatagram<'_>, FrameError> {
    if frame.len() < ETHER_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IP {
        return Err(FrameError::NotIpv4);
    }
    let mut hw_from = [0u8; 6];
    hw_from.copy_from_slice(&frame[6..12]);

    let ip = &frame[ETHER_HEADER_LEN..];
    if ip[0] >> 4 != 4 {
        return Err(FrameError::NotIpv4);
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ihl < IP_HEADER_LEN || ip.len() < ihl + UDP_HEADER_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }
    if wrapsum(checksum(&ip[..ihl], 0)) != 0 {
        return Err(FrameError::BadIpChecksum);
    }
    if ip[9] != IPPROTO_UDP {
        return Err(FrameError::NotUdp);
    }
    let from = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let to = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let udp = &ip[ihl..];
    let port = u16::from_be_bytes([udp[2], udp[3]]);
    if port != CLIENT_PORT {
        return Err(FrameError::WrongPort(port));
    }
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
        return Err(FrameError::BadUdpLength(udp_len));
    }
    let udp = &udp[..udp_len];

    if udp_checksum_ready && udp[6..8] != [0, 0] {
        let sum = checksum(udp, pseudo_header_sum(from, to, udp_len));
        if wrapsum(sum) != 0 {
            return Err(FrameError::BadUdpChecksum);
        }
    }

    Ok(ReceivedDatagram {
        from,
        hw_from,
        payload: &udp[UDP_HEADER_LEN..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: [u8; 6] = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];

    /// The frame a server would send back: ports swapped.
    fn reply_frame(payload: &[u8], from: Ipv4Addr) -> Vec<u8> {
        let mut frame = assemble_frame(payload, from, Ipv4Addr::BROADCAST, HW).to_vec();
        let udp = ETHER_HEADER_LEN + IP_HEADER_LEN;
        frame[udp..udp + 2].copy_from_slice(&SERVER_PORT.to_be_bytes());
        frame[udp + 2..udp + 4].copy_from_slice(&CLIENT_PORT.to_be_bytes());
        frame
    }

    #[test]
    fn test_checksum_known_header() {
        // RFC 1071 style example header, checksum field zeroed.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(wrapsum(checksum(&header, 0)), 0xb861);
    }

    #[test]
    fn test_checksum_odd_length_and_carry() {
        assert_eq!(checksum(&[0xff, 0xff, 0x00, 0x01], 0), 0x0001);
        assert_eq!(checksum(&[0x01], 0), 0x0100);
    }

    #[test]
    fn test_assembled_frame_layout() {
        let frame = assemble_frame(b"payload", Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, HW);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &HW);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETHERTYPE_IP);
        let ip = &frame[ETHER_HEADER_LEN..ETHER_HEADER_LEN + IP_HEADER_LEN];
        assert_eq!(wrapsum(checksum(ip, 0)), 0);
        assert_eq!(frame.len(), ETHER_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN + 7);
    }

    #[test]
    fn test_decode_reply() {
        let server = Ipv4Addr::new(10, 0, 0, 1);
        let frame = reply_frame(b"hello dhcp", server);
        // Swapping the ports leaves the ones'-complement sum unchanged.
        let datagram = decode_frame(&frame, true).unwrap();
        assert_eq!(datagram.from, server);
        assert_eq!(datagram.hw_from, HW);
        assert_eq!(datagram.payload, b"hello dhcp");
    }

    #[test]
    fn test_decode_rejects_damage() {
        let server = Ipv4Addr::new(10, 0, 0, 1);
        let good = reply_frame(b"hello dhcp", server);

        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0x55;
        assert_eq!(decode_frame(&bad, true), Err(FrameError::BadUdpChecksum));

        let mut bad = good.clone();
        bad[ETHER_HEADER_LEN + 8] ^= 1;
        assert_eq!(decode_frame(&bad, true), Err(FrameError::BadIpChecksum));

        let outbound = assemble_frame(b"x", Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, HW);
        assert_eq!(decode_frame(&outbound, true), Err(FrameError::WrongPort(SERVER_PORT)));

        assert_eq!(decode_frame(&good[..30], true), Err(FrameError::TooShort(30)));
    }

    #[test]
    fn test_unfinished_udp_checksum_is_not_verified() {
        let server = Ipv4Addr::new(10, 0, 0, 1);
        let mut frame = reply_frame(b"hello dhcp", server);
        // Offloaded senders leave only the pseudo-header sum in place.
        let sum = ETHER_HEADER_LEN + IP_HEADER_LEN + 6;
        frame[sum..sum + 2].copy_from_slice(&[0x12, 0x34]);

        assert_eq!(decode_frame(&frame, true), Err(FrameError::BadUdpChecksum));
        let datagram = decode_frame(&frame, false).unwrap();
        assert_eq!(datagram.from, server);
        assert_eq!(datagram.payload, b"hello dhcp");

        // The IP header is still checked.
        frame[ETHER_HEADER_LEN + 8] ^= 1;
        assert_eq!(decode_frame(&frame, false), Err(FrameError::BadIpChecksum));
    }
}
