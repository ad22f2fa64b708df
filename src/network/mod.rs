//! Sockets and interface lookups.
//!
//! Before the interface has an address, DHCP traffic travels as raw
//! Ethernet frames over an `AF_PACKET` socket. Renewals, which go to a
//! known server, use an ordinary UDP socket bound to the device.

pub mod host;
pub mod kernel;
pub mod netlink;
pub mod routes;

use crate::{error::TetherError, v4::framing::ETHERTYPE_IP};
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    ffi::CString,
    fs,
    io, mem,
    net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket},
    os::fd::AsRawFd,
    ptr,
};
use thiserror::Error;
use tokio::{io::unix::AsyncFd, net::UdpSocket as TokioUdpSocket};

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to address")]
    BindSocket(#[source] io::Error),

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to enable PACKET_AUXDATA on socket")]
    SetAuxData(#[source] io::Error),

    #[error("Failed to register socket with the runtime")]
    ConvertToTokio(#[source] io::Error),
}

/// The interface the client manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub hw: [u8; 6],
    /// Network name for wireless interfaces. Always empty on Linux, where
    /// the SSID is not available through the routing socket.
    pub ssid: Bytes,
    pub table: u32,
}

impl Interface {
    pub fn lookup(name: &str) -> Result<Self, TetherError> {
        let invalid = || TetherError::InterfaceInvalid(name.to_string());
        let c_name = CString::new(name).map_err(|_| invalid())?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(invalid());
        }
        let text = fs::read_to_string(format!("/sys/class/net/{name}/address")).map_err(|_| invalid())?;
        Ok(Self {
            name: name.to_string(),
            index,
            hw: parse_mac(text.trim())?,
            ssid: Bytes::new(),
            table: netlink::RT_TABLE_MAIN,
        })
    }
}

/// Parses `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(text: &str) -> Result<[u8; 6], TetherError> {
    let mut hw = [0u8; 6];
    let mut parts = text.split(':');
    for byte in hw.iter_mut() {
        let part = parts.next().ok_or_else(|| TetherError::MacParse(text.to_string()))?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| TetherError::MacParse(text.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(TetherError::MacParse(text.to_string()));
    }
    Ok(hw)
}

fn link_layer_addr(ifindex: u32, hw: [u8; 6]) -> SockAddr {
    // SAFETY: an all-zero sockaddr_storage is valid, and sockaddr_ll fits
    // inside it with compatible alignment.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let ll = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
        (*ll).sll_family = libc::AF_PACKET as u16;
        (*ll).sll_protocol = ETHERTYPE_IP.to_be();
        (*ll).sll_ifindex = ifindex as i32;
        (*ll).sll_halen = 6;
        (&mut (*ll).sll_addr)[..6].copy_from_slice(&hw);
        SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
    }
}

const FRAME_BUFFER_LEN: usize = 4096;

const PACKET_AUXDATA: libc::c_int = 8;
/// `tp_status` bit: the UDP checksum is left for hardware to fill in.
const TP_STATUS_CSUMNOTREADY: u32 = 1 << 3;

/// A frame read from the [`PacketSocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub data: Bytes,
    /// False when the kernel flagged the checksum as not computed yet.
    pub checksum_ready: bool,
}

/// Whether a receive error on the packet socket ends the client. Errors
/// that only mean the link or the kernel's buffers had a bad moment
/// (`ENETDOWN`, `ENOBUFS` and the like) are logged and the read retried.
pub fn recv_error_is_fatal(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EFAULT | libc::EINVAL | libc::ENOTSOCK | libc::ENODEV | libc::ENXIO)
    )
}

fn recv_with_status(socket: &Socket, buf: &mut [u8]) -> io::Result<ReceivedFrame> {
    // Room for one tpacket_auxdata control message.
    let mut control = [0u64; 8];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: an all-zero msghdr is valid.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: msg points at buffers that outlive the call.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut checksum_ready = true;
    // SAFETY: the kernel wrote msg_controllen bytes of control messages
    // into `control`, and the CMSG macros stay inside them.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_PACKET && (*cmsg).cmsg_type == PACKET_AUXDATA {
                let status = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const u32);
                checksum_ready = status & TP_STATUS_CSUMNOTREADY == 0;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let n = n as usize;
    Ok(ReceivedFrame {
        data: Bytes::copy_from_slice(&buf[..n.min(buf.len())]),
        checksum_ready,
    })
}

/// Raw Ethernet frames carrying IPv4 on one interface.
pub struct PacketSocket {
    fd: AsyncFd<Socket>,
    ifindex: u32,
    buf: Vec<u8>,
}

impl PacketSocket {
    /// Opens and binds the socket. Must run inside the runtime.
    pub fn open(interface: &Interface) -> Result<Self, SocketError> {
        let protocol = Protocol::from(i32::from(ETHERTYPE_IP.to_be()));
        let socket = Socket::new(Domain::from(libc::AF_PACKET), Type::RAW, Some(protocol))
            .map_err(SocketError::CreateSocket)?;
        socket
            .bind(&link_layer_addr(interface.index, [0; 6]))
            .map_err(SocketError::BindSocket)?;
        let enable: libc::c_int = 1;
        // SAFETY: the descriptor is open and the option value is a c_int.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_AUXDATA,
                &enable as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::SetAuxData(io::Error::last_os_error()));
        }
        socket.set_nonblocking(true).map_err(SocketError::SetNonBlocking)?;
        Ok(Self {
            fd: AsyncFd::new(socket).map_err(SocketError::ConvertToTokio)?,
            ifindex: interface.index,
            buf: vec![0; FRAME_BUFFER_LEN],
        })
    }

    /// Sends a complete Ethernet frame to the broadcast address.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let to = link_layer_addr(self.ifindex, [0xff; 6]);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| fd.get_ref().send_to(frame, &to)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Waits for the next frame. Cancel safe.
    pub async fn recv_frame(&mut self) -> io::Result<ReceivedFrame> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            match guard.try_io(|fd| recv_with_status(fd.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Creates a new `tokio::net::UdpSocket` bound to a specific network device and port.
///
/// Used for unicast renewals; replies are still read from the
/// [`PacketSocket`].
///
/// # Arguments
/// * `interface` - The name of the network interface (e.g., "eth0").
/// * `port` - The port number to bind the socket to.
pub fn new_tokio_socket_bound_to_device(
    interface: &str,
    port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    let socket2 =
        Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(SocketError::CreateSocket)?;

    socket2
        .set_broadcast(true)
        .map_err(SocketError::SetBroadcast)?;

    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    // SAFETY: the descriptor is open and the option value is the
    // interface name with its length.
    let ret = unsafe {
        libc::setsockopt(
            socket2.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket2.bind(&addr.into()).map_err(SocketError::BindSocket)?;

    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}
