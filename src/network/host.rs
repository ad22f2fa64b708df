//! Queries about the local host the state machine makes while deciding
//! what to do with a lease.

use socket2::{Domain, Socket, Type};
use std::{
    ffi::{CStr, CString},
    io, mem,
    net::Ipv4Addr,
    os::fd::AsRawFd,
};

pub trait Host {
    /// `IFF_*` flags of the interface.
    fn interface_flags(&self, ifname: &str) -> io::Result<u32>;

    /// Whether `address` is configured on an interface other than `ifname`.
    fn address_in_use_elsewhere(&self, ifname: &str, address: Ipv4Addr) -> bool;

    /// IPv4 addresses currently configured on `ifname`.
    fn interface_addresses(&self, ifname: &str) -> Vec<Ipv4Addr>;
}

/// [`Host`] backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn interface_flags(&self, ifname: &str) -> io::Result<u32> {
        let name = CString::new(ifname).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let bytes = name.as_bytes_with_nul();
        if bytes.len() > libc::IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        // SAFETY: ifreq is plain data; an all-zero value is valid.
        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        // SAFETY: SIOCGIFFLAGS reads ifr_name and writes ifru_flags.
        let ret = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel filled in the flags member.
        let flags = unsafe { ifr.ifr_ifru.ifru_flags };
        Ok(u32::from(flags as u16))
    }

    fn address_in_use_elsewhere(&self, ifname: &str, address: Ipv4Addr) -> bool {
        match local_addresses() {
            Ok(addresses) => addresses
                .iter()
                .any(|(name, addr)| name != ifname && *addr == address),
            Err(e) => {
                tracing::warn!("getifaddrs failed: {}", e);
                false
            }
        }
    }

    fn interface_addresses(&self, ifname: &str) -> Vec<Ipv4Addr> {
        match local_addresses() {
            Ok(addresses) => addresses
                .into_iter()
                .filter(|(name, _)| name == ifname)
                .map(|(_, address)| address)
                .collect(),
            Err(e) => {
                tracing::warn!("getifaddrs failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Every IPv4 address configured on the host, with its interface name.
pub fn local_addresses() -> io::Result<Vec<(String, Ipv4Addr)>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs allocates the list and stores it in head.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addresses = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor points into the list getifaddrs returned, which
        // stays valid until freeifaddrs.
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null and at least a sockaddr.
        let family = i32::from(unsafe { (*ifa.ifa_addr).sa_family });
        if family != libc::AF_INET {
            continue;
        }
        // SAFETY: AF_INET addresses are sockaddr_in; ifa_name is a C string.
        let (sin, name) = unsafe {
            (
                &*(ifa.ifa_addr as *const libc::sockaddr_in),
                CStr::from_ptr(ifa.ifa_name),
            )
        };
        let address = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        addresses.push((name.to_string_lossy().into_owned(), address));
    }

    // SAFETY: head came from getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_flags() {
        if let Ok(flags) = SystemHost.interface_flags("lo") {
            assert_ne!(flags & libc::IFF_LOOPBACK as u32, 0);
        }
        assert!(SystemHost.interface_flags("no-such-if0").is_err());
    }

    #[test]
    fn test_address_in_use_elsewhere() {
        let addresses = local_addresses().unwrap_or_default();
        if let Some((_, address)) = addresses.first() {
            assert!(SystemHost.address_in_use_elsewhere("no-such-if0", *address));
        }
        assert!(!SystemHost.address_in_use_elsewhere("lo", Ipv4Addr::new(192, 0, 2, 77)));
    }

    #[test]
    fn test_interface_addresses() {
        assert!(SystemHost.interface_addresses("no-such-if0").is_empty());
        let on_lo = SystemHost.interface_addresses("lo");
        let listed = local_addresses().unwrap_or_default();
        for address in on_lo {
            assert!(listed.contains(&("lo".to_string(), address)));
        }
    }
}
