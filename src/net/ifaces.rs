use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::ptr;

use log::trace;

use crate::error::{Error, Result};

/// One usable IPv4 interface, as reported by `getifaddrs(3)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Present when the interface can broadcast.
    pub broadcast: Option<Ipv4Addr>,
    pub is_up: bool,
    pub is_loopback: bool,
    pub supports_broadcast: bool,
}

/// Enumerates the IPv4 interfaces traffic can actually leave through:
/// loopback and down interfaces are skipped.
pub fn interfaces() -> Result<Vec<Interface>> {
    let mut list: *mut libc::ifaddrs = ptr::null_mut();
    // SAFETY: `getifaddrs` fills `list` on success; freed below.
    if unsafe { libc::getifaddrs(&mut list) } == -1 {
        return Err(Error::from_io(io::Error::last_os_error()));
    }

    let mut out = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: the list nodes stay valid until `freeifaddrs`.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        let Some(addr) = v4_of(entry.ifa_addr) else {
            continue;
        };
        let flags = entry.ifa_flags as libc::c_int;
        let is_up = flags & libc::IFF_UP != 0;
        let is_loopback = flags & libc::IFF_LOOPBACK != 0;
        let supports_broadcast = flags & libc::IFF_BROADCAST != 0;
        if !is_up || is_loopback {
            continue;
        }

        // SAFETY: `ifa_name` is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let netmask = v4_of(entry.ifa_netmask).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let broadcast = if supports_broadcast {
            v4_of(broadcast_field(entry))
        } else {
            None
        };

        trace!("interface {}: {} mask {}", name, addr, netmask);
        out.push(Interface {
            name,
            addr,
            netmask,
            broadcast,
            is_up,
            is_loopback,
            supports_broadcast,
        });
    }

    // SAFETY: `list` came from `getifaddrs` and is walked no further.
    unsafe { libc::freeifaddrs(list) };
    Ok(out)
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn broadcast_field(entry: &libc::ifaddrs) -> *mut libc::sockaddr {
    entry.ifa_ifu
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn broadcast_field(entry: &libc::ifaddrs) -> *mut libc::sockaddr {
    entry.ifa_dstaddr
}

fn v4_of(addr: *mut libc::sockaddr) -> Option<Ipv4Addr> {
    if addr.is_null() {
        return None;
    }
    // SAFETY: non-null `getifaddrs` pointers reference valid sockaddrs.
    let family = unsafe { (*addr).sa_family };
    if family as libc::c_int != libc::AF_INET {
        return None;
    }
    // SAFETY: family checked, so this is a `sockaddr_in`.
    let addr = unsafe { &*(addr as *const libc::sockaddr_in) };
    Some(Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()))
}

#[cfg(test)]
mod tests {
    use super::interfaces;

    #[test]
    fn skips_loopback_and_down() {
        // The machine may legitimately have no usable interface; what must
        // hold is that nothing returned is loopback or down.
        let list = interfaces().unwrap();
        for iface in &list {
            assert!(iface.is_up, "{} reported down", iface.name);
            assert!(!iface.is_loopback, "{} is loopback", iface.name);
            if iface.broadcast.is_some() {
                assert!(iface.supports_broadcast);
            }
        }
    }
}
