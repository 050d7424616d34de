//! Interface Introspector (§4.4): per-interface hardware-address and
//! ifindex queries against the kernel, via the same `ioctl`-on-a-throwaway-
//! socket technique `tun.rs` uses for `TUNSETIFF` in the teacher repo.

use nix::libc::{self, IFNAMSIZ, c_char, c_short};
use std::os::unix::io::AsRawFd;
use tracing::error;

use crate::eui64::Mac;

const SIOCGIFHWADDR: nix::libc::Ioctl = 0x8927;
const SIOCGIFINDEX: nix::libc::Ioctl = 0x8933;

#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [c_char; IFNAMSIZ],
    sa_family: c_short,
    sa_data: [u8; 14],
}

#[repr(C)]
struct IfReqIndex {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_ifindex: libc::c_int,
}

fn name_to_ifr(name: &str) -> [c_char; IFNAMSIZ] {
    let mut buf = [0 as c_char; IFNAMSIZ];
    for (i, byte) in name.bytes().enumerate() {
        if i >= IFNAMSIZ - 1 {
            break;
        }
        buf[i] = byte as c_char;
    }
    buf
}

fn control_socket() -> std::io::Result<std::net::UdpSocket> {
    // Any local datagram socket works as an ioctl handle; IPv4 loopback
    // avoids depending on any particular interface being up.
    std::net::UdpSocket::bind("127.0.0.1:0")
}

/// Query the hardware (MAC) address of `iface`. Returns `None` if the
/// interface does not exist or the query fails (§4.4, §7 error kind 2).
pub fn hw_addr(iface: &str) -> Option<Mac> {
    let sock = control_socket().map_err(|e| error!(iface, error = %e, "failed to open control socket")).ok()?;
    let mut ifr = IfReqHwAddr {
        ifr_name: name_to_ifr(iface),
        sa_family: 0,
        sa_data: [0; 14],
    };
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFHWADDR, &mut ifr) };
    if ret < 0 {
        error!(iface, "SIOCGIFHWADDR failed, interface is probably gone");
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&ifr.sa_data[..6]);
    Some(mac)
}

/// Query the kernel ifindex of `iface`. Returns `None` if the interface does
/// not exist or the query fails (§4.4, §7 error kind 2).
pub fn ifindex(iface: &str) -> Option<u32> {
    let sock = control_socket().map_err(|e| error!(iface, error = %e, "failed to open control socket")).ok()?;
    let mut ifr = IfReqIndex {
        ifr_name: name_to_ifr(iface),
        ifr_ifindex: 0,
    };
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), SIOCGIFINDEX, &mut ifr) };
    if ret < 0 {
        error!(iface, "SIOCGIFINDEX failed, interface is probably gone");
        return None;
    }
    if ifr.ifr_ifindex < 0 {
        return None;
    }
    Some(ifr.ifr_ifindex as u32)
}
