//! Tap Transmitter (§3, §4.3): one raw L2 socket per installed Binding, with
//! the reopen-on-error discipline any `AF_PACKET` sender needs once it has
//! hit `ENOBUFS` or the tap has flapped.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::libc;
use tracing::warn;

use crate::iface;

const ETH_P_ALL: u16 = 0x0003;

#[repr(C)]
struct SockaddrLl {
    sll_family: libc::c_ushort,
    sll_protocol: libc::c_ushort,
    sll_ifindex: libc::c_int,
    sll_hatype: libc::c_ushort,
    sll_pkttype: libc::c_uchar,
    sll_halen: libc::c_uchar,
    sll_addr: [libc::c_uchar; 8],
}

fn open_and_bind(tap: &str) -> Option<OwnedFd> {
    let ifindex = iface::ifindex(tap)?;

    // SOCK_RAW + ETH_P_ALL, non-blocking: the spec requires sends to never
    // wait (§5 "raw-socket sends (non-blocking, never wait)").
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK,
            (ETH_P_ALL as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        warn!(tap, "failed to open AF_PACKET socket");
        return None;
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrLl {
        sll_family: libc::AF_PACKET as libc::c_ushort,
        sll_protocol: (ETH_P_ALL as u16).to_be(),
        sll_ifindex: ifindex as libc::c_int,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: 0,
        sll_addr: [0; 8],
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrLl as *const libc::sockaddr,
            std::mem::size_of::<SockaddrLl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        warn!(tap, "failed to bind AF_PACKET socket to interface");
        return None;
    }

    Some(fd)
}

/// Raw L2 sender bound to exactly one tap. Internally reopens the socket on
/// the next send after any error (§3 Tap Transmitter lifecycle).
pub struct TapTransmitter {
    tap: String,
    fd: Mutex<Option<OwnedFd>>,
}

impl TapTransmitter {
    pub fn new(tap: String) -> Self {
        let fd = open_and_bind(&tap);
        TapTransmitter {
            tap,
            fd: Mutex::new(fd),
        }
    }

    /// Send a complete L2 frame. Non-blocking; on any error the socket is
    /// closed and eagerly reopened so the *next* send gets a fresh fd (§7
    /// error kind 6).
    pub fn send(&self, frame: &[u8]) -> bool {
        let mut guard = self.fd.lock().unwrap();
        if guard.is_none() {
            *guard = open_and_bind(&self.tap);
        }
        let Some(fd) = guard.as_ref() else {
            return false;
        };

        let ret = unsafe {
            libc::send(
                fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret < 0 {
            warn!(tap = %self.tap, "send failed, closing socket for reopen");
            *guard = None;
            return false;
        }
        if ret as usize != frame.len() {
            warn!(tap = %self.tap, sent = ret, total = frame.len(), "truncated send");
        }
        true
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.lock().unwrap().as_ref().map(|fd| fd.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_yields_no_socket_but_does_not_panic() {
        let tx = TapTransmitter::new("tapnetd-does-not-exist-0".to_string());
        assert_eq!(tx.raw_fd(), None);
        assert!(!tx.send(&[0u8; 14]));
    }
}
