//! Event Loop (§4.10): the single thread that multiplexes the Config
//! Watcher fd, up to four Packet Queue Adapter fds, and signal delivery,
//! dispatching each dequeued packet to its responder and issuing exactly
//! one verdict per packet.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{info, warn};

use crate::config::Config;
use crate::iface;
use crate::queue::{Family, Packet, QueueAdapter, Verdict};
use crate::ra::RaScheduler;
use crate::responders::{dhcpv4, dhcpv6, ns, rs};
use crate::store::BindingStore;
use crate::watcher::ConfigWatcher;

/// Packets drained from one queue fd per wake, before moving on to the
/// next ready fd (§4.3/§4.10 "bounded batch per wake").
const MAX_BATCH: usize = 64;

pub struct EventLoop {
    store: Arc<BindingStore>,
    watcher: ConfigWatcher,
    dhcp: Option<QueueAdapter>,
    rs: Option<QueueAdapter>,
    ns: Option<QueueAdapter>,
    dhcpv6: Option<QueueAdapter>,
    ra: RaScheduler,
    cfg: Config,
    signalfd: SignalFd,
    next_ra: Instant,
}

impl EventLoop {
    pub fn new(cfg: Config, store: Arc<BindingStore>, watcher: ConfigWatcher) -> std::io::Result<Self> {
        let dhcp = if cfg.dhcp.enable_dhcp {
            Some(QueueAdapter::open(cfg.dhcp.dhcp_queue, Family::Inet)?)
        } else {
            None
        };

        let (rs_adapter, ns_adapter, dhcpv6_adapter) = if cfg.ipv6.enable_ipv6 {
            let rs_adapter = QueueAdapter::open(cfg.ipv6.rs_queue, Family::Inet6)?;
            let ns_adapter = QueueAdapter::open(cfg.ipv6.ns_queue, Family::Inet6)?;
            let dhcpv6_adapter = if cfg.ipv6.enable_dhcpv6 {
                let queue_num = cfg.ipv6.effective_dhcpv6_queue(cfg.dhcp.dhcp_queue);
                Some(QueueAdapter::open(queue_num, Family::Inet6)?)
            } else {
                None
            };
            (Some(rs_adapter), Some(ns_adapter), dhcpv6_adapter)
        } else {
            (None, None, None)
        };

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGUSR1);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let signalfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK)?;

        let ra = RaScheduler::new(cfg.ipv6.clone());
        let next_ra = Instant::now() + Duration::from_secs(cfg.ipv6.ra_period as u64);

        Ok(EventLoop {
            store,
            watcher,
            dhcp,
            rs: rs_adapter,
            ns: ns_adapter,
            dhcpv6: dhcpv6_adapter,
            ra,
            cfg,
            signalfd,
            next_ra,
        })
    }

    /// Run until a termination signal arrives. Returns once shut down
    /// cleanly (§5 "shutdown via signal + next multiplex wake").
    pub fn run(&mut self) {
        info!("event loop starting");
        loop {
            let timeout = self.next_ra.saturating_duration_since(Instant::now());
            let poll_ms = timeout.as_millis().min(60_000) as u16;

            let watcher_fd = unsafe { BorrowedFd::borrow_raw(self.watcher.raw_fd()) };
            let signal_fd = unsafe { BorrowedFd::borrow_raw(self.signalfd.as_raw_fd()) };

            let mut fds = vec![
                PollFd::new(watcher_fd, PollFlags::POLLIN),
                PollFd::new(signal_fd, PollFlags::POLLIN),
            ];
            // Indices into `fds` for each optional queue, fixed up after
            // borrowing their fds so the borrows outlive the poll call.
            let dhcp_fd = self.dhcp.as_ref().map(|q| unsafe { BorrowedFd::borrow_raw(q.raw_fd()) });
            let rs_fd = self.rs.as_ref().map(|q| unsafe { BorrowedFd::borrow_raw(q.raw_fd()) });
            let ns_fd = self.ns.as_ref().map(|q| unsafe { BorrowedFd::borrow_raw(q.raw_fd()) });
            let dhcpv6_fd = self.dhcpv6.as_ref().map(|q| unsafe { BorrowedFd::borrow_raw(q.raw_fd()) });
            let dhcp_idx = dhcp_fd.map(|fd| { fds.push(PollFd::new(fd, PollFlags::POLLIN)); fds.len() - 1 });
            let rs_idx = rs_fd.map(|fd| { fds.push(PollFd::new(fd, PollFlags::POLLIN)); fds.len() - 1 });
            let ns_idx = ns_fd.map(|fd| { fds.push(PollFd::new(fd, PollFlags::POLLIN)); fds.len() - 1 });
            let dhcpv6_idx = dhcpv6_fd.map(|fd| { fds.push(PollFd::new(fd, PollFlags::POLLIN)); fds.len() - 1 });

            // Interrupted waits are benign: just retry without touching the
            // RA deadline (§4.10).
            if poll(&mut fds, PollTimeout::from(poll_ms)).is_err() {
                continue;
            }

            let ready = |i: usize| fds[i].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));

            if ready(0) {
                self.watcher.process_pending(&self.store);
            }
            if ready(1) {
                if self.drain_signals() {
                    break;
                }
            }
            if let Some(i) = dhcp_idx {
                if ready(i) {
                    self.drain_dhcp();
                }
            }
            if let Some(i) = rs_idx {
                if ready(i) {
                    self.drain_rs();
                }
            }
            if let Some(i) = ns_idx {
                if ready(i) {
                    self.drain_ns();
                }
            }
            if let Some(i) = dhcpv6_idx {
                if ready(i) {
                    self.drain_dhcpv6();
                }
            }

            if Instant::now() >= self.next_ra {
                self.ra.trigger(self.store.clone());
                self.next_ra = Instant::now() + Duration::from_secs(self.cfg.ipv6.ra_period as u64);
            }
        }

        info!("event loop shutting down");
        self.ra.shutdown();
    }

    /// Read every pending signal. Returns `true` if a termination signal was
    /// seen.
    fn drain_signals(&self) -> bool {
        let mut terminate = false;
        while let Ok(Some(info)) = self.signalfd.read_signal() {
            match info.ssi_signo as i32 {
                s if s == Signal::SIGTERM as i32 || s == Signal::SIGINT as i32 => {
                    info!("termination signal received");
                    terminate = true;
                }
                s if s == Signal::SIGUSR1 as i32 => {
                    self.store.dump();
                }
                _ => {}
            }
        }
        terminate
    }

    fn drain_dhcp(&mut self) {
        let Some(queue) = self.dhcp.as_mut() else { return };
        let packets = queue.process_pending(MAX_BATCH);
        for packet in packets {
            let verdict = dispatch(&self.store, &packet, |entry, indev_mac| {
                dhcpv4::handle(&packet.data, &entry.binding, &indev_mac, &self.cfg.dhcp)
            });
            queue.set_verdict(&packet, verdict);
        }
    }

    fn drain_rs(&mut self) {
        let Some(queue) = self.rs.as_mut() else { return };
        let packets = queue.process_pending(MAX_BATCH);
        for packet in packets {
            let verdict = dispatch(&self.store, &packet, |entry, indev_mac| {
                rs::handle(&packet.data, &entry.binding, &indev_mac, &self.cfg.ipv6)
            });
            queue.set_verdict(&packet, verdict);
        }
    }

    fn drain_ns(&mut self) {
        let Some(queue) = self.ns.as_mut() else { return };
        let packets = queue.process_pending(MAX_BATCH);
        for packet in packets {
            let verdict = dispatch(&self.store, &packet, |entry, indev_mac| {
                ns::handle(&packet.data, &entry.binding, &indev_mac)
            });
            queue.set_verdict(&packet, verdict);
        }
    }

    fn drain_dhcpv6(&mut self) {
        let Some(queue) = self.dhcpv6.as_mut() else { return };
        let packets = queue.process_pending(MAX_BATCH);
        for packet in packets {
            let verdict = dispatch(&self.store, &packet, |entry, indev_mac| {
                dhcpv6::handle(&packet.data, &entry.binding, &indev_mac, &self.cfg.ipv6)
            });
            queue.set_verdict(&packet, verdict);
        }
    }
}

/// Shared dispatch shape for all four responders (§4.10 step 2, §8
/// "Unknown tap" scenario): look the binding up by ifindex, ACCEPT if
/// absent, otherwise DROP and let `respond` attempt a reply.
fn dispatch(
    store: &BindingStore,
    packet: &Packet,
    respond: impl FnOnce(&crate::store::Entry, crate::eui64::Mac) -> Option<Vec<u8>>,
) -> Verdict {
    // physindev is the tap's own ifindex; indev is whatever bridge or bond
    // sits above it. For a bridged tap (the normal libvirt/KVM deployment)
    // only physindev identifies the tap itself, so it takes priority.
    let Some(entry) = store.lookup(packet.physindev.or(packet.indev), None) else {
        return Verdict::Accept;
    };

    let Some(indev_name) = entry.binding.indev.as_deref() else {
        warn!(tap = %entry.binding.tap, "no INDEV configured, cannot source a reply");
        return Verdict::Drop;
    };
    let Some(indev_mac) = iface::hw_addr(indev_name) else {
        warn!(tap = %entry.binding.tap, indev = indev_name, "upstream interface unavailable, removing binding");
        store.remove(&entry.binding.tap);
        return Verdict::Drop;
    };

    if let Some(frame) = respond(entry.as_ref(), indev_mac) {
        entry.transmitter.send(&frame);
    }
    Verdict::Drop
}
