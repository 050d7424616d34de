//! RA Scheduler (§4.9): periodically walks the Binding Store and broadcasts
//! an unsolicited Router Advertisement on every IPv6-enabled binding's tap.
//!
//! The walk itself runs on a background thread so a slow tap (an
//! `ENOBUFS`-stalled send, say) can never make the Event Loop miss a packet
//! deadline; the Event Loop only decides *when* to kick a walk off.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::config::Ipv6Config;
use crate::iface;
use crate::responders::rs::build_ra;
use crate::store::BindingStore;

pub struct RaScheduler {
    cfg: Ipv6Config,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RaScheduler {
    pub fn new(cfg: Ipv6Config) -> Self {
        RaScheduler {
            cfg,
            handle: Mutex::new(None),
        }
    }

    /// Kick off one broadcast walk over every current binding. Blocks only
    /// long enough to join whatever the previous walk's thread was doing --
    /// by the time `ra_period` elapses again that walk has long finished in
    /// every normal case (§4.9, §5).
    pub fn trigger(&self, store: Arc<BindingStore>) {
        let mut guard = self.handle.lock().unwrap();
        if let Some(prev) = guard.take() {
            let _ = prev.join();
        }

        let cfg = self.cfg.clone();
        *guard = Some(std::thread::spawn(move || broadcast_all(&store, &cfg)));
    }

    /// Join the last dispatched walk so no broadcast is left in flight past
    /// process exit (§9 "RA worker lifecycle").
    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn broadcast_all(store: &BindingStore, cfg: &Ipv6Config) {
    for entry in store.snapshot() {
        let binding = &entry.binding;
        if !binding.has_ipv6() {
            continue;
        }
        let Some(subnet) = binding.subnet6 else { continue };
        let Some(indev) = binding.indev.as_deref() else {
            warn!(tap = %binding.tap, "RA: no INDEV configured, skipping broadcast");
            continue;
        };
        let Some(indev_mac) = iface::hw_addr(indev) else {
            warn!(tap = %binding.tap, indev, "RA: upstream interface unavailable, removing binding");
            store.remove(&binding.tap);
            continue;
        };

        let ll = crate::eui64::make_ll64(&indev_mac);
        let all_nodes: std::net::Ipv6Addr = "ff02::1".parse().unwrap();
        const ALL_NODES_MAC: [u8; 6] = [0x33, 0x33, 0x00, 0x00, 0x00, 0x01];
        let frame = build_ra(
            &indev_mac,
            &ll,
            &all_nodes,
            &ALL_NODES_MAC,
            subnet,
            binding.gateway6,
            binding.mtu,
            &cfg.nameservers,
            cfg.ra_period,
            true, // Other Configuration always set on the unsolicited broadcast
        );
        entry.transmitter.send(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyDiscipline;

    #[test]
    fn shutdown_with_no_prior_trigger_is_a_no_op() {
        let scheduler = RaScheduler::new(Ipv6Config {
            enable_ipv6: true,
            enable_dhcpv6: false,
            ra_period: 300,
            rs_queue: 10,
            ns_queue: 11,
            dhcpv6_queue: None,
            nameservers: vec![],
            domains: vec![],
        });
        scheduler.shutdown();
    }

    #[test]
    fn trigger_and_shutdown_on_an_empty_store_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BindingStore::new(KeyDiscipline::Mac, dir.path()));
        let scheduler = RaScheduler::new(Ipv6Config {
            enable_ipv6: true,
            enable_dhcpv6: false,
            ra_period: 300,
            rs_queue: 10,
            ns_queue: 11,
            dhcpv6_queue: None,
            nameservers: vec![],
            domains: vec![],
        });
        scheduler.trigger(store);
        scheduler.shutdown();
    }
}
