//! Binding Store (§3, §4.1): the in-memory `key -> Binding` map, rebuilt at
//! startup and mutated live by the Config Watcher.
//!
//! Mirrors the teacher's `reactor::registry::ReactorRegistry` shape: a
//! primary map plus whichever secondary index the key discipline calls for,
//! all behind a single `RwLock` so lookups never block the packet path for
//! long and the RA scheduler can cheaply snapshot the current bindings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::binding::{self, Binding};
use crate::eui64::Mac;
use crate::iface;
use crate::transmit::TapTransmitter;

/// Which identity the Packet Queue Adapter can recover from a bare packet,
/// and therefore which key the store is indexed by (§3 "Binding Store").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDiscipline {
    /// The queue facility reports the physical input device's ifindex.
    Ifindex,
    /// Fallback: only the guest MAC is recoverable from the packet itself.
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Ifindex(u32),
    Mac(Mac),
}

/// A binding plus the raw-socket endpoint bound to its tap.
pub struct Entry {
    pub binding: Binding,
    pub transmitter: TapTransmitter,
}

pub struct BindingStore {
    discipline: KeyDiscipline,
    data_path: PathBuf,
    entries: RwLock<HashMap<Key, Arc<Entry>>>,
}

impl BindingStore {
    pub fn new(discipline: KeyDiscipline, data_path: impl Into<PathBuf>) -> Self {
        BindingStore {
            discipline,
            data_path: data_path.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn discipline(&self) -> KeyDiscipline {
        self.discipline
    }

    /// Clear the store and rescan `data_path/*` from scratch (§4.1 `rebuild`,
    /// also the Config Watcher's response to an inotify queue overflow).
    pub fn rebuild(&self) {
        info!("rebuilding binding store from scratch");
        self.entries.write().unwrap().clear();
        let Ok(dir) = std::fs::read_dir(&self.data_path) else {
            warn!(path = %self.data_path.display(), "binding directory unreadable");
            return;
        };
        for entry in dir.flatten() {
            self.upsert(&entry.path());
        }
    }

    /// Parse and (re)install the binding at `path`. A no-op (net change: a
    /// later call replaces an earlier one for the same key) if the file is
    /// invalid or the tap has no matching live interface.
    pub fn upsert(&self, path: &Path) {
        let Some(binding) = binding::parse(path) else {
            return;
        };

        let Some(key) = self.key_for(&binding) else {
            warn!(tap = %binding.tap, "stale configuration, no such interface");
            return;
        };

        let transmitter = TapTransmitter::new(binding.tap.clone());
        let entry = Arc::new(Entry { binding, transmitter });

        debug!(tap = %entry.binding.tap, "installing binding");
        let mut entries = self.entries.write().unwrap();
        if let Key::Mac(mac) = key {
            if entries.contains_key(&Key::Mac(mac)) {
                debug!(mac = %crate::eui64::format_mac(&mac), "duplicate MAC binding, overwriting (documented last-write-wins)");
            }
        }
        entries.insert(key, entry);
    }

    /// Evict every binding whose tap matches `tap` (§4.1 `remove`, §4.4 on
    /// ifindex-resolution failure).
    pub fn remove(&self, tap: &str) {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.binding.tap != tap);
        if entries.len() != before {
            info!(tap, "removed binding");
        }
    }

    /// Look up the binding for an incoming packet, using whichever identity
    /// the active [`KeyDiscipline`] calls for.
    pub fn lookup(&self, ifindex: Option<u32>, mac: Option<&Mac>) -> Option<Arc<Entry>> {
        let key = match self.discipline {
            KeyDiscipline::Ifindex => Key::Ifindex(ifindex?),
            KeyDiscipline::Mac => Key::Mac(*mac?),
        };
        self.entries.read().unwrap().get(&key).cloned()
    }

    /// A cheap copy of the current bindings, used by the RA scheduler so its
    /// walk is never invalidated by a concurrent filesystem-driven mutation
    /// (§5).
    pub fn snapshot(&self) -> Vec<Arc<Entry>> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dump the current table to the log (SIGUSR1 handler, §5/§6).
    pub fn dump(&self) {
        info!("--- binding table dump ---");
        for entry in self.entries.read().unwrap().values() {
            let b = &entry.binding;
            info!(
                tap = %b.tap,
                hostname = %b.hostname,
                mac = %crate::eui64::format_mac(&b.mac),
                ip = ?b.ip,
                "binding"
            );
        }
        info!("--- end binding table dump ---");
    }

    fn key_for(&self, binding: &Binding) -> Option<Key> {
        match self.discipline {
            KeyDiscipline::Ifindex => iface::ifindex(&binding.tap).map(Key::Ifindex),
            KeyDiscipline::Mac => Some(Key::Mac(binding.mac)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_binding(dir: &Path, tap: &str, mac: &str, hostname: &str) {
        let path = dir.join(tap);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "MAC={mac}\nHOSTNAME={hostname}\n").unwrap();
    }

    #[test]
    fn mac_keyed_store_round_trips_a_binding() {
        let dir = tempfile::tempdir().unwrap();
        write_binding(dir.path(), "vnet0", "52:54:00:aa:bb:cc", "vm1.example.org");

        let store = BindingStore::new(KeyDiscipline::Mac, dir.path());
        store.rebuild();
        assert_eq!(store.len(), 1);

        let mac = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];
        let found = store.lookup(None, Some(&mac)).expect("binding present");
        assert_eq!(found.binding.tap, "vnet0");

        assert!(store.lookup(None, Some(&[0, 0, 0, 0, 0, 0])).is_none());
    }

    #[test]
    fn remove_evicts_by_tap_name() {
        let dir = tempfile::tempdir().unwrap();
        write_binding(dir.path(), "vnet0", "52:54:00:aa:bb:cc", "vm1.example.org");

        let store = BindingStore::new(KeyDiscipline::Mac, dir.path());
        store.rebuild();
        assert_eq!(store.len(), 1);

        store.remove("vnet0");
        assert!(store.is_empty());
    }

    #[test]
    fn invalid_binding_file_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vnet1");
        std::fs::write(&path, "HOSTNAME=vm1.example.org\n").unwrap(); // no MAC

        let store = BindingStore::new(KeyDiscipline::Mac, dir.path());
        store.upsert(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_mac_overwrites_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_binding(dir.path(), "vnet0", "52:54:00:aa:bb:cc", "vm1.example.org");
        write_binding(dir.path(), "vnet1", "52:54:00:aa:bb:cc", "vm2.example.org");

        let store = BindingStore::new(KeyDiscipline::Mac, dir.path());
        store.rebuild();
        assert_eq!(store.len(), 1);
    }
}
