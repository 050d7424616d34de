//! Config Watcher (§4.2): translates binding-directory filesystem events
//! into Binding Store mutations, and exposes a single readable fd so the
//! Event Loop can multiplex it alongside the packet queues.
//!
//! `notify`'s cross-platform event model does not expose Linux's
//! `IN_CLOSE_WRITE` specifically (see DESIGN.md); `Create`/`Modify(Data)`
//! together are the closest approximation and are what we treat as the
//! "file closed after write" class from §4.2.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};

use nix::sys::eventfd::EventFd;
use nix::unistd::{read, write};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use crate::store::BindingStore;

/// A single filesystem-driven change, already classified into one of the
/// three event classes §4.2 describes.
enum FsChange {
    Upsert(PathBuf),
    Remove(String),
    Overflow,
}

/// Owns the underlying `notify` watcher and the eventfd bridge that lets it
/// participate in `nix::poll::poll` alongside the queue fds.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<FsChange>,
    eventfd: EventFd,
}

impl ConfigWatcher {
    pub fn new(data_path: &std::path::Path) -> std::io::Result<Self> {
        let eventfd = EventFd::from_value_and_flags(0, nix::sys::eventfd::EfdFlags::EFD_NONBLOCK)?;
        let wake_fd = eventfd.as_raw_fd();

        let (tx, rx): (Sender<FsChange>, Receiver<FsChange>) = channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            handle_event(res, &tx, wake_fd);
        })
        .map_err(std::io::Error::other)?;

        watcher
            .watch(data_path, RecursiveMode::NonRecursive)
            .map_err(std::io::Error::other)?;

        Ok(ConfigWatcher {
            _watcher: watcher,
            rx,
            eventfd,
        })
    }

    /// The fd to hand to `poll` alongside the queue adapters' fds.
    pub fn raw_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Drain every pending filesystem change and apply it to `store`
    /// (§4.10 step 1).
    pub fn process_pending(&self, store: &BindingStore) {
        // Drain the wake counter; EFD_NONBLOCK means this is a no-op if
        // nothing is pending.
        let mut buf = [0u8; 8];
        let _ = read(&self.eventfd, &mut buf);

        while let Ok(change) = self.rx.try_recv() {
            match change {
                FsChange::Upsert(path) => store.upsert(&path),
                FsChange::Remove(tap) => store.remove(&tap),
                FsChange::Overflow => store.rebuild(),
            }
        }
    }
}

fn handle_event(res: notify::Result<Event>, tx: &Sender<FsChange>, wake_fd: RawFd) {
    let change = match res {
        Err(_) => FsChange::Overflow,
        Ok(event) => match classify(&event) {
            Some(c) => c,
            None => return,
        },
    };
    if tx.send(change).is_err() {
        return;
    }
    let one: u64 = 1;
    let _ = write(unsafe { BorrowedFd::borrow_raw(wake_fd) }, &one.to_ne_bytes());
}

fn classify(event: &Event) -> Option<FsChange> {
    if event.need_rescan() {
        return Some(FsChange::Overflow);
    }
    match &event.kind {
        EventKind::Remove(_) => {
            let path = event.paths.first()?;
            let tap = path.file_name()?.to_string_lossy().to_string();
            Some(FsChange::Remove(tap))
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            let path = event.paths.first()?.clone();
            Some(FsChange::Upsert(path))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BindingStore, KeyDiscipline};
    use std::io::Write as _;
    use std::time::Duration;

    #[test]
    fn create_and_delete_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BindingStore::new(KeyDiscipline::Mac, dir.path());
        let watcher = ConfigWatcher::new(dir.path()).unwrap();

        let path = dir.path().join("vnet0");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "MAC=52:54:00:aa:bb:cc\nHOSTNAME=vm1.example.org\n").unwrap();
        drop(f);

        // Give inotify a moment to deliver the event.
        std::thread::sleep(Duration::from_millis(200));
        watcher.process_pending(&store);
        assert_eq!(store.len(), 1);

        std::fs::remove_file(&path).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        watcher.process_pending(&store);
        assert!(store.is_empty());
    }
}
