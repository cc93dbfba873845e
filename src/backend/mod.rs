//! Abstraction over the two kernel change-notification mechanisms: Linux's
//! level-triggered inotify, and the BSD/macOS edge-triggered kqueue. Each
//! backend owns its own native flag vocabulary; the dispatch engine only
//! ever sees [`EventTaxonomy`]-translated generic bits plus the raw native
//! bits it passes through into the handler environment unchanged.

#[cfg(target_os = "linux")]
pub mod inotify;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

use crate::event::EventTaxonomy;
use crate::registry::WatchDescriptor;
use std::path::Path;
use std::time::Duration;

/// One observed change, as reported by a backend poll. `name` is present
/// when the backend can tell which directory entry changed without a
/// directory listing diff (inotify always supplies it for non-self events);
/// it's `None` when the kqueue backend had to synthesise the event from a
/// scandir diff and `synthesised_name` carries the entry name instead.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub wd: WatchDescriptor,
    pub native_bits: u32,
    pub name: Option<std::ffi::OsString>,
    pub is_dir: bool,
}

/// A backend's capability surface: arm a watch, disarm it, block for
/// events, and expose the translation table between its native flag bits
/// and the generic taxonomy.
pub trait Backend {
    /// Registers a watch on `path` for the given native flag bits, returning
    /// an opaque descriptor the registry indexes by.
    fn add_watch(&mut self, path: &Path, native_mask: u32) -> std::io::Result<WatchDescriptor>;

    /// Disarms a previously registered watch. Idempotent: removing an
    /// already-gone descriptor is not an error, since a deleted directory
    /// can disarm its own watch before the daemon gets to it.
    fn remove_watch(&mut self, wd: WatchDescriptor) -> std::io::Result<()>;

    /// Blocks up to `timeout` (or forever, if `None`) for at least one
    /// event, returning whatever arrived. An empty result means the
    /// deadline elapsed with nothing to report.
    fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>>;

    /// This backend's generic<->native translation table.
    fn taxonomy(&self) -> &EventTaxonomy;

    /// Whether this backend requires the dispatcher to synthesise
    /// CREATE/DELETE itself by diffing directory listings (kqueue), as
    /// opposed to reporting them natively (inotify).
    fn requires_scandir_diff(&self) -> bool;
}

/// Opens whichever backend this platform supports.
#[cfg(target_os = "linux")]
pub fn open() -> std::io::Result<Box<dyn Backend>> {
    Ok(Box::new(inotify::InotifyBackend::new()?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn open() -> std::io::Result<Box<dyn Backend>> {
    Ok(Box::new(kqueue::KqueueBackend::new()?))
}

/// Lists a directory's current entry names. Used both to seed a node's
/// baseline at watch-install time and to produce the "fresh" side of a
/// later diff — a missing or unreadable directory scans as empty rather
/// than erroring, since it may have been removed between the watch going
/// up and the scan running.
pub fn scan_children(dir: &Path) -> std::collections::HashSet<String> {
    use std::collections::HashSet;

    let mut current = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                current.insert(name.to_string());
            }
        }
    }
    current
}

/// Diffs a cached child-name set against a fresh scan, producing
/// synthetic CREATE/DELETE raw events. Shared by any backend whose kernel
/// interface reports "this directory changed" without saying how.
///
/// `previous` must have been seeded from [`scan_children`] at watch-install
/// time; diffing against an empty baseline after the fact would manufacture
/// a synthetic CREATE for every file that already existed before the watch
/// went up.
pub fn diff_children(
    wd: WatchDescriptor,
    previous: &std::collections::HashSet<String>,
    dir: &Path,
    create_bits: u32,
    delete_bits: u32,
) -> (std::collections::HashSet<String>, Vec<RawEvent>) {
    let current = scan_children(dir);

    let mut events = Vec::new();
    for added in current.difference(previous) {
        let is_dir = dir.join(added).is_dir();
        events.push(RawEvent {
            wd,
            native_bits: create_bits,
            name: Some(added.into()),
            is_dir,
        });
    }
    for removed in previous.difference(&current) {
        events.push(RawEvent {
            wd,
            native_bits: delete_bits,
            name: Some(removed.into()),
            is_dir: false,
        });
    }

    (current, events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_children_reports_additions_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept"), b"").unwrap();
        let previous: std::collections::HashSet<String> =
            ["kept".to_string(), "gone".to_string()].into_iter().collect();

        std::fs::write(dir.path().join("added"), b"").unwrap();

        let (current, events) = diff_children(1, &previous, dir.path(), 0x01, 0x08);
        assert!(current.contains("kept"));
        assert!(current.contains("added"));
        assert!(!current.contains("gone"));

        let added: Vec<_> = events
            .iter()
            .filter(|e| e.native_bits == 0x01)
            .map(|e| e.name.clone().unwrap())
            .collect();
        assert_eq!(added, vec![std::ffi::OsString::from("added")]);

        let removed: Vec<_> = events
            .iter()
            .filter(|e| e.native_bits == 0x08)
            .map(|e| e.name.clone().unwrap())
            .collect();
        assert_eq!(removed, vec![std::ffi::OsString::from("gone")]);
    }
}
