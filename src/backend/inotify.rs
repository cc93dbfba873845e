//! Linux backend: one inotify watch descriptor per watched directory,
//! level-triggered and reporting CREATE/DELETE natively — no scandir diff
//! needed.

use super::{Backend, RawEvent};
use crate::event::{EventTaxonomy, GenericEvent};
use crate::registry::WatchDescriptor;
use inotify::{EventMask as InotifyEventMask, Inotify, WatchDescriptor as InWd, WatchMask};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

const IN_ACCESS: u32 = 0x0000_0001;
const IN_MODIFY: u32 = 0x0000_0002;
const IN_ATTRIB: u32 = 0x0000_0004;
const IN_CLOSE_WRITE: u32 = 0x0000_0008;
const IN_MOVED_FROM: u32 = 0x0000_0040;
const IN_MOVED_TO: u32 = 0x0000_0080;
const IN_CREATE: u32 = 0x0000_0100;
const IN_DELETE: u32 = 0x0000_0200;
const IN_DELETE_SELF: u32 = 0x0000_0400;

/// `DIREVENT_SYSEV_NAME` vocabulary for this backend.
static NATIVE_NAMES: Lazy<Vec<(&'static str, u32)>> = Lazy::new(|| {
    vec![
        ("IN_ACCESS", IN_ACCESS),
        ("IN_MODIFY", IN_MODIFY),
        ("IN_ATTRIB", IN_ATTRIB),
        ("IN_CLOSE_WRITE", IN_CLOSE_WRITE),
        ("IN_MOVED_FROM", IN_MOVED_FROM),
        ("IN_MOVED_TO", IN_MOVED_TO),
        ("IN_CREATE", IN_CREATE),
        ("IN_DELETE", IN_DELETE),
        ("IN_DELETE_SELF", IN_DELETE_SELF),
    ]
});

fn taxonomy_seed() -> [(GenericEvent, u32); 4] {
    [
        (GenericEvent::Create, IN_CREATE | IN_MOVED_TO),
        (GenericEvent::Write, IN_MODIFY | IN_CLOSE_WRITE),
        (GenericEvent::Attrib, IN_ATTRIB),
        (GenericEvent::Delete, IN_DELETE | IN_DELETE_SELF | IN_MOVED_FROM),
    ]
}

pub struct InotifyBackend {
    inner: Inotify,
    taxonomy: EventTaxonomy,
    next_id: WatchDescriptor,
    by_id: HashMap<WatchDescriptor, InWd>,
    by_native: HashMap<InWd, WatchDescriptor>,
}

impl InotifyBackend {
    pub fn new() -> std::io::Result<Self> {
        Ok(InotifyBackend {
            inner: Inotify::init()?,
            taxonomy: EventTaxonomy::new(taxonomy_seed(), NATIVE_NAMES.clone()),
            next_id: 1,
            by_id: HashMap::new(),
            by_native: HashMap::new(),
        })
    }

    fn watch_mask(native: u32) -> WatchMask {
        // inotify's WatchMask bits line up with the raw IN_* constants, so a
        // direct bits round-trip is exact rather than an enumerated match.
        WatchMask::from_bits_truncate(native)
    }
}

impl Backend for InotifyBackend {
    fn add_watch(&mut self, path: &Path, native_mask: u32) -> std::io::Result<WatchDescriptor> {
        let wd = self
            .inner
            .watches()
            .add(path, Self::watch_mask(native_mask))?;
        let id = self.next_id;
        self.next_id += 1;
        self.by_id.insert(id, wd.clone());
        self.by_native.insert(wd, id);
        Ok(id)
    }

    fn remove_watch(&mut self, wd: WatchDescriptor) -> std::io::Result<()> {
        if let Some(native) = self.by_id.remove(&wd) {
            self.by_native.remove(&native);
            // A directory that vanished out from under us already dropped
            // the kernel's watch; ignore the resulting EINVAL.
            let _ = self.inner.watches().remove(native);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<RawEvent>> {
        // Plain libc::poll rather than nix's wrapper: nix's PollFd/timeout
        // types have churned across versions, while the raw syscall shape
        // has not.
        let fd = self.inner.as_raw_fd();
        let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
        let mut pollfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let ready = loop {
            let rc = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, timeout_ms) };
            if rc >= 0 {
                break rc;
            }
            let errno = std::io::Error::last_os_error();
            if errno.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(errno);
        };
        if ready == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = [0u8; 4096];
        let mut out = Vec::new();
        for event in self.inner.read_events_blocking(&mut buffer)? {
            let Some(&id) = self.by_native.get(&event.wd) else {
                continue;
            };
            out.push(RawEvent {
                wd: id,
                native_bits: event.mask.bits(),
                name: event.name.map(|n| n.to_owned()),
                is_dir: event.mask.contains(InotifyEventMask::ISDIR),
            });
        }
        Ok(out)
    }

    fn taxonomy(&self) -> &EventTaxonomy {
        &self.taxonomy
    }

    fn requires_scandir_diff(&self) -> bool {
        false
    }
}
