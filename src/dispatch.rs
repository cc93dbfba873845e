//! Ties the registry, the active backend and the handler pattern sets
//! together: translates one wakeup's worth of raw kernel events into the
//! set of handlers that should run, and keeps the node forest in sync with
//! the filesystem (expanding into newly created subdirectories, retiring
//! nodes whose directory disappeared).

use crate::backend::{diff_children, Backend, RawEvent};
use crate::event::GenericMask;
use crate::handler::Handler;
use crate::registry::{NodeRef, WatcherRegistry};
use std::ffi::OsString;
use std::path::PathBuf;
use std::rc::Rc;

/// One backend-independent occurrence, resolved to the directory it
/// happened in and (when known) the entry name within it.
#[derive(Debug, Clone)]
pub struct DispatchedEvent {
    pub dir: PathBuf,
    pub name: Option<OsString>,
    pub generic: GenericMask,
    pub native_bits: u32,
    pub native_names: String,
    pub is_dir: bool,
}

/// A handler matched against one event, ready for the process manager.
pub struct HandlerInvocation {
    pub handler: Rc<Handler>,
    pub event: DispatchedEvent,
}

pub struct Dispatcher {
    registry: WatcherRegistry,
    backend: Box<dyn Backend>,
}

impl Dispatcher {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Dispatcher {
            registry: WatcherRegistry::new(),
            backend,
        }
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WatcherRegistry {
        &mut self.registry
    }

    /// The active backend's generic-to-native event translation table, used
    /// by the configuration loader to resolve event names before any
    /// watcher is installed.
    pub fn taxonomy(&self) -> &crate::event::EventTaxonomy {
        self.backend.taxonomy()
    }

    /// Watches `root` (and, per `depth`, its subtree) under `handlers`.
    pub fn watch_root(
        &mut self,
        root: PathBuf,
        depth: i64,
        handlers: Vec<Rc<Handler>>,
    ) -> Result<NodeRef, crate::registry::RegistryError> {
        let backend = &mut self.backend;
        self.registry.setup_root(root, depth, handlers, &mut |path| {
            let mask = backend.taxonomy().native_mask_for_all();
            backend.add_watch(path, mask)
        })
    }

    /// Blocks for up to `timeout`, translating whatever the backend reports
    /// into matched handler invocations, and applying registry-maintenance
    /// side effects (subtree expansion on new directories, node teardown on
    /// deletion) along the way.
    pub fn poll_once(
        &mut self,
        timeout: Option<std::time::Duration>,
    ) -> std::io::Result<Vec<HandlerInvocation>> {
        let raw_events = self.backend.poll(timeout)?;
        let mut invocations = Vec::new();
        let mut pending_destroy = Vec::new();
        for raw in raw_events {
            invocations.extend(self.process_raw(raw, &mut pending_destroy));
        }

        // Teardown waits until the whole batch is resolved: a self-delete
        // and a later same-batch event on a descendant's descriptor must
        // both be matched against the registry as it stood at batch start,
        // not against a forest that shrank mid-batch.
        for node in pending_destroy {
            let backend = &mut self.backend;
            self.registry.destroy(node, |victim| {
                if let Some(wd) = victim.borrow().wd {
                    let _ = backend.remove_watch(wd);
                }
            });
        }

        Ok(invocations)
    }

    fn process_raw(&mut self, raw: RawEvent, pending_destroy: &mut Vec<NodeRef>) -> Vec<HandlerInvocation> {
        let Some(node) = self.registry.lookup_by_descriptor(raw.wd) else {
            return Vec::new(); // stale descriptor: the node was already torn down
        };

        let needs_diff = self.backend.requires_scandir_diff() && raw.name.is_none();
        let events = if needs_diff {
            self.synthesize_from_diff(&node, &raw)
        } else {
            vec![self.translate_direct(&node, &raw)]
        };

        let mut invocations = Vec::new();
        for event in events {
            self.apply_side_effects(&node, &event, pending_destroy);
            invocations.extend(self.match_handlers(&node, event));
        }
        invocations
    }

    fn translate_direct(&self, node: &NodeRef, raw: &RawEvent) -> DispatchedEvent {
        DispatchedEvent {
            dir: node.borrow().path.clone(),
            name: raw.name.clone(),
            generic: self.backend.taxonomy().observed_to_generic(raw.native_bits),
            native_bits: raw.native_bits,
            native_names: self.backend.taxonomy().native_names_joined(raw.native_bits),
            is_dir: raw.is_dir,
        }
    }

    fn synthesize_from_diff(&mut self, node: &NodeRef, raw: &RawEvent) -> Vec<DispatchedEvent> {
        let dir = node.borrow().path.clone();
        let (create_bits, delete_bits) = self.backend.taxonomy().create_delete_native_bits();

        let previous = node.borrow().edge_scratch.children.clone();
        let (current, synthetic) = diff_children(raw.wd, &previous, &dir, create_bits, delete_bits);
        node.borrow_mut().edge_scratch.children = current;

        synthetic
            .into_iter()
            .map(|synth| DispatchedEvent {
                dir: dir.clone(),
                generic: self.backend.taxonomy().observed_to_generic(synth.native_bits),
                native_bits: synth.native_bits,
                native_names: self.backend.taxonomy().native_names_joined(synth.native_bits),
                is_dir: synth.is_dir,
                name: synth.name,
            })
            .collect()
    }

    /// Subtree expansion on directory creation, node teardown scheduling on
    /// deletion. Teardown itself is deferred to the caller: destroying the
    /// node here, mid-batch, would make later events in the same batch that
    /// target a descendant's descriptor look stale and get silently dropped.
    fn apply_side_effects(&mut self, node: &NodeRef, event: &DispatchedEvent, pending_destroy: &mut Vec<NodeRef>) {
        use crate::event::GenericEvent;

        if event.generic.contains(GenericEvent::Delete) && event.name.is_none() {
            if !pending_destroy.iter().any(|n| Rc::ptr_eq(n, node)) {
                pending_destroy.push(node.clone());
            }
            return;
        }

        if event.generic.contains(GenericEvent::Create) && event.is_dir {
            if let Some(name) = &event.name {
                let child_path = event.dir.join(name);
                let (child_depth, can_descend, handlers) = {
                    let n = node.borrow();
                    (n.child_depth(), n.can_descend(), n.handlers.clone())
                };
                if can_descend {
                    let backend = &mut self.backend;
                    let mask = backend.taxonomy().native_mask_for_all();
                    if let Ok(wd) = backend.add_watch(&child_path, mask) {
                        let _ = self.registry.install(
                            child_path,
                            child_depth,
                            Some(node.clone()),
                            wd,
                            handlers,
                        );
                    }
                }
            }
        }
    }

    fn match_handlers(&self, node: &NodeRef, event: DispatchedEvent) -> Vec<HandlerInvocation> {
        let handlers = node.borrow().handlers.clone();
        let mut out = Vec::new();
        for handler in handlers {
            if !handler.mask.generic.intersects(event.generic) {
                continue;
            }
            let name_ok = match &event.name {
                Some(name) => handler
                    .patterns
                    .matches_name(&name.to_string_lossy()),
                None => true, // events on the watched directory itself are unfiltered
            };
            if name_ok {
                out.push(HandlerInvocation {
                    handler: handler.clone(),
                    event: event.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawEvent;
    use crate::event::{EventTaxonomy, GenericEvent};
    use crate::registry::WatchDescriptor;
    use std::collections::VecDeque;
    use std::path::Path;

    /// A fake backend driven entirely by a pre-seeded event queue, so
    /// dispatch logic can be exercised without a real kernel watch.
    struct FakeBackend {
        taxonomy: EventTaxonomy,
        queue: VecDeque<RawEvent>,
        scandir: bool,
        next_wd: WatchDescriptor,
        added: Vec<PathBuf>,
        removed: Vec<WatchDescriptor>,
    }

    impl FakeBackend {
        fn new(scandir: bool) -> Self {
            FakeBackend {
                taxonomy: EventTaxonomy::new(
                    [
                        (GenericEvent::Create, 0x01),
                        (GenericEvent::Write, 0x02),
                        (GenericEvent::Attrib, 0x04),
                        (GenericEvent::Delete, 0x08),
                    ],
                    vec![
                        ("CREATE", 0x01),
                        ("WRITE", 0x02),
                        ("ATTRIB", 0x04),
                        ("DELETE", 0x08),
                    ],
                ),
                queue: VecDeque::new(),
                scandir,
                next_wd: 1,
                added: Vec::new(),
                removed: Vec::new(),
            }
        }
    }

    impl Backend for FakeBackend {
        fn add_watch(&mut self, path: &Path, _native_mask: u32) -> std::io::Result<WatchDescriptor> {
            let wd = self.next_wd;
            self.next_wd += 1;
            self.added.push(path.to_path_buf());
            Ok(wd)
        }

        fn remove_watch(&mut self, wd: WatchDescriptor) -> std::io::Result<()> {
            self.removed.push(wd);
            Ok(())
        }

        fn poll(
            &mut self,
            _timeout: Option<std::time::Duration>,
        ) -> std::io::Result<Vec<RawEvent>> {
            Ok(self.queue.drain(..).collect())
        }

        fn taxonomy(&self) -> &EventTaxonomy {
            &self.taxonomy
        }

        fn requires_scandir_diff(&self) -> bool {
            self.scandir
        }
    }

    fn handler_for(mask_event: GenericEvent, pattern: Option<&str>) -> Rc<Handler> {
        let mut builder = Handler::builder();
        let mut mask = crate::event::EventMask::default();
        mask.generic.insert(mask_event);
        builder.mask(mask).command("true");
        if let Some(p) = pattern {
            builder.add_pattern(p).unwrap();
        }
        builder.finalize().unwrap()
    }

    #[test]
    fn direct_event_matches_handler_by_mask_and_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(false);
        backend.queue.push_back(RawEvent {
            wd: 1,
            native_bits: 0x02,
            name: Some("foo.rs".into()),
            is_dir: false,
        });

        let mut dispatcher = Dispatcher::new(Box::new(backend));
        let handlers = vec![handler_for(GenericEvent::Write, Some("*.rs"))];
        dispatcher
            .registry_mut()
            .install(dir.path().to_path_buf(), -1, None, 1, handlers)
            .unwrap();

        let invocations = dispatcher.poll_once(None).unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].event.name, Some("foo.rs".into()));
    }

    #[test]
    fn non_matching_pattern_produces_no_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(false);
        backend.queue.push_back(RawEvent {
            wd: 1,
            native_bits: 0x02,
            name: Some("foo.txt".into()),
            is_dir: false,
        });

        let mut dispatcher = Dispatcher::new(Box::new(backend));
        let handlers = vec![handler_for(GenericEvent::Write, Some("*.rs"))];
        dispatcher
            .registry_mut()
            .install(dir.path().to_path_buf(), -1, None, 1, handlers)
            .unwrap();

        assert!(dispatcher.poll_once(None).unwrap().is_empty());
    }

    #[test]
    fn self_delete_tears_down_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(false);
        backend.queue.push_back(RawEvent {
            wd: 1,
            native_bits: 0x08,
            name: None,
            is_dir: false,
        });

        let mut dispatcher = Dispatcher::new(Box::new(backend));
        dispatcher
            .registry_mut()
            .install(dir.path().to_path_buf(), -1, None, 1, vec![])
            .unwrap();

        dispatcher.poll_once(None).unwrap();
        assert!(dispatcher.registry().lookup_by_descriptor(1).is_none());
    }

    #[test]
    fn self_delete_does_not_shadow_a_later_event_on_a_child_in_the_same_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(false);
        // Both land in one poll(): the parent's self-delete first, then a
        // write on a child whose descriptor must still resolve even though
        // the parent is about to be torn down.
        backend.queue.push_back(RawEvent {
            wd: 1,
            native_bits: 0x08,
            name: None,
            is_dir: false,
        });
        backend.queue.push_back(RawEvent {
            wd: 2,
            native_bits: 0x02,
            name: Some("foo.rs".into()),
            is_dir: false,
        });

        let mut dispatcher = Dispatcher::new(Box::new(backend));
        let handlers = vec![handler_for(GenericEvent::Write, None)];
        let parent = dispatcher
            .registry_mut()
            .install(dir.path().to_path_buf(), -1, None, 1, vec![])
            .unwrap()
            .0;
        dispatcher
            .registry_mut()
            .install(dir.path().join("child"), -1, Some(parent), 2, handlers)
            .unwrap();

        let invocations = dispatcher.poll_once(None).unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].event.name, Some("foo.rs".into()));

        // The deferred teardown still runs once the batch is fully drained.
        assert!(dispatcher.registry().lookup_by_descriptor(1).is_none());
    }

    #[test]
    fn scandir_diff_synthesises_create_for_new_directory_and_expands_into_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut backend = FakeBackend::new(true);
        backend.queue.push_back(RawEvent {
            wd: 1,
            native_bits: 0x02, // directory "changed", no name: triggers diff
            name: None,
            is_dir: true,
        });

        let mut dispatcher = Dispatcher::new(Box::new(backend));
        dispatcher
            .registry_mut()
            .install(dir.path().to_path_buf(), -1, None, 1, vec![])
            .unwrap();

        let invocations = dispatcher.poll_once(None).unwrap();
        assert!(invocations.is_empty()); // no handlers registered, but expansion still happens
        assert!(dispatcher
            .registry()
            .lookup_by_path(&dir.path().join("sub"))
            .is_some());
    }
}
