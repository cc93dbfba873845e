//! The directory watcher node and the registry that owns the node forest.

use crate::handler::Handler;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

/// Depth meaning "recurse without limit".
pub const UNLIMITED_DEPTH: i64 = -1;

/// An opaque backend watch identifier: an inotify watch descriptor, or a
/// kqueue-registered file descriptor. The registry treats it as opaque.
pub type WatchDescriptor = i64;

/// Per-directory scratch state the edge (kqueue) backend needs to
/// synthesise CREATE/DELETE by diffing directory listings. Caches the full
/// child set (not just mode+ctime) so synthesis is precise rather than
/// inferred from a timestamp change.
#[derive(Debug, Default, Clone)]
pub struct EdgeScratch {
    pub children: HashSet<String>,
}

/// One live watched directory.
pub struct DirNode {
    pub parent: Option<Weak<RefCell<DirNode>>>,
    pub path: PathBuf,
    pub wd: Option<WatchDescriptor>,
    pub depth: i64,
    pub handlers: Vec<Rc<Handler>>,
    pub edge_scratch: EdgeScratch,
}

impl DirNode {
    /// Depth to hand to a child node one level down: unlimited stays
    /// unlimited, otherwise decrements.
    pub fn child_depth(&self) -> i64 {
        if self.depth == UNLIMITED_DEPTH {
            UNLIMITED_DEPTH
        } else {
            self.depth - 1
        }
    }

    pub fn can_descend(&self) -> bool {
        self.depth == UNLIMITED_DEPTH || self.depth > 0
    }
}

pub type NodeRef = Rc<RefCell<DirNode>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("path {0:?} already watched at a different depth")]
    DepthMismatch(PathBuf),
    #[error("watch installation failed for {0:?}: {1}")]
    Kernel(PathBuf, std::io::Error),
}

/// Owns the node forest and indexes it by pathname and by backend watch
/// descriptor. Both indices always map to the same node instance.
#[derive(Default)]
pub struct WatcherRegistry {
    by_path: HashMap<PathBuf, NodeRef>,
    by_descriptor: HashMap<WatchDescriptor, NodeRef>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        WatcherRegistry::default()
    }

    pub fn lookup_by_path(&self, path: &Path) -> Option<NodeRef> {
        self.by_path.get(path).cloned()
    }

    pub fn lookup_by_descriptor(&self, wd: WatchDescriptor) -> Option<NodeRef> {
        self.by_descriptor.get(&wd).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// `install(path, depth) -> (node, created?)`. If a node for `path`
    /// already exists, it's returned unchanged with `created = false` —
    /// re-declaring the same path at the same depth appends handlers rather
    /// than erroring; a depth mismatch is rejected as a configuration error.
    pub fn install(
        &mut self,
        path: PathBuf,
        depth: i64,
        parent: Option<NodeRef>,
        wd: WatchDescriptor,
        handlers: Vec<Rc<Handler>>,
    ) -> Result<(NodeRef, bool), RegistryError> {
        if let Some(existing) = self.by_path.get(&path) {
            if existing.borrow().depth != depth {
                return Err(RegistryError::DepthMismatch(path));
            }
            existing.borrow_mut().handlers.extend(handlers);
            return Ok((existing.clone(), false));
        }

        // Seeded eagerly, not lazily on first event: the edge backend diffs
        // future scans against this baseline, and an empty baseline would
        // manufacture a synthetic CREATE for every entry that already
        // existed when the watch went up. Harmless extra scandir for
        // backends that report CREATE/DELETE natively and never read it.
        let children = crate::backend::scan_children(&path);

        let node = Rc::new(RefCell::new(DirNode {
            parent: parent.map(|p| Rc::downgrade(&p)),
            path: path.clone(),
            wd: Some(wd),
            depth,
            handlers,
            edge_scratch: EdgeScratch { children },
        }));

        self.by_path.insert(path, node.clone());
        self.by_descriptor.insert(wd, node.clone());
        Ok((node, true))
    }

    /// Re-keys a node's descriptor index entry. Needed when a backend
    /// re-arms a watch under a new identifier — the kqueue backend's
    /// compacting change-list re-indexes surviving descriptors each loop.
    pub fn rekey_descriptor(&mut self, old: WatchDescriptor, new: WatchDescriptor) {
        if let Some(node) = self.by_descriptor.remove(&old) {
            node.borrow_mut().wd = Some(new);
            self.by_descriptor.insert(new, node);
        }
    }

    /// Recursively destroys `node` and its descendants, depth-first, freeing
    /// handler references and removing both index entries. The caller is
    /// responsible for calling `Backend::remove_watch` for
    /// each node as it's visited (supplied via `on_remove`), since only the
    /// caller holds the live backend.
    pub fn destroy(&mut self, node: NodeRef, mut on_remove: impl FnMut(&NodeRef)) {
        self.destroy_inner(node, &mut on_remove);
    }

    fn destroy_inner(&mut self, node: NodeRef, on_remove: &mut impl FnMut(&NodeRef)) {
        let path = node.borrow().path.clone();

        // Children are anything in the index whose parent pointer resolves
        // back to this node; the registry holds no separate child list —
        // parent is a relation, not ownership.
        let children: Vec<NodeRef> = self
            .by_path
            .values()
            .filter(|candidate| {
                candidate
                    .borrow()
                    .parent
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .is_some_and(|p| Rc::ptr_eq(&p, &node))
            })
            .cloned()
            .collect();

        for child in children {
            self.destroy_inner(child, on_remove);
        }

        on_remove(&node);

        if let Some(wd) = node.borrow().wd {
            self.by_descriptor.remove(&wd);
        }
        self.by_path.remove(&path);
    }

    /// Startup setup: install a node for `root`, and if its depth is
    /// nonzero, enumerate its directory children (skipping symlinks, to
    /// avoid cycles) and install them recursively.
    ///
    /// `add_watch` is the caller-supplied backend hook; it's passed in
    /// rather than this taking a `&dyn Backend` so tests can exercise the
    /// recursion with a trivial fake.
    pub fn setup_root(
        &mut self,
        root: PathBuf,
        depth: i64,
        handlers: Vec<Rc<Handler>>,
        add_watch: &mut dyn FnMut(&Path) -> std::io::Result<WatchDescriptor>,
    ) -> Result<NodeRef, RegistryError> {
        let wd = add_watch(&root).map_err(|e| RegistryError::Kernel(root.clone(), e))?;
        let (node, _) = self.install(root.clone(), depth, None, wd, handlers.clone())?;

        if node.borrow().can_descend() {
            self.expand_subtree(&node, handlers, add_watch)?;
        }

        Ok(node)
    }

    fn expand_subtree(
        &mut self,
        parent: &NodeRef,
        handlers: Vec<Rc<Handler>>,
        add_watch: &mut dyn FnMut(&Path) -> std::io::Result<WatchDescriptor>,
    ) -> Result<(), RegistryError> {
        let (parent_path, child_depth, can_descend) = {
            let p = parent.borrow();
            (p.path.clone(), p.child_depth(), p.can_descend())
        };
        if !can_descend {
            return Ok(());
        }

        let entries = match fs::read_dir(&parent_path) {
            Ok(entries) => entries,
            Err(e) => return Err(RegistryError::Kernel(parent_path, e)),
        };

        for entry in entries.flatten() {
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            // Skip symlinks to avoid cycles.
            if file_type.is_symlink() || !file_type.is_dir() {
                continue;
            }

            let child_path = entry.path();
            let wd = match add_watch(&child_path) {
                Ok(wd) => wd,
                Err(_) => continue, // kernel error on one path: skip it, keep going
            };
            let (child, _) = self.install(
                child_path,
                child_depth,
                Some(parent.clone()),
                wd,
                handlers.clone(),
            )?;
            self.expand_subtree(&child, handlers.clone(), add_watch)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;

    fn noop_add_watch() -> impl FnMut(&Path) -> std::io::Result<WatchDescriptor> {
        let mut next = 1i64;
        move |_path| {
            let wd = next;
            next += 1;
            Ok(wd)
        }
    }

    #[test]
    fn install_then_lookup_by_both_indices() {
        let mut reg = WatcherRegistry::new();
        let (node, created) = reg
            .install(PathBuf::from("/tmp/a"), UNLIMITED_DEPTH, None, 1, vec![])
            .unwrap();
        assert!(created);
        assert!(Rc::ptr_eq(&node, &reg.lookup_by_path(Path::new("/tmp/a")).unwrap()));
        assert!(Rc::ptr_eq(&node, &reg.lookup_by_descriptor(1).unwrap()));
    }

    #[test]
    fn reinstalling_same_path_same_depth_appends_handlers() {
        let mut reg = WatcherRegistry::new();
        let h1 = Handler::builder().command("one").finalize().unwrap();
        let h2 = Handler::builder().command("two").finalize().unwrap();

        let (node, created) = reg
            .install(PathBuf::from("/tmp/a"), 0, None, 1, vec![h1])
            .unwrap();
        assert!(created);
        let (node2, created2) = reg
            .install(PathBuf::from("/tmp/a"), 0, None, 1, vec![h2])
            .unwrap();
        assert!(!created2);
        assert!(Rc::ptr_eq(&node, &node2));
        assert_eq!(node.borrow().handlers.len(), 2);
    }

    #[test]
    fn reinstalling_same_path_different_depth_is_an_error() {
        let mut reg = WatcherRegistry::new();
        reg.install(PathBuf::from("/tmp/a"), 0, None, 1, vec![]).unwrap();
        let err = reg.install(PathBuf::from("/tmp/a"), 1, None, 2, vec![]);
        assert!(matches!(err, Err(RegistryError::DepthMismatch(_))));
    }

    #[test]
    fn destroy_removes_from_both_indices_and_recurses_to_children() {
        let mut reg = WatcherRegistry::new();
        let (parent, _) = reg
            .install(PathBuf::from("/tmp/a"), UNLIMITED_DEPTH, None, 1, vec![])
            .unwrap();
        let (_child, _) = reg
            .install(
                PathBuf::from("/tmp/a/b"),
                UNLIMITED_DEPTH,
                Some(parent.clone()),
                2,
                vec![],
            )
            .unwrap();

        let mut removed = Vec::new();
        reg.destroy(parent, |n| removed.push(n.borrow().path.clone()));

        assert_eq!(removed, vec![PathBuf::from("/tmp/a/b"), PathBuf::from("/tmp/a")]);
        assert!(reg.lookup_by_path(Path::new("/tmp/a")).is_none());
        assert!(reg.lookup_by_path(Path::new("/tmp/a/b")).is_none());
        assert!(reg.lookup_by_descriptor(1).is_none());
        assert!(reg.lookup_by_descriptor(2).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn setup_root_expands_recursive_subtree_skipping_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");
        std::fs::create_dir_all(&b).unwrap();

        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            let _ = std::os::unix::fs::symlink(&a, &link);
        }

        let mut reg = WatcherRegistry::new();
        let mut add_watch = noop_add_watch();
        reg.setup_root(dir.path().to_path_buf(), UNLIMITED_DEPTH, vec![], &mut add_watch)
            .unwrap();

        assert!(reg.lookup_by_path(dir.path()).is_some());
        assert!(reg.lookup_by_path(&a).is_some());
        assert!(reg.lookup_by_path(&b).is_some());
        assert!(reg.lookup_by_path(&dir.path().join("link")).is_none());
    }

    #[test]
    fn setup_root_honours_explicit_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");
        std::fs::create_dir_all(&b).unwrap();

        let mut reg = WatcherRegistry::new();
        let mut add_watch = noop_add_watch();
        // depth 1: root can descend once (into `a`), but `a`'s child depth
        // becomes 0, so `b` is never installed.
        reg.setup_root(dir.path().to_path_buf(), 1, vec![], &mut add_watch)
            .unwrap();

        assert!(reg.lookup_by_path(&a).is_some());
        assert!(reg.lookup_by_path(&b).is_none());
    }
}
