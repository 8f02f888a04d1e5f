//! The locally cached directory tree and its graft/detach operations.
//!
//! An inode is owned by its tree entry; nothing outside the tree holds a
//! strong reference except short-lived operation snapshots. Destruction of
//! a detached subtree never talks to the MS — it is driven entirely by the
//! [`DetachQueue`] background thread dropping the subtree's `Arc`s.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::errors::{GatewayError, GwResult};
use crate::inode::Inode;

/// One node of the locally cached tree: a name, its inode, and (for
/// directories) its known children.
///
/// `parent` is a weak back-reference: the tree owns children strongly,
/// root-to-leaf; a node never keeps its parent alive. It exists so the
/// consistency engine can replace
/// or rename a node in place (`inode_reload`'s type-change and name-change
/// cases) without threading the parent through every call site.
pub struct FsEntry {
    pub name: String,
    pub inode: Arc<Inode>,
    pub children: RwLock<HashMap<String, Arc<FsEntry>>>,
    pub parent: RwLock<Option<Weak<FsEntry>>>,
}

impl FsEntry {
    #[must_use]
    pub fn new(name: String, inode: Arc<Inode>) -> Arc<Self> {
        Arc::new(Self { name, inode, children: RwLock::new(HashMap::new()), parent: RwLock::new(None) })
    }

    /// The parent entry, if this node is still attached to the tree under
    /// one (the root has no parent; a detached subtree's parent has been
    /// dropped).
    #[must_use]
    pub fn parent(&self) -> Option<Arc<FsEntry>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Splits a `/`-separated path into its non-empty components.
#[must_use]
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

pub struct FsTree {
    pub root: Arc<FsEntry>,
    detach_queue: DetachQueue,
}

/// Result of walking as far as the locally cached tree goes.
pub struct PartialResolve {
    /// Deepest ancestor entry that matched.
    pub ancestor: Arc<FsEntry>,
    /// Remaining path components not found locally (possibly empty, which
    /// means the full path resolved).
    pub remaining: Vec<String>,
}

impl FsTree {
    #[must_use]
    pub fn new(root_inode: Arc<Inode>) -> Self {
        Self { root: FsEntry::new(String::new(), root_inode), detach_queue: DetachQueue::new() }
    }

    /// Walks the locally cached part of `path`.
    #[must_use]
    pub fn resolve_partial(&self, path: &str) -> PartialResolve {
        let names = split_path(path);
        let mut current = Arc::clone(&self.root);
        for (i, name) in names.iter().enumerate() {
            let next = current.children.read().get(name).cloned();
            match next {
                Some(child) => current = child,
                None => return PartialResolve { ancestor: current, remaining: names[i..].to_vec() },
            }
        }
        PartialResolve { ancestor: current, remaining: Vec::new() }
    }

    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Arc<FsEntry>> {
        let r = self.resolve_partial(path);
        if r.remaining.is_empty() { Some(r.ancestor) } else { None }
    }

    /// Grafts freshly downloaded entries onto `ancestor` along `names`,
    /// one `FsEntry` per name, each wrapping the corresponding inode in
    /// `inodes` (same length and order as `names`). Fails the whole
    /// operation if any step would collide with an existing, different
    /// child.
    ///
    /// # Errors
    /// Returns [`GatewayError::Conflict`] on a collision.
    pub fn graft(&self, ancestor: &Arc<FsEntry>, names: &[String], inodes: Vec<Arc<Inode>>) -> GwResult<Arc<FsEntry>> {
        if names.len() != inodes.len() {
            errors_mismatch();
        }
        let mut current = Arc::clone(ancestor);
        for (name, inode) in names.iter().zip(inodes) {
            let existing = current.children.read().get(name).cloned();
            current = match existing {
                Some(child) if child.inode.file_id == inode.file_id => child,
                Some(_) => {
                    return Err(GatewayError::Conflict(format!(
                        "graft collision: {name} already has a different child under {}", current.name
                    )));
                }
                None => {
                    let entry = FsEntry::new(name.clone(), inode);
                    *entry.parent.write() = Some(Arc::downgrade(&current));
                    current.children.write().insert(name.clone(), Arc::clone(&entry));
                    entry
                }
            };
        }
        Ok(current)
    }

    /// Removes `name` from `parent`'s children and enqueues the detached
    /// subtree for asynchronous teardown. Never performed synchronously:
    /// the caller observes the removal immediately but the subtree's
    /// resources are dropped on the detach-queue thread.
    pub fn defer_detach(&self, parent: &Arc<FsEntry>, name: &str) {
        if let Some(child) = parent.children.write().remove(name) {
            self.detach_queue.enqueue(child);
        }
    }

    /// Replaces `name` under `parent` with a brand-new entry, deferring
    /// teardown of whatever was there before (the `inode_reload` type
    /// change case).
    pub fn replace_with_defer_detach(&self, parent: &Arc<FsEntry>, name: String, new_inode: Arc<Inode>) -> Arc<FsEntry> {
        let fresh = FsEntry::new(name.clone(), new_inode);
        *fresh.parent.write() = Some(Arc::downgrade(parent));
        let old = parent.children.write().insert(name, Arc::clone(&fresh));
        if let Some(old) = old {
            self.detach_queue.enqueue(old);
        }
        fresh
    }

    pub fn shutdown(&self) {
        self.detach_queue.shutdown();
    }
}

#[cold]
fn errors_mismatch() -> ! {
    crate::errors::bug("fs_tree::graft: names/inodes length mismatch")
}

/// Background thread that drops detached subtrees without ever touching
/// the MS.
struct DetachQueue {
    tx: Sender<DetachMsg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

enum DetachMsg {
    Entry(Arc<FsEntry>),
    Shutdown,
}

impl DetachQueue {
    fn new() -> Self {
        let (tx, rx): (Sender<DetachMsg>, Receiver<DetachMsg>) = channel();
        let handle = thread::spawn(move || {
            log::info!("detach queue thread starting");
            for msg in rx {
                match msg {
                    DetachMsg::Entry(entry) => drop(entry),
                    DetachMsg::Shutdown => break,
                }
            }
            log::info!("detach queue thread shutting down");
        });
        Self { tx, handle: Mutex::new(Some(handle)) }
    }

    fn enqueue(&self, entry: Arc<FsEntry>) {
        let _ = self.tx.send(DetachMsg::Entry(entry));
    }

    fn shutdown(&self) {
        let _ = self.tx.send(DetachMsg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, GatewayId, InodeType, Timespec, VolumeId};

    fn leaf(id: u64, name: &str) -> Arc<Inode> {
        Arc::new(Inode::new(FileId(id), VolumeId(1), name.into(), Some(FileId(0)), InodeType::File, GatewayId(1), Timespec::new(0, 0)))
    }

    #[test]
    fn resolve_partial_stops_at_first_missing_component() {
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        let r = tree.resolve_partial("a/b/c");
        assert_eq!(r.remaining, vec!["a", "b", "c"]);
    }

    #[test]
    fn graft_then_resolve_finds_the_path() {
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        let r = tree.resolve_partial("a/b");
        tree.graft(&r.ancestor, &r.remaining, vec![leaf(1, "a"), leaf(2, "b")]).unwrap();
        let found = tree.resolve("a/b").unwrap();
        assert_eq!(found.inode.file_id, FileId(2));
        tree.shutdown();
    }

    #[test]
    fn graft_collision_with_different_file_id_fails() {
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        tree.graft(&tree.root.clone(), &["a".to_string()], vec![leaf(1, "a")]).unwrap();
        let err = tree.graft(&tree.root.clone(), &["a".to_string()], vec![leaf(99, "a")]).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        tree.shutdown();
    }

    #[test]
    fn defer_detach_removes_child_immediately_from_parent_view() {
        let tree = FsTree::new(Arc::new(Inode::new(FileId(0), VolumeId(1), String::new(), None, InodeType::Dir, GatewayId(1), Timespec::new(0, 0))));
        tree.graft(&tree.root.clone(), &["a".to_string()], vec![leaf(1, "a")]).unwrap();
        assert!(tree.resolve("a").is_some());
        tree.defer_detach(&tree.root, "a");
        assert!(tree.resolve("a").is_none());
        tree.shutdown();
    }
}
