// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity-preserving node cache
//!
//! The cache is the only place nodes are constructed. Asking twice for the
//! same underlying object yields the same [`NodeRef`], and with it the same
//! inode number, for as long as anything (an installed tree, a directory's
//! child map, the kernel adapter) still holds the node. The cache itself only
//! keeps weak references, so nodes of discarded trees are freed and their
//! slots pruned.

use crate::node::{
    Fingerprint, InodeAllocator, MappedDir, MappedFile, MappedSymlink, Node, NodeKind, NodeRef,
    ScaffoldDir,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tracing::trace;

/// Slot count below which dead slots are left alone.
const MIN_PRUNE_AT: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Mapped { path: PathBuf, writable: bool },
    Scaffold { virtual_path: PathBuf },
}

/// Construction cell for one key; its initializer runs at most once.
#[derive(Debug)]
struct Slot {
    fingerprint: Option<Fingerprint>,
    node: OnceLock<Weak<Node>>,
}

impl Slot {
    /// Under construction, or constructed and still held somewhere.
    fn is_live(&self) -> bool {
        self.node.get().map_or(true, |node| node.strong_count() > 0)
    }
}

#[derive(Debug)]
struct Slots {
    map: HashMap<CacheKey, Arc<Slot>>,
    prune_at: usize,
}

impl Default for Slots {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            prune_at: MIN_PRUNE_AT,
        }
    }
}

impl Slots {
    fn prune(&mut self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, slot| slot.is_live());
        self.prune_at = MIN_PRUNE_AT.max(self.map.len() * 2);
        before - self.map.len()
    }
}

/// Registry of constructed nodes, owned by one filesystem session.
#[derive(Debug, Default)]
pub struct NodeCache {
    inodes: InodeAllocator,
    slots: Mutex<Slots>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the slot for `key`, replacing it when the underlying object
    /// changed or its node is gone.
    ///
    /// Only the map lookup runs under the cache-wide lock; construction happens
    /// inside the slot, so unrelated keys never wait on each other.
    fn slot(&self, key: &CacheKey, fingerprint: Option<Fingerprint>) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.map.get(key) {
            if slot.fingerprint == fingerprint && slot.is_live() {
                return Arc::clone(slot);
            }
        }
        if slots.map.len() >= slots.prune_at {
            let pruned = slots.prune();
            trace!(target: "mapfs::cache", pruned, "pruned dead slots");
        }
        let slot = Arc::new(Slot {
            fingerprint,
            node: OnceLock::new(),
        });
        slots.map.insert(key.clone(), Arc::clone(&slot));
        slot
    }

    /// Node for `key`, constructing it with `make` when nothing holds one.
    fn resolve(
        &self,
        key: CacheKey,
        fingerprint: Option<Fingerprint>,
        make: impl Fn(u64) -> Node,
    ) -> NodeRef {
        loop {
            let slot = self.slot(&key, fingerprint);
            let mut created = None;
            let weak = slot.node.get_or_init(|| {
                let node = Arc::new(make(self.inodes.allocate()));
                let weak = Arc::downgrade(&node);
                created = Some(node);
                weak
            });
            // A node dropped between construction and upgrade is dead; the
            // next round replaces its slot.
            if let Some(node) = created.or_else(|| weak.upgrade()) {
                return node;
            }
        }
    }

    /// Node for the underlying object at `path`, as observed in `metadata`.
    pub fn get_or_create(&self, path: &Path, metadata: &Metadata, writable: bool) -> NodeRef {
        let key = CacheKey::Mapped {
            path: path.to_path_buf(),
            writable,
        };
        self.resolve(key, Some(Fingerprint::of(metadata)), |inode| {
            let path = path.to_path_buf();
            trace!(target: "mapfs::cache", inode, path = %path.display(), writable, "constructing node");
            match NodeKind::of(metadata) {
                NodeKind::Dir => Node::Dir(MappedDir::new(path, metadata, writable, inode)),
                NodeKind::Symlink => Node::Symlink(MappedSymlink::new(path, metadata, writable, inode)),
                _ => Node::File(MappedFile::new(path, metadata, writable, inode)),
            }
        })
    }

    /// Synthetic directory at `virtual_path`.
    pub fn get_or_create_scaffold(&self, virtual_path: &Path) -> NodeRef {
        let key = CacheKey::Scaffold {
            virtual_path: virtual_path.to_path_buf(),
        };
        self.resolve(key, None, |inode| {
            trace!(target: "mapfs::cache", inode, path = %virtual_path.display(), "constructing scaffold");
            Node::Scaffold(ScaffoldDir::new(inode, virtual_path.to_path_buf()))
        })
    }

    /// Forget every node backed by `path` or anything below it.
    pub fn evict(&self, path: &Path) {
        self.slots.lock().map.retain(|key, _| match key {
            CacheKey::Mapped { path: cached, .. } => !cached.starts_with(path),
            CacheKey::Scaffold { .. } => true,
        });
    }

    /// Drop slots whose nodes are no longer held anywhere; returns how many.
    pub fn prune(&self) -> usize {
        self.slots.lock().prune()
    }

    pub fn clear(&self) {
        self.slots.lock().map.clear();
    }

    /// Number of nodes the cache can still hand back.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map
            .values()
            .filter(|slot| slot.node.get().is_some_and(|node| node.strong_count() > 0))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently held, live or not.
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn meta(path: &Path) -> Metadata {
        fs::symlink_metadata(path).unwrap()
    }

    #[test]
    fn same_object_yields_same_node() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"1").unwrap();
        let cache = NodeCache::new();
        let a = cache.get_or_create(&path, &meta(&path), false);
        // Content changes do not alter identity.
        fs::write(&path, b"22").unwrap();
        let b = cache.get_or_create(&path, &meta(&path), false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn writable_flag_is_part_of_identity() {
        let temp = TempDir::new().unwrap();
        let cache = NodeCache::new();
        let ro = cache.get_or_create(temp.path(), &meta(temp.path()), false);
        let rw = cache.get_or_create(temp.path(), &meta(temp.path()), true);
        assert!(!Arc::ptr_eq(&ro, &rw));
        assert_ne!(ro.inode(), rw.inode());
        assert!(!ro.writable());
        assert!(rw.writable());
    }

    #[test]
    fn replaced_object_gets_new_node() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("link");
        std::os::unix::fs::symlink("a", &path).unwrap();
        let cache = NodeCache::new();
        let first = cache.get_or_create(&path, &meta(&path), false);
        // Keep a second link alive so the old inode number is not recycled.
        fs::hard_link(&path, temp.path().join("keep")).unwrap();
        fs::remove_file(&path).unwrap();
        std::os::unix::fs::symlink("a", &path).unwrap();
        let second = cache.get_or_create(&path, &meta(&path), false);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn node_kind_follows_metadata() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("f"), b"").unwrap();
        std::os::unix::fs::symlink("f", temp.path().join("l")).unwrap();
        let cache = NodeCache::new();
        let dir = cache.get_or_create(temp.path(), &meta(temp.path()), false);
        let file_path = temp.path().join("f");
        let file = cache.get_or_create(&file_path, &meta(&file_path), false);
        let link_path = temp.path().join("l");
        let link = cache.get_or_create(&link_path, &meta(&link_path), false);
        assert_eq!(dir.kind(), NodeKind::Dir);
        assert_eq!(file.kind(), NodeKind::File);
        assert_eq!(link.kind(), NodeKind::Symlink);
    }

    #[test]
    fn concurrent_callers_share_one_construction() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"x").unwrap();
        let cache = Arc::new(NodeCache::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    let metadata = fs::symlink_metadata(&path).unwrap();
                    barrier.wait();
                    cache.get_or_create(&path, &metadata, true)
                })
            })
            .collect();
        let nodes: Vec<NodeRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for node in &nodes[1..] {
            assert!(Arc::ptr_eq(&nodes[0], node));
        }
        // Exactly one inode was allocated for the key.
        let other = temp.path().join("other");
        fs::write(&other, b"").unwrap();
        let next = cache.get_or_create(&other, &meta(&other), true);
        assert_eq!(next.inode(), nodes[0].inode() + 1);
    }

    #[test]
    fn evict_drops_path_and_descendants() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("d/f"), b"").unwrap();
        fs::write(temp.path().join("dx"), b"").unwrap();
        let cache = NodeCache::new();
        let held: Vec<NodeRef> = ["d", "d/f", "dx"]
            .iter()
            .map(|rel| {
                let path = temp.path().join(rel);
                cache.get_or_create(&path, &meta(&path), false)
            })
            .collect();
        cache.evict(&temp.path().join("d"));
        assert_eq!(cache.len(), 1);

        // An evicted path is constructed afresh even while the old node lives.
        let d = temp.path().join("d");
        let again = cache.get_or_create(&d, &meta(&d), false);
        assert!(!Arc::ptr_eq(&held[0], &again));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn dropped_nodes_are_rebuilt_and_their_slots_pruned() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"").unwrap();
        let cache = NodeCache::new();

        let first = cache.get_or_create(&path, &meta(&path), false);
        let first_inode = first.inode();
        drop(first);
        assert!(cache.is_empty());

        let second = cache.get_or_create(&path, &meta(&path), false);
        assert_ne!(second.inode(), first_inode);
        drop(second);

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.slot_count(), 0);
    }

    #[test]
    fn slot_map_stays_bounded_without_explicit_pruning() {
        let temp = TempDir::new().unwrap();
        let cache = NodeCache::new();
        for round in 0..1000 {
            let path = temp.path().join(format!("f{round}"));
            fs::write(&path, b"").unwrap();
            let node = cache.get_or_create(&path, &meta(&path), false);
            drop(node);
            fs::remove_file(&path).unwrap();
        }
        assert!(cache.slot_count() <= MIN_PRUNE_AT);
        assert!(cache.is_empty());
    }

    #[test]
    fn scaffold_identity_is_its_virtual_path() {
        let cache = NodeCache::new();
        let a = cache.get_or_create_scaffold(Path::new("/a"));
        let again = cache.get_or_create_scaffold(Path::new("/a"));
        let b = cache.get_or_create_scaffold(Path::new("/b"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), NodeKind::Scaffold);
    }
}
