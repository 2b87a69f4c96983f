// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount root and live reconfiguration
//!
//! The kernel caches the root node it was handed at mount time and never asks
//! for it again, so [`Root`] is a fixed anchor (inode 1) around a swappable
//! [`Tree`]. Reconfiguring swaps the tree and brackets the swap with entry
//! invalidations: one on the old tree before the swap (so removed names stop
//! resolving) and one on the new tree after it (so names that used to be
//! missing are looked up again).
//!
//! Requests take a snapshot with [`Root::tree`] and serve everything from it,
//! so a request sees either the old tree or the new one, never a mix.

use crate::cache::NodeCache;
use crate::error::{FsError, FsResult};
use crate::invalidate::{log_invalidation_error, Invalidator};
use crate::node::{NodeRef, ROOT_INODE};
use crate::tree::Tree;
use crate::types::{Attributes, Dirent};
use parking_lot::{Mutex, RwLock};
use std::ffi::OsStr;
use std::sync::Arc;
use tracing::{debug, info};

/// A directory as the kernel addresses it: the mount root itself or a concrete node.
#[derive(Clone, Copy, Debug)]
pub enum DirTarget<'a> {
    Root(&'a Root),
    Node(&'a NodeRef),
}

#[derive(Debug)]
pub struct Root {
    tree: RwLock<Arc<Tree>>,
    /// Serializes reconfigurations; never taken by lookups.
    reconfigure_lock: Mutex<()>,
}

impl Root {
    pub fn new(tree: Tree) -> FsResult<Self> {
        if !tree.top().is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Self {
            tree: RwLock::new(Arc::new(tree)),
            reconfigure_lock: Mutex::new(()),
        })
    }

    pub fn inode(&self) -> u64 {
        ROOT_INODE
    }

    /// Snapshot of the installed tree.
    pub fn tree(&self) -> Arc<Tree> {
        Arc::clone(&self.tree.read())
    }

    /// Top-level directory of the installed tree.
    pub fn current(&self) -> NodeRef {
        Arc::clone(self.tree.read().top())
    }

    /// Replace the installed tree with `tree`.
    ///
    /// The swap itself is the commit point: invalidation failures are logged
    /// and do not fail the reconfiguration. No lock that lookups need is held
    /// while talking to the kernel.
    pub fn reconfigure(&self, invalidator: &dyn Invalidator, tree: Tree) -> FsResult<()> {
        if !tree.top().is_dir() {
            return Err(FsError::NotADirectory);
        }
        let _serialized = self.reconfigure_lock.lock();

        log_invalidation_error(
            invalidator.invalidate_node_data(ROOT_INODE),
            "could not invalidate root",
            ROOT_INODE,
        );

        let old = self.tree();
        old.invalidate_entries(old.top(), invalidator, ROOT_INODE);

        let new = Arc::new(tree);
        *self.tree.write() = Arc::clone(&new);

        new.invalidate_entries(new.top(), invalidator, ROOT_INODE);

        info!(
            target: "mapfs::reconfig",
            old_top = old.top().inode(),
            new_top = new.top().inode(),
            "reconfigured filesystem tree"
        );
        Ok(())
    }

    /// Concrete directory node for `target` in the tree `target` has installed.
    pub fn resolve(target: DirTarget<'_>) -> NodeRef {
        match target {
            DirTarget::Root(root) => root.current(),
            DirTarget::Node(node) => Arc::clone(node),
        }
    }

    /// Rename `name` in the top-level directory.
    ///
    /// When the destination is this root, it is replaced by the top of the
    /// same snapshot before delegating, so directory rename logic only ever
    /// sees concrete directory nodes.
    pub fn rename(
        &self,
        name: &OsStr,
        new_dir: DirTarget<'_>,
        new_name: &OsStr,
        cache: &NodeCache,
    ) -> FsResult<()> {
        let tree = self.tree();
        let new_dir = match new_dir {
            DirTarget::Root(root) if std::ptr::eq(root, self) => {
                debug!(target: "mapfs::fuse", ?name, ?new_name, "rename within root");
                Arc::clone(tree.top())
            }
            other => Self::resolve(other),
        };
        tree.top()
            .as_dir()?
            .rename(&tree, name, &new_dir, new_name, cache)
    }

    pub fn lookup(&self, name: &OsStr, cache: &NodeCache) -> FsResult<NodeRef> {
        let tree = self.tree();
        tree.top().as_dir()?.lookup(&tree, name, cache)
    }

    pub fn readdir(&self, cache: &NodeCache) -> FsResult<Vec<Dirent>> {
        let tree = self.tree();
        tree.top().as_dir()?.readdir(&tree, cache)
    }

    /// Attributes of the installed tree, reported under the root inode.
    pub fn attr(&self) -> FsResult<Attributes> {
        let mut attr = self.current().attr()?;
        attr.ino = ROOT_INODE;
        Ok(attr)
    }
}
