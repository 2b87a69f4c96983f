// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::{Directory, Node, NodeRef};
use crate::cache::NodeCache;
use crate::error::{FsError, FsResult};
use crate::invalidate::{log_invalidation_error, Invalidator};
use crate::tree::Tree;
use crate::types::{Attributes, Dirent, EntryType, SetAttr};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Synthetic directory that only exists to hold mappings below it.
#[derive(Debug)]
pub struct ScaffoldDir {
    inode: u64,
    virtual_path: PathBuf,
    created: SystemTime,
    uid: u32,
    gid: u32,
}

impl ScaffoldDir {
    pub(crate) fn new(inode: u64, virtual_path: PathBuf) -> Self {
        Self {
            inode,
            virtual_path,
            created: SystemTime::now(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn virtual_path(&self) -> &Path {
        &self.virtual_path
    }

    pub fn attr(&self) -> Attributes {
        Attributes {
            ino: self.inode,
            kind: EntryType::Directory,
            size: 0,
            blocks: 0,
            atime: self.created,
            mtime: self.created,
            ctime: self.created,
            perm: 0o555,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
        }
    }

    pub(crate) fn setattr(&self, changes: &SetAttr) -> FsResult<Attributes> {
        if changes.is_empty() {
            Ok(self.attr())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    pub(crate) fn invalidate(&self, invalidator: &dyn Invalidator) {
        log_invalidation_error(
            invalidator.invalidate_node_data(self.inode),
            "could not invalidate scaffold directory",
            self.inode,
        );
    }
}

impl Directory for ScaffoldDir {
    fn lookup(&self, tree: &Tree, name: &OsStr, _cache: &NodeCache) -> FsResult<NodeRef> {
        tree.mounts(self.inode)
            .get(name)
            .map(Arc::clone)
            .ok_or(FsError::NotFound)
    }

    fn readdir(&self, tree: &Tree, _cache: &NodeCache) -> FsResult<Vec<Dirent>> {
        Ok(tree
            .mounts(self.inode)
            .iter()
            .map(|(name, node)| node.dirent(name))
            .collect())
    }

    fn create(
        &self,
        _tree: &Tree,
        _name: &OsStr,
        _mode: u32,
        _flags: i32,
        _cache: &NodeCache,
    ) -> FsResult<(NodeRef, File)> {
        Err(FsError::PermissionDenied)
    }

    fn mkdir(&self, _tree: &Tree, _name: &OsStr, _mode: u32, _cache: &NodeCache) -> FsResult<NodeRef> {
        Err(FsError::PermissionDenied)
    }

    fn mknod(
        &self,
        _tree: &Tree,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
        _cache: &NodeCache,
    ) -> FsResult<NodeRef> {
        Err(FsError::PermissionDenied)
    }

    fn symlink(
        &self,
        _tree: &Tree,
        _name: &OsStr,
        _target: &Path,
        _cache: &NodeCache,
    ) -> FsResult<NodeRef> {
        Err(FsError::PermissionDenied)
    }

    fn remove(&self, _tree: &Tree, _name: &OsStr, _dir: bool, _cache: &NodeCache) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn rename(
        &self,
        _tree: &Tree,
        _name: &OsStr,
        _new_dir: &Node,
        _new_name: &OsStr,
        _cache: &NodeCache,
    ) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn known_children(&self, tree: &Tree) -> Vec<(OsString, NodeRef)> {
        tree.mounts(self.inode)
            .iter()
            .map(|(name, node)| (name.clone(), Arc::clone(node)))
            .collect()
    }
}
