// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::BaseNode;
use crate::error::FsResult;
use crate::invalidate::Invalidator;
use std::fs::{self, Metadata};
use std::path::PathBuf;

/// A symlink backed by a symlink on the underlying filesystem.
#[derive(Debug)]
pub struct MappedSymlink {
    base: BaseNode,
}

impl MappedSymlink {
    pub(crate) fn new(path: PathBuf, metadata: &Metadata, writable: bool, inode: u64) -> Self {
        Self {
            base: BaseNode::new(path, metadata, writable, inode),
        }
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn readlink(&self) -> FsResult<PathBuf> {
        Ok(fs::read_link(self.base.underlying_path())?)
    }

    /// A live symlink node always stands for the same underlying symlink: a
    /// replaced link has a new fingerprint and therefore a new node, so there
    /// is nothing to drop here. Keeping the entry cached across
    /// reconfigurations avoids needless kernel round trips.
    pub(crate) fn invalidate(&self, _invalidator: &dyn Invalidator) {}
}
