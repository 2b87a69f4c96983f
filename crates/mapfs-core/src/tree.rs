// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One immutable generation of the virtual tree
//!
//! Nodes carry only what belongs to their underlying object. Which nested
//! mappings a directory hosts is a property of the tree generation, so it is
//! kept here, keyed by the hosting directory's inode. Installing a new
//! [`Tree`] therefore never changes a node that the old tree still shares.

use crate::invalidate::{log_invalidation_error, Invalidator};
use crate::node::{Mounts, Node, NodeRef};
use std::collections::{BTreeMap, HashMap, HashSet};

static NO_MOUNTS: Mounts = BTreeMap::new();

#[derive(Debug)]
pub struct Tree {
    top: NodeRef,
    mounts: HashMap<u64, Mounts>,
    /// Inodes of nodes bound directly by a mapping.
    bound: HashSet<u64>,
}

impl Tree {
    pub(crate) fn new(top: NodeRef, mounts: HashMap<u64, Mounts>, bound: HashSet<u64>) -> Self {
        Self { top, mounts, bound }
    }

    /// Top-level directory of this generation.
    pub fn top(&self) -> &NodeRef {
        &self.top
    }

    /// Mappings hosted by the directory with inode `ino`.
    pub fn mounts(&self, ino: u64) -> &Mounts {
        self.mounts.get(&ino).unwrap_or(&NO_MOUNTS)
    }

    /// Whether `node` is the target of a mapping in this generation.
    pub fn is_bound(&self, node: &Node) -> bool {
        self.bound.contains(&node.inode())
    }

    /// Drop the kernel's entries below `dir`, addressed under `parent`, and
    /// whatever it caches about the nodes behind them.
    ///
    /// Children are visited in name order.
    pub fn invalidate_entries(&self, dir: &Node, invalidator: &dyn Invalidator, parent: u64) {
        let Ok(ops) = dir.as_dir() else {
            return;
        };
        for (name, child) in ops.known_children(self) {
            log_invalidation_error(
                invalidator.invalidate_entry(parent, &name),
                "could not invalidate directory entry",
                parent,
            );
            child.invalidate(invalidator);
            if child.is_dir() {
                self.invalidate_entries(&child, invalidator, child.inode());
            }
        }
    }
}
