// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! mapfs core: a virtual directory tree assembled from mappings onto the
//! host filesystem.
//!
//! A [`MappingSpec`] is turned into a [`Tree`] by [`build`], installed
//! behind a [`Root`], and replaced at runtime with [`Root::reconfigure`].
//! All nodes come from a [`NodeCache`], so an underlying object keeps its
//! node and inode number for as long as anything still holds that node.

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod invalidate;
pub mod node;
pub mod root;
pub mod tree;
pub mod types;

pub use builder::build;
pub use cache::NodeCache;
pub use config::{CachePolicy, FsConfig, Mapping, MappingSpec};
pub use error::{FsError, FsResult};
pub use invalidate::{Invalidator, NullInvalidator};
pub use node::{
    Directory, Fingerprint, MappedDir, MappedFile, MappedSymlink, Mounts, Node, NodeKind,
    NodeRef, ScaffoldDir, ROOT_INODE,
};
pub use root::{DirTarget, Root};
pub use tree::Tree;
pub use types::{Attributes, Dirent, EntryType, SetAttr};
