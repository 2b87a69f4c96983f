// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tree builder: turns a mapping specification into a directory tree
//!
//! The builder never touches the installed tree. It only consults the node
//! cache, so nodes for unchanged bindings come back by reference and keep
//! their identity when the resulting tree is installed. A node's identity
//! depends on its own binding only; the mappings nested below it are
//! recorded in the [`Tree`].

use crate::cache::NodeCache;
use crate::config::MappingSpec;
use crate::error::{FsError, FsResult};
use crate::node::{Mounts, NodeRef};
use crate::tree::Tree;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
struct Binding {
    underlying_path: PathBuf,
    writable: bool,
}

/// Hosted mappings and mapping targets collected while materializing.
#[derive(Debug, Default)]
struct Layout {
    mounts: HashMap<u64, Mounts>,
    bound: HashSet<u64>,
}

/// Virtual tree under construction.
#[derive(Debug, Default)]
struct PendingDir {
    binding: Option<Binding>,
    children: BTreeMap<OsString, PendingDir>,
}

impl PendingDir {
    fn from_spec(spec: &MappingSpec) -> FsResult<Self> {
        let mut top = PendingDir::default();
        for mapping in spec.iter() {
            let mut node = &mut top;
            for component in mapping.components()? {
                node = node.children.entry(component).or_default();
            }
            if let Some(previous) = &node.binding {
                debug!(
                    target: "mapfs::builder",
                    path = %mapping.path.display(),
                    previous = %previous.underlying_path.display(),
                    "later mapping overrides earlier one"
                );
            }
            node.binding = Some(Binding {
                underlying_path: mapping.underlying_path.clone(),
                writable: mapping.writable,
            });
        }
        Ok(top)
    }

    fn materialize(
        self,
        virtual_path: &Path,
        cache: &NodeCache,
        layout: &mut Layout,
    ) -> FsResult<NodeRef> {
        let mut hosted = Mounts::new();
        for (name, child) in self.children {
            let child_path = virtual_path.join(&name);
            hosted.insert(name, child.materialize(&child_path, cache, layout)?);
        }

        let node = match self.binding {
            None => cache.get_or_create_scaffold(virtual_path),
            Some(binding) => {
                let metadata = fs::symlink_metadata(&binding.underlying_path).map_err(|err| {
                    warn!(
                        target: "mapfs::builder",
                        path = %virtual_path.display(),
                        underlying = %binding.underlying_path.display(),
                        %err,
                        "cannot stat mapping target"
                    );
                    FsError::invalid(format!(
                        "cannot map {} to {}: {err}",
                        virtual_path.display(),
                        binding.underlying_path.display()
                    ))
                })?;
                if !hosted.is_empty() && !metadata.is_dir() {
                    return Err(FsError::invalid(format!(
                        "cannot nest mappings under {}: {} is not a directory",
                        virtual_path.display(),
                        binding.underlying_path.display()
                    )));
                }
                let node =
                    cache.get_or_create(&binding.underlying_path, &metadata, binding.writable);
                layout.bound.insert(node.inode());
                node
            }
        };

        if !hosted.is_empty() {
            // One directory bound at several virtual paths hosts the union.
            layout.mounts.entry(node.inode()).or_default().extend(hosted);
        }
        Ok(node)
    }
}

/// Build the directory tree described by `spec`.
///
/// Later mappings win over earlier ones with the same virtual path. Path
/// components with no mapping of their own become scaffold directories.
pub fn build(spec: &MappingSpec, cache: &NodeCache) -> FsResult<Tree> {
    spec.validate()?;
    let pending = PendingDir::from_spec(spec)?;
    let mut layout = Layout::default();
    let top = pending.materialize(Path::new("/"), cache, &mut layout)?;
    if !top.is_dir() {
        return Err(FsError::invalid("the root mapping must be a directory"));
    }
    debug!(
        target: "mapfs::builder",
        mappings = spec.len(),
        top = top.inode(),
        "built tree"
    );
    Ok(Tree::new(top, layout.mounts, layout.bound))
}
