// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! State shared by the kernel adapter and the reconfiguration channel

use mapfs_core::{build, CachePolicy, FsConfig, FsResult, Invalidator, MappingSpec, NodeCache, Root};
use tracing::{debug, info};

/// One mounted filesystem: its node cache and its root.
#[derive(Debug)]
pub struct MapFsSession {
    cache: NodeCache,
    root: Root,
    policy: CachePolicy,
}

impl MapFsSession {
    pub fn new(config: &FsConfig) -> FsResult<Self> {
        let cache = NodeCache::new();
        let tree = build(&config.mappings, &cache)?;
        let root = Root::new(tree)?;
        info!(
            target: "mapfs::reconfig",
            mappings = config.mappings.len(),
            "initial tree built"
        );
        Ok(Self {
            cache,
            root,
            policy: config.cache.clone(),
        })
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Build a tree for `spec` and install it.
    ///
    /// A spec that fails to build leaves the installed tree untouched. Cache
    /// slots of nodes only the retired tree held are dropped afterwards.
    pub fn reconfigure(&self, spec: &MappingSpec, invalidator: &dyn Invalidator) -> FsResult<()> {
        let tree = build(spec, &self.cache)?;
        self.root.reconfigure(invalidator, tree)?;
        let pruned = self.cache.prune();
        debug!(
            target: "mapfs::cache",
            pruned,
            live = self.cache.len(),
            "pruned cache after reconfiguration"
        );
        Ok(())
    }
}
