// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel cache invalidation seam
//!
//! The kernel protocol session is reached only through [`Invalidator`], so
//! the node model stays independent of the FUSE transport. Invalidation is a
//! cache-coherency hint: failures are logged and never surfaced to callers.

use std::ffi::OsStr;
use std::io;
use tracing::{debug, warn};

/// Kernel-side cache eviction calls.
#[cfg_attr(test, mockall::automock)]
pub trait Invalidator: Send + Sync {
    /// Drop cached attributes and data of `ino`.
    fn invalidate_node_data(&self, ino: u64) -> io::Result<()>;

    /// Drop the cached directory entry `name` under `parent`, positive or negative.
    fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()>;
}

/// Invalidator for sessions that have no kernel attached yet.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullInvalidator;

impl Invalidator for NullInvalidator {
    fn invalidate_node_data(&self, _ino: u64) -> io::Result<()> {
        Ok(())
    }

    fn invalidate_entry(&self, _parent: u64, _name: &OsStr) -> io::Result<()> {
        Ok(())
    }
}

/// Log the outcome of an invalidation call.
///
/// ENOENT means the kernel never saw (or already forgot) the node, which is routine.
pub fn log_invalidation_error(result: io::Result<()>, what: &str, ino: u64) {
    if let Err(err) = result {
        if err.raw_os_error() == Some(libc::ENOENT) {
            debug!(target: "mapfs::invalidate", ino, %err, "{what}: node unknown to kernel");
        } else {
            warn!(target: "mapfs::invalidate", ino, %err, "{what}");
        }
    }
}
