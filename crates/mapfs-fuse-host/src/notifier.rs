// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel cache invalidation through the FUSE session notifier

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use mapfs_core::Invalidator;
use std::ffi::OsStr;
use std::io;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Late-bound handle to the session notifier.
///
/// The notifier only exists once the session is mounted, after the
/// filesystem has been handed to fuser, so it is installed into a shared
/// slot. Invalidations before that point have nothing to invalidate.
#[derive(Clone, Default)]
pub struct NotifierSlot {
    notifier: Arc<OnceLock<fuser::Notifier>>,
}

impl NotifierSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, notifier: fuser::Notifier) {
        if self.notifier.set(notifier).is_err() {
            debug!(target: "mapfs::fuse", "notifier already installed");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.notifier.get().is_some()
    }
}

impl Invalidator for NotifierSlot {
    fn invalidate_node_data(&self, ino: u64) -> io::Result<()> {
        match self.notifier.get() {
            Some(notifier) => notifier.inval_inode(ino, 0, 0),
            None => Ok(()),
        }
    }

    fn invalidate_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        match self.notifier.get() {
            Some(notifier) => notifier.inval_entry(parent, name),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninstalled_slot_swallows_invalidations() {
        let slot = NotifierSlot::new();
        assert!(!slot.is_installed());
        assert!(slot.invalidate_node_data(1).is_ok());
        assert!(slot.invalidate_entry(1, OsStr::new("x")).is_ok());
    }
}
