// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::BaseNode;
use crate::error::FsResult;
use crate::invalidate::{log_invalidation_error, Invalidator};
use crate::types::{Attributes, EntryType, SetAttr};
use parking_lot::Mutex;
use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use tracing::debug;

/// Last observed content of the underlying file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ContentStamp {
    mtime: i64,
    mtime_nsec: i64,
    size: u64,
}

impl ContentStamp {
    fn of(metadata: &Metadata) -> Self {
        Self {
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            size: metadata.size(),
        }
    }
}

/// A regular (or special) file backed by a file on the underlying filesystem.
#[derive(Debug)]
pub struct MappedFile {
    base: BaseNode,
    entry_type: EntryType,
    /// Held across every mutation so the stamp never lags behind the file.
    stamp: Mutex<ContentStamp>,
}

impl MappedFile {
    pub(crate) fn new(path: PathBuf, metadata: &Metadata, writable: bool, inode: u64) -> Self {
        Self {
            base: BaseNode::new(path, metadata, writable, inode),
            entry_type: EntryType::from_file_type(metadata.file_type()),
            stamp: Mutex::new(ContentStamp::of(metadata)),
        }
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn attr(&self) -> FsResult<Attributes> {
        let _guard = self.stamp.lock();
        self.base.attr()
    }

    pub fn setattr(&self, changes: &SetAttr) -> FsResult<Attributes> {
        let mut stamp = self.stamp.lock();
        let attr = self.base.setattr(changes)?;
        *stamp = ContentStamp::of(&self.base.metadata()?);
        Ok(attr)
    }

    /// Open the underlying file with the kernel-provided open flags.
    pub fn open(&self, flags: i32) -> FsResult<File> {
        let access = flags & libc::O_ACCMODE;
        let wants_write = access == libc::O_WRONLY || access == libc::O_RDWR;
        let truncate = flags & libc::O_TRUNC != 0;
        if wants_write || truncate {
            self.base.check_writable()?;
        }

        let mut options = OpenOptions::new();
        options
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(wants_write)
            .append(flags & libc::O_APPEND != 0)
            .truncate(truncate && wants_write)
            .custom_flags(
                flags
                    & !(libc::O_ACCMODE
                        | libc::O_CREAT
                        | libc::O_EXCL
                        | libc::O_TRUNC
                        | libc::O_APPEND),
            );

        let mut stamp = self.stamp.lock();
        let file = options.open(self.base.underlying_path())?;
        if truncate {
            *stamp = ContentStamp::of(&file.metadata()?);
        }
        Ok(file)
    }

    pub fn read(&self, file: &File, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, file: &File, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.base.check_writable()?;
        let mut stamp = self.stamp.lock();
        file.write_all_at(data, offset)?;
        *stamp = ContentStamp::of(&file.metadata()?);
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) -> FsResult<()> {
        self.base.check_writable()?;
        let mut stamp = self.stamp.lock();
        let file = OpenOptions::new().write(true).open(self.base.underlying_path())?;
        file.set_len(size)?;
        *stamp = ContentStamp::of(&file.metadata()?);
        Ok(())
    }

    /// Called on every close of a descriptor; brings the stamp up to date.
    pub fn flush(&self, file: &File) -> FsResult<()> {
        let mut stamp = self.stamp.lock();
        *stamp = ContentStamp::of(&file.metadata()?);
        Ok(())
    }

    pub fn fsync(&self, file: &File, datasync: bool) -> FsResult<()> {
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Drop the kernel's cached data if the file changed since we last looked at it.
    ///
    /// The stamp lock is released before the kernel is called: a pending
    /// write may hold kernel page locks while it waits for this node.
    pub(crate) fn invalidate(&self, invalidator: &dyn Invalidator) {
        let changed = {
            let mut stamp = self.stamp.lock();
            let current = fs::symlink_metadata(self.base.underlying_path())
                .ok()
                .map(|metadata| ContentStamp::of(&metadata));
            match current {
                Some(current) if current == *stamp => false,
                Some(current) => {
                    *stamp = current;
                    true
                }
                None => true,
            }
        };
        if !changed {
            return;
        }
        let ino = self.base.inode();
        debug!(target: "mapfs::invalidate", ino, "file content changed; invalidating");
        log_invalidation_error(
            invalidator.invalidate_node_data(ino),
            "could not invalidate file data",
            ino,
        );
    }
}
