// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol-neutral attribute and directory entry types

use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime};

/// Type of an entry as reported to the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    RegularFile,
    Directory,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl EntryType {
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_fifo() {
            EntryType::NamedPipe
        } else if file_type.is_char_device() {
            EntryType::CharDevice
        } else if file_type.is_block_device() {
            EntryType::BlockDevice
        } else if file_type.is_socket() {
            EntryType::Socket
        } else {
            EntryType::RegularFile
        }
    }
}

/// File attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub ino: u64,
    pub kind: EntryType,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

fn to_system_time(secs: i64, nanos: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nanos.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

impl Attributes {
    /// Attributes of an underlying object, reported under the node's own inode.
    pub fn from_metadata(ino: u64, metadata: &Metadata) -> Self {
        Self {
            ino,
            kind: EntryType::from_file_type(metadata.file_type()),
            size: metadata.size(),
            blocks: metadata.blocks(),
            atime: to_system_time(metadata.atime(), metadata.atime_nsec()),
            mtime: to_system_time(metadata.mtime(), metadata.mtime_nsec()),
            ctime: to_system_time(metadata.ctime(), metadata.ctime_nsec()),
            perm: (metadata.mode() & 0o7777) as u16,
            nlink: metadata.nlink().try_into().unwrap_or(u32::MAX),
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev().try_into().unwrap_or(u32::MAX),
            blksize: metadata.blksize().try_into().unwrap_or(u32::MAX),
        }
    }
}

/// Directory entry handed out by readdir
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub name: OsString,
    pub ino: u64,
    pub kind: EntryType,
}

/// Attribute changes requested through setattr
#[derive(Clone, Debug, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}
