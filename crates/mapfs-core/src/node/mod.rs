// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Virtual nodes served to the kernel
//!
//! Every node kind embeds a [`BaseNode`] and is wrapped in the closed [`Node`]
//! enum. Nodes are only constructed by [`crate::cache::NodeCache`], which is
//! what keeps a node's identity stable across lookups and reconfigurations.

mod dir;
mod file;
mod scaffold;
mod symlink;

pub use dir::MappedDir;
pub use file::MappedFile;
pub use scaffold::ScaffoldDir;
pub use symlink::MappedSymlink;

use crate::cache::NodeCache;
use crate::error::{FsError, FsResult};
use crate::invalidate::Invalidator;
use crate::tree::Tree;
use crate::types::{Attributes, Dirent, EntryType, SetAttr};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, Metadata, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Inode reserved for the mount root.
pub const ROOT_INODE: u64 = 1;

/// Shared handle to a node.
pub type NodeRef = Arc<Node>;

/// Nested mappings hosted by one directory, by name.
pub type Mounts = BTreeMap<OsString, NodeRef>;

/// Hands out inode numbers; never reuses one.
#[derive(Debug)]
pub struct InodeAllocator {
    next: AtomicU64,
}

impl InodeAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse node kind; also part of the cache fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    Scaffold,
}

impl NodeKind {
    pub fn of(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            NodeKind::Dir
        } else if file_type.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::File
        }
    }
}

/// Identity of an underlying object: a replaced object never shares a
/// fingerprint with the one it replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: NodeKind,
    pub dev: u64,
    pub ino: u64,
}

impl Fingerprint {
    pub fn of(metadata: &Metadata) -> Self {
        Self {
            kind: NodeKind::of(metadata),
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// State common to all nodes backed by an underlying path.
#[derive(Debug)]
pub struct BaseNode {
    underlying_path: RwLock<PathBuf>,
    writable: bool,
    inode: u64,
    fingerprint: Fingerprint,
}

impl BaseNode {
    pub(crate) fn new(
        underlying_path: PathBuf,
        metadata: &Metadata,
        writable: bool,
        inode: u64,
    ) -> Self {
        Self {
            underlying_path: RwLock::new(underlying_path),
            writable,
            inode,
            fingerprint: Fingerprint::of(metadata),
        }
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn underlying_path(&self) -> PathBuf {
        self.underlying_path.read().clone()
    }

    /// Point the node at its new location after a rename through the filesystem.
    pub(crate) fn set_underlying_path(&self, path: PathBuf) {
        *self.underlying_path.write() = path;
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    pub(crate) fn metadata(&self) -> FsResult<Metadata> {
        Ok(fs::symlink_metadata(self.underlying_path())?)
    }

    pub fn attr(&self) -> FsResult<Attributes> {
        Ok(Attributes::from_metadata(self.inode, &self.metadata()?))
    }

    pub(crate) fn setattr(&self, changes: &SetAttr) -> FsResult<Attributes> {
        if changes.is_empty() {
            return self.attr();
        }
        self.check_writable()?;
        let path = self.underlying_path();
        let is_symlink = self.fingerprint.kind == NodeKind::Symlink;

        if let Some(mode) = changes.mode {
            if is_symlink {
                return Err(FsError::Unsupported);
            }
            fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&path, changes.uid, changes.gid)?;
        }
        if let Some(size) = changes.size {
            match self.fingerprint.kind {
                NodeKind::Dir => return Err(FsError::IsADirectory),
                NodeKind::Symlink => return Err(FsError::invalid("cannot truncate a symlink")),
                _ => fs::OpenOptions::new().write(true).open(&path)?.set_len(size)?,
            }
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            set_times(&path, changes.atime, changes.mtime)?;
        }
        self.attr()
    }
}

fn timespec_of(time: Option<SystemTime>) -> libc::timespec {
    match time.map(|t| t.duration_since(UNIX_EPOCH)) {
        Some(Ok(since_epoch)) => libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as _,
        },
        Some(Err(_)) => libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

fn set_times(path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> FsResult<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::invalid("path contains an interior NUL byte"))?;
    let times = [timespec_of(atime), timespec_of(mtime)];
    // SAFETY: c_path is NUL-terminated and times points to two timespec values.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Directory capability set shared by mapped and scaffold directories.
///
/// `tree` is the generation the request is served from; it supplies the
/// nested mappings hosted by this directory.
pub trait Directory: Send + Sync {
    fn lookup(&self, tree: &Tree, name: &OsStr, cache: &NodeCache) -> FsResult<NodeRef>;

    fn readdir(&self, tree: &Tree, cache: &NodeCache) -> FsResult<Vec<Dirent>>;

    /// Create and open a regular file.
    fn create(
        &self,
        tree: &Tree,
        name: &OsStr,
        mode: u32,
        flags: i32,
        cache: &NodeCache,
    ) -> FsResult<(NodeRef, File)>;

    fn mkdir(&self, tree: &Tree, name: &OsStr, mode: u32, cache: &NodeCache) -> FsResult<NodeRef>;

    fn mknod(
        &self,
        tree: &Tree,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        cache: &NodeCache,
    ) -> FsResult<NodeRef>;

    fn symlink(
        &self,
        tree: &Tree,
        name: &OsStr,
        target: &Path,
        cache: &NodeCache,
    ) -> FsResult<NodeRef>;

    /// Remove a child; `dir` selects rmdir over unlink semantics.
    fn remove(&self, tree: &Tree, name: &OsStr, dir: bool, cache: &NodeCache) -> FsResult<()>;

    fn rename(
        &self,
        tree: &Tree,
        name: &OsStr,
        new_dir: &Node,
        new_name: &OsStr,
        cache: &NodeCache,
    ) -> FsResult<()>;

    /// Children the kernel may hold entries for, sorted by name.
    fn known_children(&self, tree: &Tree) -> Vec<(OsString, NodeRef)>;
}

/// A node of the virtual tree.
#[derive(Debug)]
pub enum Node {
    File(MappedFile),
    Dir(MappedDir),
    Symlink(MappedSymlink),
    Scaffold(ScaffoldDir),
}

impl Node {
    fn base(&self) -> Option<&BaseNode> {
        match self {
            Node::File(file) => Some(file.base()),
            Node::Dir(dir) => Some(dir.base()),
            Node::Symlink(link) => Some(link.base()),
            Node::Scaffold(_) => None,
        }
    }

    pub fn inode(&self) -> u64 {
        match self {
            Node::File(file) => file.base().inode(),
            Node::Dir(dir) => dir.base().inode(),
            Node::Symlink(link) => link.base().inode(),
            Node::Scaffold(scaffold) => scaffold.inode(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Dir(_) => NodeKind::Dir,
            Node::Symlink(_) => NodeKind::Symlink,
            Node::Scaffold(_) => NodeKind::Scaffold,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_) | Node::Scaffold(_))
    }

    /// Underlying path, or `None` for scaffold directories.
    pub fn underlying_path(&self) -> Option<PathBuf> {
        self.base().map(BaseNode::underlying_path)
    }

    pub fn writable(&self) -> bool {
        self.base().map(BaseNode::writable).unwrap_or(false)
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.base().map(BaseNode::fingerprint)
    }

    pub fn attr(&self) -> FsResult<Attributes> {
        match self {
            Node::Scaffold(scaffold) => Ok(scaffold.attr()),
            Node::File(file) => file.attr(),
            Node::Dir(dir) => dir.base().attr(),
            Node::Symlink(link) => link.base().attr(),
        }
    }

    pub fn setattr(&self, changes: &SetAttr) -> FsResult<Attributes> {
        match self {
            Node::Scaffold(scaffold) => scaffold.setattr(changes),
            Node::File(file) => file.setattr(changes),
            Node::Dir(dir) => dir.base().setattr(changes),
            Node::Symlink(link) => link.base().setattr(changes),
        }
    }

    pub fn dirent(&self, name: &OsStr) -> Dirent {
        let kind = match self {
            Node::File(file) => file.entry_type(),
            Node::Dir(_) | Node::Scaffold(_) => EntryType::Directory,
            Node::Symlink(_) => EntryType::Symlink,
        };
        Dirent {
            name: name.to_os_string(),
            ino: self.inode(),
            kind,
        }
    }

    /// Drop the kernel's cached attributes and data of this node, if they may
    /// be stale. Directory entries are handled by [`Tree::invalidate_entries`].
    pub fn invalidate(&self, invalidator: &dyn Invalidator) {
        match self {
            Node::File(file) => file.invalidate(invalidator),
            Node::Dir(dir) => dir.invalidate(invalidator),
            Node::Symlink(link) => link.invalidate(invalidator),
            Node::Scaffold(scaffold) => scaffold.invalidate(invalidator),
        }
    }

    pub fn as_dir(&self) -> FsResult<&dyn Directory> {
        match self {
            Node::Dir(dir) => Ok(dir),
            Node::Scaffold(scaffold) => Ok(scaffold),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_file(&self) -> FsResult<&MappedFile> {
        match self {
            Node::File(file) => Ok(file),
            Node::Dir(_) | Node::Scaffold(_) => Err(FsError::IsADirectory),
            Node::Symlink(_) => Err(FsError::invalid("symlinks cannot be opened")),
        }
    }

    pub fn as_symlink(&self) -> FsResult<&MappedSymlink> {
        match self {
            Node::Symlink(link) => Ok(link),
            _ => Err(FsError::invalid("not a symlink")),
        }
    }

    /// Follow a rename of the underlying object (and, for directories, its subtree).
    pub(crate) fn rebase(&self, path: PathBuf, tree: &Tree) {
        match self {
            Node::Dir(dir) => dir.rebase(path, tree),
            Node::File(file) => file.base().set_underlying_path(path),
            Node::Symlink(link) => link.base().set_underlying_path(path),
            Node::Scaffold(_) => {}
        }
    }
}
