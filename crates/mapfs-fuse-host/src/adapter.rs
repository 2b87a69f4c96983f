// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! mapfs FUSE adapter implementation
//!
//! Maps FUSE operations onto the node tree installed behind the session root.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use crate::session::MapFsSession;
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EBADF, EINVAL, ENAMETOOLONG};
use mapfs_core::{
    Attributes, DirTarget, EntryType, FsError, FsResult, NodeRef, Root, SetAttr, Tree,
    ROOT_INODE,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Maximum single path component length
const NAME_MAX: usize = 255;

/// A node the kernel holds a reference to.
struct InodeEntry {
    node: NodeRef,
    lookups: u64,
}

/// An open underlying file and the node it was opened through.
struct OpenHandle {
    node: NodeRef,
    file: File,
}

/// mapfs FUSE filesystem adapter
pub struct MapFsFuse {
    session: Arc<MapFsSession>,
    /// TTL for attribute cache responses
    attr_ttl: Duration,
    /// TTL for directory entry cache responses
    entry_ttl: Duration,
    /// Nodes handed to the kernel, by inode, until it forgets them
    inodes: HashMap<u64, InodeEntry>,
    /// Open file handles
    handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
}

fn file_type(kind: EntryType) -> FileType {
    match kind {
        EntryType::RegularFile => FileType::RegularFile,
        EntryType::Directory => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
        EntryType::NamedPipe => FileType::NamedPipe,
        EntryType::CharDevice => FileType::CharDevice,
        EntryType::BlockDevice => FileType::BlockDevice,
        EntryType::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &Attributes) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log a failed operation and turn it into the reply error code.
fn errno(op: &'static str, err: FsError) -> c_int {
    debug!(target: "mapfs::fuse", op, %err, "operation failed");
    err.errno()
}

fn name_too_long(name: &OsStr) -> bool {
    name.as_bytes().len() > NAME_MAX
}

impl MapFsFuse {
    pub fn new(session: Arc<MapFsSession>) -> Self {
        let policy = session.policy();
        let attr_ttl = Duration::from_millis(policy.attr_ttl_ms as u64);
        let entry_ttl = Duration::from_millis(policy.entry_ttl_ms as u64);
        Self {
            session,
            attr_ttl,
            entry_ttl,
            inodes: HashMap::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Node behind `ino`; the root inode resolves to the top of `tree`.
    ///
    /// Every request resolves its nodes and hosted mappings against a single
    /// snapshot, so a concurrent reconfiguration is seen whole or not at all.
    fn node(&self, tree: &Tree, ino: u64) -> FsResult<NodeRef> {
        if ino == FUSE_ROOT_ID {
            return Ok(Arc::clone(tree.top()));
        }
        self.inodes
            .get(&ino)
            .map(|entry| Arc::clone(&entry.node))
            .ok_or(FsError::NotFound)
    }

    fn attr(&self, ino: u64) -> FsResult<Attributes> {
        if ino == FUSE_ROOT_ID {
            self.session.root().attr()
        } else {
            self.node(&self.session.root().tree(), ino)?.attr()
        }
    }

    /// Account for one more kernel reference to `node`.
    fn remember(&mut self, node: &NodeRef) {
        self.inodes
            .entry(node.inode())
            .or_insert_with(|| InodeEntry {
                node: Arc::clone(node),
                lookups: 0,
            })
            .lookups += 1;
    }

    fn forget_inode(&mut self, ino: u64, nlookup: u64) {
        if let Entry::Occupied(mut entry) = self.inodes.entry(ino) {
            let remaining = entry.get().lookups.saturating_sub(nlookup);
            if remaining == 0 {
                entry.remove();
            } else {
                entry.get_mut().lookups = remaining;
            }
        }
    }

    fn alloc_handle(&mut self, node: NodeRef, file: File) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, OpenHandle { node, file });
        fh
    }

    fn reply_entry(&mut self, op: &'static str, result: FsResult<NodeRef>, reply: ReplyEntry) {
        match result.and_then(|node| node.attr().map(|attr| (node, attr))) {
            Ok((node, attr)) => {
                self.remember(&node);
                reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0);
            }
            Err(err) => reply.error(errno(op, err)),
        }
    }

    fn rename_nodes(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> FsResult<()> {
        let root = self.session.root();
        let cache = self.session.cache();
        let new_dir;
        let target = if newparent == FUSE_ROOT_ID {
            DirTarget::Root(root)
        } else {
            new_dir = self.node(&root.tree(), newparent)?;
            DirTarget::Node(&new_dir)
        };
        if parent == FUSE_ROOT_ID {
            root.rename(name, target, newname, cache)
        } else {
            let tree = root.tree();
            self.node(&tree, parent)?
                .as_dir()?
                .rename(&tree, name, &Root::resolve(target), newname, cache)
        }
    }
}

impl fuser::Filesystem for MapFsFuse {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!(
            target: "mapfs::fuse",
            attr_ttl_ms = self.attr_ttl.as_millis() as u64,
            entry_ttl_ms = self.entry_ttl.as_millis() as u64,
            "mapfs FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.handles.clear();
        self.inodes.clear();
        info!(target: "mapfs::fuse", "mapfs FUSE adapter destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.forget_inode(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if name_too_long(name) {
            reply.error(ENAMETOOLONG);
            return;
        }
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let result = self
            .node(&tree, parent)
            .and_then(|dir| dir.as_dir()?.lookup(&tree, name, session.cache()));
        self.reply_entry("lookup", result, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &to_file_attr(&attr)),
            Err(err) => reply.error(errno("getattr", err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        let tree = self.session.root().tree();
        let result = self.node(&tree, ino).and_then(|node| node.setattr(&changes));
        match result {
            Ok(mut attr) => {
                if ino == FUSE_ROOT_ID {
                    attr.ino = ROOT_INODE;
                }
                reply.attr(&self.attr_ttl, &to_file_attr(&attr));
            }
            Err(err) => reply.error(errno("setattr", err)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let tree = self.session.root().tree();
        match self
            .node(&tree, ino)
            .and_then(|node| node.as_symlink()?.readlink())
        {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(err) => reply.error(errno("readlink", err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if name_too_long(name) {
            reply.error(ENAMETOOLONG);
            return;
        }
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let result = self.node(&tree, parent).and_then(|dir| {
            dir.as_dir()?
                .mknod(&tree, name, mode & !(umask & 0o7777), rdev, session.cache())
        });
        self.reply_entry("mknod", result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        if name_too_long(name) {
            reply.error(ENAMETOOLONG);
            return;
        }
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let result = self.node(&tree, parent).and_then(|dir| {
            dir.as_dir()?
                .mkdir(&tree, name, mode & !umask, session.cache())
        });
        self.reply_entry("mkdir", result, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        match self
            .node(&tree, parent)
            .and_then(|dir| dir.as_dir()?.remove(&tree, name, false, session.cache()))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("unlink", err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        match self
            .node(&tree, parent)
            .and_then(|dir| dir.as_dir()?.remove(&tree, name, true, session.cache()))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("rmdir", err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if name_too_long(link_name) {
            reply.error(ENAMETOOLONG);
            return;
        }
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let result = self.node(&tree, parent).and_then(|dir| {
            dir.as_dir()?
                .symlink(&tree, link_name, target, session.cache())
        });
        self.reply_entry("symlink", result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if name_too_long(name) || name_too_long(newname) {
            reply.error(ENAMETOOLONG);
            return;
        }
        // RENAME_NOREPLACE and RENAME_EXCHANGE are not passed through.
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        match self.rename_nodes(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("rename", err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let tree = self.session.root().tree();
        let opened = self
            .node(&tree, ino)
            .and_then(|node| node.as_file()?.open(flags).map(|file| (node, file)));
        match opened {
            Ok((node, file)) => {
                let fh = self.alloc_handle(node, file);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(errno("open", err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        let result = handle
            .node
            .as_file()
            .and_then(|file| file.read(&handle.file, offset.max(0) as u64, size as usize));
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno("read", err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        let result = handle
            .node
            .as_file()
            .and_then(|file| file.write(&handle.file, offset.max(0) as u64, data));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno("write", err)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        match handle.node.as_file().and_then(|file| file.flush(&handle.file)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("flush", err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        match handle
            .node
            .as_file()
            .and_then(|file| file.fsync(&handle.file, datasync))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("fsync", err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let tree = self.session.root().tree();
        match self.node(&tree, ino).and_then(|node| node.as_dir().map(|_| ())) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(errno("opendir", err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let entries = match self
            .node(&tree, ino)
            .and_then(|dir| dir.as_dir()?.readdir(&tree, session.cache()))
        {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno("readdir", err));
                return;
            }
        };

        let dots = [
            (ino, FileType::Directory, OsStr::new(".")),
            (ino, FileType::Directory, OsStr::new("..")),
        ];
        let listing = dots.into_iter().chain(
            entries
                .iter()
                .map(|entry| (entry.ino, file_type(entry.kind), entry.name.as_os_str())),
        );
        for (i, (entry_ino, kind, name)) in listing.enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if name_too_long(name) {
            reply.error(ENAMETOOLONG);
            return;
        }
        let session = Arc::clone(&self.session);
        let tree = session.root().tree();
        let created = self.node(&tree, parent).and_then(|dir| {
            let (node, file) = dir
                .as_dir()?
                .create(&tree, name, mode & !umask, flags, session.cache())?;
            let attr = node.attr()?;
            Ok((node, file, attr))
        });
        match created {
            Ok((node, file, attr)) => {
                self.remember(&node);
                let fh = self.alloc_handle(node, file);
                reply.created(&self.entry_ttl, &to_file_attr(&attr), 0, fh, 0);
            }
            Err(err) => reply.error(errno("create", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapfs_core::{FsConfig, Mapping, MappingSpec};
    use tempfile::TempDir;

    fn adapter(mappings: Vec<Mapping>) -> MapFsFuse {
        let mut config = FsConfig {
            mappings: MappingSpec::new(mappings),
            ..FsConfig::default()
        };
        config.cache.attr_ttl_ms = 1500;
        config.cache.entry_ttl_ms = 2500;
        MapFsFuse::new(Arc::new(MapFsSession::new(&config).expect("session")))
    }

    #[test]
    fn cache_ttls_follow_config() {
        let fuse = adapter(vec![]);
        assert_eq!(fuse.attr_ttl, Duration::from_millis(1500));
        assert_eq!(fuse.entry_ttl, Duration::from_millis(2500));
    }

    #[test]
    fn root_inode_tracks_installed_tree() {
        let temp = TempDir::new().unwrap();
        let fuse = adapter(vec![Mapping::new("/", temp.path(), false)]);
        let tree = fuse.session.root().tree();
        let top = fuse.node(&tree, FUSE_ROOT_ID).unwrap();
        assert!(Arc::ptr_eq(&top, &fuse.session.root().current()));
        assert_eq!(fuse.attr(FUSE_ROOT_ID).unwrap().ino, FUSE_ROOT_ID);
        assert!(fuse.node(&tree, top.inode() + 100).unwrap_err().is_not_found());
    }

    #[test]
    fn forget_releases_nodes_after_last_lookup() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f"), b"").unwrap();
        let mut fuse = adapter(vec![Mapping::new("/", temp.path(), false)]);
        let node = fuse
            .session
            .root()
            .lookup(OsStr::new("f"), fuse.session.cache())
            .unwrap();
        fuse.remember(&node);
        fuse.remember(&node);
        let tree = fuse.session.root().tree();
        fuse.forget_inode(node.inode(), 1);
        assert!(fuse.node(&tree, node.inode()).is_ok());
        fuse.forget_inode(node.inode(), 1);
        assert!(fuse.node(&tree, node.inode()).is_err());
    }

    #[test]
    fn attributes_convert_to_fuse_kinds() {
        let temp = TempDir::new().unwrap();
        let fuse = adapter(vec![Mapping::new("/", temp.path(), false)]);
        let attr = to_file_attr(&fuse.attr(FUSE_ROOT_ID).unwrap());
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.ino, FUSE_ROOT_ID);
    }
}
