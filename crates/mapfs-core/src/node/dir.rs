// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::{BaseNode, Directory, Fingerprint, Mounts, Node, NodeRef};
use crate::cache::NodeCache;
use crate::error::{FsError, FsResult};
use crate::invalidate::{log_invalidation_error, Invalidator};
use crate::tree::Tree;
use crate::types::Dirent;
use nix::sys::stat::{Mode, SFlag};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A directory backed by a directory on the underlying filesystem.
///
/// Nested mappings hosted by the directory come from the serving [`Tree`]
/// and shadow underlying entries of the same name. `children` remembers
/// underlying entries seen by lookup or readdir so they keep their identity
/// and can be invalidated.
#[derive(Debug)]
pub struct MappedDir {
    base: BaseNode,
    children: Mutex<BTreeMap<OsString, NodeRef>>,
}

impl MappedDir {
    pub(crate) fn new(path: PathBuf, metadata: &Metadata, writable: bool, inode: u64) -> Self {
        Self {
            base: BaseNode::new(path, metadata, writable, inode),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    fn mounts<'t>(&self, tree: &'t Tree) -> &'t Mounts {
        tree.mounts(self.base.inode())
    }

    fn child_path(&self, name: &OsStr) -> PathBuf {
        self.base.underlying_path().join(name)
    }

    /// Refuse to touch names that belong to nested mappings.
    fn check_not_mapped(&self, tree: &Tree, name: &OsStr) -> FsResult<()> {
        if self.mounts(tree).contains_key(name) {
            Err(FsError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    /// Node for an underlying child, reusing the one we already hold when the
    /// underlying object is unchanged.
    fn adopt(&self, name: &OsStr, path: &Path, metadata: &Metadata, cache: &NodeCache) -> NodeRef {
        let fingerprint = Fingerprint::of(metadata);
        if let Some(existing) = self.children.lock().get(name) {
            if existing.fingerprint() == Some(fingerprint)
                && existing.underlying_path().as_deref() == Some(path)
            {
                return Arc::clone(existing);
            }
        }
        let node = cache.get_or_create(path, metadata, self.base.writable());
        self.children.lock().insert(name.to_os_string(), Arc::clone(&node));
        node
    }

    fn forget_child(&self, name: &OsStr) {
        self.children.lock().remove(name);
    }

    fn created(&self, name: &OsStr, cache: &NodeCache) -> FsResult<NodeRef> {
        let path = self.child_path(name);
        let metadata = fs::symlink_metadata(&path)?;
        Ok(self.adopt(name, &path, &metadata, cache))
    }

    fn check_creatable(&self, tree: &Tree, name: &OsStr) -> FsResult<()> {
        self.base.check_writable()?;
        if self.mounts(tree).contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    /// Move this directory (and every materialized descendant) to `path`.
    ///
    /// Descendants that are themselves mapping targets stay where their
    /// mapping points; they are only dropped from the child map, so the next
    /// lookup adopts a node for the moved object.
    pub(crate) fn rebase(&self, path: PathBuf, tree: &Tree) {
        let children: Vec<(OsString, NodeRef)> = self
            .children
            .lock()
            .iter()
            .map(|(name, node)| (name.clone(), Arc::clone(node)))
            .collect();
        for (name, child) in children {
            if tree.is_bound(&child) {
                self.forget_child(&name);
            } else {
                child.rebase(path.join(&name), tree);
            }
        }
        self.base.set_underlying_path(path);
    }

    pub(crate) fn invalidate(&self, invalidator: &dyn Invalidator) {
        let ino = self.base.inode();
        log_invalidation_error(
            invalidator.invalidate_node_data(ino),
            "could not invalidate directory",
            ino,
        );
    }
}

impl Directory for MappedDir {
    fn lookup(&self, tree: &Tree, name: &OsStr, cache: &NodeCache) -> FsResult<NodeRef> {
        if let Some(node) = self.mounts(tree).get(name) {
            return Ok(Arc::clone(node));
        }
        let path = self.child_path(name);
        match fs::symlink_metadata(&path) {
            Ok(metadata) => Ok(self.adopt(name, &path, &metadata, cache)),
            Err(err) => {
                let err = FsError::from(err);
                if err.is_not_found() {
                    self.forget_child(name);
                }
                Err(err)
            }
        }
    }

    fn readdir(&self, tree: &Tree, cache: &NodeCache) -> FsResult<Vec<Dirent>> {
        let mounts = self.mounts(tree);
        let dir_path = self.base.underlying_path();
        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&dir_path)? {
            let entry = entry?;
            let name = entry.file_name();
            if mounts.contains_key(&name) {
                continue;
            }
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                // Raced with a removal; skip it like it was never there.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let node = self.adopt(&name, &path, &metadata, cache);
            entries.insert(name, node);
        }

        self.children
            .lock()
            .retain(|name, _| entries.contains_key(name));

        let mut dirents: Vec<Dirent> = entries
            .iter()
            .map(|(name, node)| node.dirent(name))
            .collect();
        dirents.extend(mounts.iter().map(|(name, node)| node.dirent(name)));
        dirents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(dirents)
    }

    fn create(
        &self,
        tree: &Tree,
        name: &OsStr,
        mode: u32,
        flags: i32,
        cache: &NodeCache,
    ) -> FsResult<(NodeRef, File)> {
        self.check_creatable(tree, name)?;
        let access = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access != libc::O_WRONLY)
            .write(true)
            .create_new(flags & libc::O_EXCL != 0)
            .create(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode & 0o7777)
            .open(self.child_path(name))?;
        let node = self.created(name, cache)?;
        debug!(target: "mapfs::node", ino = node.inode(), ?name, "created file");
        Ok((node, file))
    }

    fn mkdir(&self, tree: &Tree, name: &OsStr, mode: u32, cache: &NodeCache) -> FsResult<NodeRef> {
        self.check_creatable(tree, name)?;
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.child_path(name))?;
        self.created(name, cache)
    }

    fn mknod(
        &self,
        tree: &Tree,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        cache: &NodeCache,
    ) -> FsResult<NodeRef> {
        self.check_creatable(tree, name)?;
        nix::sys::stat::mknod(
            &self.child_path(name),
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            rdev as libc::dev_t,
        )?;
        self.created(name, cache)
    }

    fn symlink(
        &self,
        tree: &Tree,
        name: &OsStr,
        target: &Path,
        cache: &NodeCache,
    ) -> FsResult<NodeRef> {
        self.check_creatable(tree, name)?;
        std::os::unix::fs::symlink(target, self.child_path(name))?;
        self.created(name, cache)
    }

    fn remove(&self, tree: &Tree, name: &OsStr, dir: bool, cache: &NodeCache) -> FsResult<()> {
        self.base.check_writable()?;
        self.check_not_mapped(tree, name)?;
        let path = self.child_path(name);
        if dir {
            fs::remove_dir(&path)?;
        } else {
            let metadata = fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                return Err(FsError::IsADirectory);
            }
            fs::remove_file(&path)?;
        }
        self.forget_child(name);
        cache.evict(&path);
        Ok(())
    }

    fn rename(
        &self,
        tree: &Tree,
        name: &OsStr,
        new_dir: &Node,
        new_name: &OsStr,
        cache: &NodeCache,
    ) -> FsResult<()> {
        self.base.check_writable()?;
        self.check_not_mapped(tree, name)?;
        let target = match new_dir {
            Node::Dir(dir) => dir,
            Node::Scaffold(_) => return Err(FsError::PermissionDenied),
            _ => return Err(FsError::NotADirectory),
        };
        target.base.check_writable()?;
        target.check_not_mapped(tree, new_name)?;

        let from = self.child_path(name);
        let to = target.child_path(new_name);
        fs::rename(&from, &to)?;

        let moved = self.children.lock().remove(name);
        target.forget_child(new_name);
        cache.evict(&from);
        cache.evict(&to);
        match moved {
            // A mapping keeps pointing at its own path; the moved object gets
            // a node of its own on the next lookup.
            Some(node) if tree.is_bound(&node) => {
                debug!(target: "mapfs::node", ino = node.inode(), ?name, "renamed a mapping target");
            }
            Some(node) => {
                node.rebase(to, tree);
                target
                    .children
                    .lock()
                    .insert(new_name.to_os_string(), node);
            }
            None => {}
        }
        Ok(())
    }

    fn known_children(&self, tree: &Tree) -> Vec<(OsString, NodeRef)> {
        let mounts = self.mounts(tree);
        let mut known: Vec<(OsString, NodeRef)> = self
            .children
            .lock()
            .iter()
            .filter(|(name, _)| !mounts.contains_key(*name))
            .map(|(name, node)| (name.clone(), Arc::clone(node)))
            .collect();
        known.extend(mounts.iter().map(|(name, node)| (name.clone(), Arc::clone(node))));
        known.sort_by(|a, b| a.0.cmp(&b.0));
        known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::config::{Mapping, MappingSpec};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        cache: NodeCache,
        tree: Tree,
    }

    impl Fixture {
        fn new(writable: bool) -> Self {
            Self::with_mappings(writable, |_| Vec::new())
        }

        /// `/` mapped onto a populated temp dir, plus `extra` mappings.
        fn with_mappings(writable: bool, extra: impl FnOnce(&Path) -> Vec<Mapping>) -> Self {
            let temp = TempDir::new().unwrap();
            fs::write(temp.path().join("file"), b"content").unwrap();
            fs::create_dir(temp.path().join("sub")).unwrap();
            std::os::unix::fs::symlink("file", temp.path().join("link")).unwrap();
            let mut mappings = vec![Mapping::new("/", temp.path(), writable)];
            mappings.extend(extra(temp.path()));
            let cache = NodeCache::new();
            let tree = build(&MappingSpec::new(mappings), &cache).unwrap();
            Self { temp, cache, tree }
        }

        fn dir(&self) -> &NodeRef {
            self.tree.top()
        }

        fn ops(&self) -> &dyn Directory {
            self.dir().as_dir().unwrap()
        }

        fn lookup(&self, name: &str) -> FsResult<NodeRef> {
            self.ops().lookup(&self.tree, OsStr::new(name), &self.cache)
        }
    }

    #[test]
    fn lookup_preserves_identity() {
        let fx = Fixture::new(false);
        let first = fx.lookup("file").unwrap();
        let second = fx.lookup("file").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(&*first, Node::File(_)));
    }

    #[test]
    fn lookup_of_vanished_entry_is_not_found() {
        let fx = Fixture::new(false);
        fx.lookup("file").unwrap();
        fs::remove_file(fx.temp.path().join("file")).unwrap();
        assert!(fx.lookup("file").unwrap_err().is_not_found());
    }

    #[test]
    fn readdir_lists_underlying_entries_with_kinds() {
        let fx = Fixture::new(false);
        let entries = fx.ops().readdir(&fx.tree, &fx.cache).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["file", "link", "sub"]);
        assert_eq!(entries[0].kind, crate::types::EntryType::RegularFile);
        assert_eq!(entries[1].kind, crate::types::EntryType::Symlink);
        assert_eq!(entries[2].kind, crate::types::EntryType::Directory);

        let looked_up = fx.lookup("sub").unwrap();
        assert_eq!(looked_up.inode(), entries[2].ino);
    }

    #[test]
    fn read_only_directory_rejects_every_mutation() {
        let fx = Fixture::new(false);
        let (ops, tree, cache) = (fx.ops(), &fx.tree, &fx.cache);
        let name = OsStr::new("new");
        assert!(matches!(
            ops.create(tree, name, 0o644, libc::O_RDWR, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.mkdir(tree, name, 0o755, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.mknod(tree, name, libc::S_IFIFO | 0o644, 0, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.symlink(tree, name, Path::new("file"), cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.remove(tree, OsStr::new("file"), false, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.rename(tree, OsStr::new("file"), fx.dir(), name, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(fx.temp.path().join("file").exists());
        assert!(!fx.temp.path().join("new").exists());
    }

    #[test]
    fn writable_directory_creates_and_removes() {
        let fx = Fixture::new(true);
        let (ops, tree, cache) = (fx.ops(), &fx.tree, &fx.cache);

        let (node, _file) = ops
            .create(tree, OsStr::new("made"), 0o644, libc::O_RDWR, cache)
            .unwrap();
        assert!(node.writable());
        assert!(fx.temp.path().join("made").is_file());

        let sub = ops.mkdir(tree, OsStr::new("made-dir"), 0o755, cache).unwrap();
        assert!(sub.is_dir());

        let fifo = ops
            .mknod(tree, OsStr::new("pipe"), libc::S_IFIFO | 0o644, 0, cache)
            .unwrap();
        assert_eq!(fifo.attr().unwrap().kind, crate::types::EntryType::NamedPipe);

        let link = ops
            .symlink(tree, OsStr::new("made-link"), Path::new("made"), cache)
            .unwrap();
        assert_eq!(link.as_symlink().unwrap().readlink().unwrap(), PathBuf::from("made"));

        ops.remove(tree, OsStr::new("made"), false, cache).unwrap();
        ops.remove(tree, OsStr::new("made-dir"), true, cache).unwrap();
        assert!(!fx.temp.path().join("made").exists());
        assert!(matches!(
            ops.remove(tree, OsStr::new("sub"), false, cache),
            Err(FsError::IsADirectory)
        ));
    }

    #[test]
    fn rename_moves_node_and_keeps_identity() {
        let fx = Fixture::new(true);
        let before = fx.lookup("file").unwrap();

        fx.ops()
            .rename(&fx.tree, OsStr::new("file"), fx.dir(), OsStr::new("renamed"), &fx.cache)
            .unwrap();

        assert!(fx.lookup("file").unwrap_err().is_not_found());
        let after = fx.lookup("renamed").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(
            after.underlying_path().unwrap(),
            fx.temp.path().join("renamed")
        );
        assert_eq!(after.attr().unwrap().size, 7);
    }

    #[test]
    fn rename_of_directory_rebases_descendants() {
        let fx = Fixture::new(true);
        fs::write(fx.temp.path().join("sub/inner"), b"x").unwrap();
        let sub = fx.lookup("sub").unwrap();
        let inner = sub
            .as_dir()
            .unwrap()
            .lookup(&fx.tree, OsStr::new("inner"), &fx.cache)
            .unwrap();

        fx.ops()
            .rename(&fx.tree, OsStr::new("sub"), fx.dir(), OsStr::new("moved"), &fx.cache)
            .unwrap();

        assert_eq!(
            inner.underlying_path().unwrap(),
            fx.temp.path().join("moved/inner")
        );
        assert_eq!(inner.attr().unwrap().size, 1);
    }

    #[test]
    fn renaming_a_file_bound_elsewhere_leaves_its_mapping_alone() {
        let fx = Fixture::with_mappings(true, |real| vec![Mapping::new("/x", real.join("file"), true)]);
        let x = fx.lookup("x").unwrap();
        // The same underlying file reached through `/` is the very same node.
        assert!(Arc::ptr_eq(&x, &fx.lookup("file").unwrap()));

        fx.ops()
            .rename(&fx.tree, OsStr::new("file"), fx.dir(), OsStr::new("renamed"), &fx.cache)
            .unwrap();

        assert_eq!(x.underlying_path().unwrap(), fx.temp.path().join("file"));
        assert!(x.attr().unwrap_err().is_not_found());
        assert!(matches!(
            x.as_file().unwrap().open(libc::O_WRONLY),
            Err(FsError::NotFound)
        ));

        let renamed = fx.lookup("renamed").unwrap();
        assert!(!Arc::ptr_eq(&x, &renamed));
        assert_eq!(renamed.underlying_path().unwrap(), fx.temp.path().join("renamed"));
        assert_eq!(renamed.attr().unwrap().size, 7);
    }

    #[test]
    fn rebase_skips_descendants_bound_elsewhere() {
        let fx = Fixture::with_mappings(true, |real| {
            fs::write(real.join("sub/inner"), b"x").unwrap();
            vec![Mapping::new("/y", real.join("sub/inner"), true)]
        });
        let y = fx.lookup("y").unwrap();
        let sub = fx.lookup("sub").unwrap();
        let inner = sub
            .as_dir()
            .unwrap()
            .lookup(&fx.tree, OsStr::new("inner"), &fx.cache)
            .unwrap();
        assert!(Arc::ptr_eq(&y, &inner));

        fx.ops()
            .rename(&fx.tree, OsStr::new("sub"), fx.dir(), OsStr::new("moved"), &fx.cache)
            .unwrap();

        assert_eq!(y.underlying_path().unwrap(), fx.temp.path().join("sub/inner"));
        let moved_inner = sub
            .as_dir()
            .unwrap()
            .lookup(&fx.tree, OsStr::new("inner"), &fx.cache)
            .unwrap();
        assert!(!Arc::ptr_eq(&y, &moved_inner));
        assert_eq!(
            moved_inner.underlying_path().unwrap(),
            fx.temp.path().join("moved/inner")
        );
    }

    #[test]
    fn nested_mappings_shadow_and_resist_mutation() {
        let other = TempDir::new().unwrap();
        fs::write(other.path().join("payload"), b"mapped").unwrap();
        let other_path = other.path().to_path_buf();
        let fx = Fixture::with_mappings(true, |_| vec![Mapping::new("/file", &other_path, false)]);
        let (ops, tree, cache) = (fx.ops(), &fx.tree, &fx.cache);

        let found = fx.lookup("file").unwrap();
        assert_eq!(found.underlying_path().unwrap(), other.path());
        let entries = ops.readdir(tree, cache).unwrap();
        let file_entry = entries.iter().find(|e| e.name == "file").unwrap();
        assert_eq!(file_entry.kind, crate::types::EntryType::Directory);

        assert!(matches!(
            ops.remove(tree, OsStr::new("file"), false, cache),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            ops.create(tree, OsStr::new("file"), 0o644, libc::O_RDWR, cache),
            Err(FsError::AlreadyExists)
        ));
        assert!(fx.temp.path().join("file").is_file());
    }
}
