// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest-facing file operations built on the node cache
//!
//! These are the entry points a VFS bridge calls. Each one takes the cache
//! lock once and runs to completion, including any host I/O.

use tracing::{debug, trace, warn};

use crate::cache::{Cache, CacheState};
use crate::error::{FsError, FsResult};
use crate::provider::Provider;
use crate::types::{
    Attributes, CreateOptions, Credentials, DirEntry, DirPage, HostHandle, InstanceId, NodeKind,
    NodeRef, NodeState, ResolveMode, Timespec, ACCESS_EXEC, ACCESS_WRITE,
};

/// Block size reported in attributes.
pub const ATTR_BLOCK_SIZE: u32 = 512;

type HostAttributes = (u32, u64, Timespec, Timespec, Timespec);

fn fetch_attributes(provider: &dyn Provider, path: &str) -> FsResult<HostAttributes> {
    Ok((
        provider.get_mode(path)?,
        provider.get_size(path)?,
        provider.get_atime(path)?,
        provider.get_mtime(path)?,
        provider.get_ctime(path)?,
    ))
}

/// Largest byte position a host file offset can address.
const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

fn is_dot_name(name: &str) -> bool {
    matches!(name, "" | "." | "..")
}

impl Cache {
    /// Look `name` up in `dir` and hand out an external handle on the result.
    pub fn lookup(&self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<NodeRef> {
        self.lock().lookup(dir, name, creds)
    }

    /// Open or create a regular file; the result carries an external handle.
    pub fn create(
        &self,
        dir: NodeRef,
        name: &str,
        options: CreateOptions,
        creds: &Credentials,
    ) -> FsResult<NodeRef> {
        self.lock().create(dir, name, options, creds)
    }

    pub fn mkdir(&self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<NodeRef> {
        self.lock().mkdir(dir, name, creds)
    }

    pub fn remove(&self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<()> {
        self.lock().remove_entry(dir, name, creds, false)
    }

    pub fn rmdir(&self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<()> {
        self.lock().remove_entry(dir, name, creds, true)
    }

    pub fn rename(
        &self,
        old_dir: NodeRef,
        old_name: &str,
        new_dir: NodeRef,
        new_name: &str,
        creds: &Credentials,
    ) -> FsResult<()> {
        self.lock().rename(old_dir, old_name, new_dir, new_name, creds)
    }

    /// Read up to `buf.len()` bytes at `offset`. A short count is not an error.
    pub fn read(&self, node: NodeRef, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.lock().read(node, offset, buf)
    }

    /// Write `data` at `offset`, or at the current host size when `append` is set.
    pub fn write(&self, node: NodeRef, offset: u64, data: &[u8], append: bool) -> FsResult<usize> {
        self.lock().write(node, offset, data, append)
    }

    pub fn truncate(&self, node: NodeRef) -> FsResult<()> {
        self.lock().truncate(node)
    }

    pub fn get_attributes(&self, node: NodeRef) -> FsResult<Attributes> {
        self.lock().get_attributes(node)
    }

    pub fn list_directory(&self, dir: NodeRef, start: usize, max: usize) -> FsResult<DirPage> {
        self.lock().list_directory(dir, start, max)
    }

    /// Drop every node of `instance`. Fails with `Busy` while the guest still
    /// holds any node beyond the mount's own reference on the root.
    pub fn purge_instance(&self, instance: InstanceId) -> FsResult<()> {
        self.lock().purge_instance(instance)
    }
}

impl CacheState {
    fn lookup(&mut self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<NodeRef> {
        if self.node(dir)?.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        if name.is_empty() || name == "." {
            return self.acquire_external_handle(dir);
        }
        if name != ".." {
            self.check_access(dir, ACCESS_EXEC, creds)?;
        }
        let node = self.resolve(dir, name, ResolveMode::LookupOnly)?;
        self.acquire_external_handle(node)
    }

    fn create(
        &mut self,
        dir: NodeRef,
        name: &str,
        options: CreateOptions,
        creds: &Credentials,
    ) -> FsResult<NodeRef> {
        if is_dot_name(name) {
            return Err(FsError::InvalidArgument);
        }
        self.check_access(dir, ACCESS_EXEC, creds)?;
        match self.resolve(dir, name, ResolveMode::LookupOnly) {
            Ok(node) => {
                if options.exclusive {
                    return Err(FsError::AlreadyExists);
                }
                let kind = self.node(node)?.kind;
                if kind == NodeKind::Directory && options.access & ACCESS_WRITE != 0 {
                    return Err(FsError::IsADirectory);
                }
                self.check_access(node, options.access, creds)?;
                if options.truncate && kind == NodeKind::File {
                    self.truncate(node)?;
                }
                self.acquire_external_handle(node)
            }
            Err(FsError::NotFound) => {
                self.check_access(dir, ACCESS_WRITE, creds)?;
                let node = self.resolve(dir, name, ResolveMode::CreateFile)?;
                self.acquire_external_handle(node)
            }
            Err(err) => Err(err),
        }
    }

    fn mkdir(&mut self, dir: NodeRef, name: &str, creds: &Credentials) -> FsResult<NodeRef> {
        if name == ".." {
            return Err(FsError::AlreadyExists);
        }
        if is_dot_name(name) {
            return Err(FsError::InvalidArgument);
        }
        self.check_access(dir, ACCESS_EXEC, creds)?;
        match self.resolve(dir, name, ResolveMode::LookupOnly) {
            Ok(_) => Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {
                self.check_access(dir, ACCESS_WRITE, creds)?;
                let node = self.resolve(dir, name, ResolveMode::CreateDirectory)?;
                self.acquire_external_handle(node)
            }
            Err(err) => Err(err),
        }
    }

    /// Shared body of `remove` and `rmdir`.
    fn remove_entry(
        &mut self,
        dir: NodeRef,
        name: &str,
        creds: &Credentials,
        directory: bool,
    ) -> FsResult<()> {
        if directory && name == ".." {
            return Err(FsError::AlreadyExists);
        }
        if is_dot_name(name) {
            return Err(FsError::InvalidArgument);
        }
        self.check_access(dir, ACCESS_EXEC | ACCESS_WRITE, creds)?;
        let node = self.resolve(dir, name, ResolveMode::LookupOnly)?;

        let (kind, path, held, host_handle) = {
            let entry = self.node(node)?;
            (
                entry.kind,
                entry.path.clone(),
                entry.has_external_handle(),
                entry.host_handle,
            )
        };
        match (directory, kind == NodeKind::Directory) {
            (false, true) => return Err(FsError::IsADirectory),
            (true, false) => return Err(FsError::NotADirectory),
            _ => {}
        }

        let provider = self.provider_of(node)?;
        if let Some(handle) = host_handle {
            if held {
                debug!(path = %path, "refusing to remove an open node");
                return Err(FsError::Busy);
            }
            // Some hosts cannot delete a file that is still open.
            provider.close(handle);
            self.tree.get_mut(node)?.host_handle = None;
        }

        trace!(path = %path, directory, "remove");
        let result = if directory {
            provider.rmdir(&path)
        } else {
            provider.remove(&path)
        };
        match result {
            Ok(()) => self.mark_stale(node),
            Err(FsError::NotFound) => {
                self.mark_stale(node)?;
                Err(FsError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    fn rename(
        &mut self,
        old_dir: NodeRef,
        old_name: &str,
        new_dir: NodeRef,
        new_name: &str,
        creds: &Credentials,
    ) -> FsResult<()> {
        if [old_name, new_name]
            .iter()
            .any(|name| is_dot_name(name) || name.contains('/'))
        {
            return Err(FsError::InvalidArgument);
        }
        self.check_access(old_dir, ACCESS_EXEC | ACCESS_WRITE, creds)?;
        if new_dir != old_dir {
            self.check_access(new_dir, ACCESS_EXEC | ACCESS_WRITE, creds)?;
        }
        let node = self.resolve(old_dir, old_name, ResolveMode::LookupOnly)?;

        let new_path = {
            let target = self.node(new_dir)?;
            if target.kind != NodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            if target.state == NodeState::Stale {
                return Err(FsError::NotFound);
            }
            if target.instance != self.node(node)?.instance {
                return Err(FsError::InvalidArgument);
            }
            format!("{}/{}", target.path, new_name)
        };
        let (old_path, kind) = {
            let entry = self.node(node)?;
            (entry.path.clone(), entry.kind)
        };
        if old_path == new_path {
            return Ok(());
        }
        let is_dir = kind == NodeKind::Directory;
        if is_dir && new_path.starts_with(&format!("{old_path}/")) {
            return Err(FsError::InvalidArgument);
        }

        let provider = self.provider_of(node)?;
        trace!(from = %old_path, to = %new_path, "rename");
        match provider.rename(&old_path, &new_path, is_dir) {
            Ok(()) => self.rename_node(node, new_dir, new_path),
            Err(err) => Err(self.stale_on_missing(node, err)),
        }
    }

    /// Host handle for I/O on `node`, opened on demand.
    fn open_for_io(&mut self, node: NodeRef) -> FsResult<HostHandle> {
        let (path, state, handle) = {
            let entry = self.node(node)?;
            (entry.path.clone(), entry.state, entry.host_handle)
        };
        if let Some(handle) = handle {
            return Ok(handle);
        }
        if state == NodeState::Stale {
            return Err(FsError::NotFound);
        }
        let provider = self.provider_of(node)?;
        match provider.open(&path) {
            Ok(handle) => {
                self.tree.get_mut(node)?.host_handle = Some(handle);
                Ok(handle)
            }
            Err(err) => Err(self.stale_on_missing(node, err)),
        }
    }

    fn require_file(&self, node: NodeRef) -> FsResult<()> {
        match self.node(node)?.kind {
            NodeKind::File => Ok(()),
            NodeKind::Directory => Err(FsError::IsADirectory),
            NodeKind::Unknown => Err(FsError::InvalidArgument),
        }
    }

    fn read(&mut self, node: NodeRef, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.require_file(node)?;
        if offset > MAX_FILE_OFFSET {
            return Err(FsError::InvalidArgument);
        }
        let room = usize::try_from(MAX_FILE_OFFSET - offset).unwrap_or(usize::MAX);
        let len = room.min(buf.len());
        let buf = &mut buf[..len];
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.config_of(node)?.io_chunk_size;
        let provider = self.provider_of(node)?;
        let handle = self.open_for_io(node)?;

        let mut done = 0;
        while done < buf.len() {
            let end = buf.len().min(done + chunk);
            let want = end - done;
            match provider.read(handle, offset + done as u64, &mut buf[done..end]) {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(err) if done > 0 => {
                    warn!(error = %err, done, "read stopped after partial transfer");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn write(&mut self, node: NodeRef, offset: u64, data: &[u8], append: bool) -> FsResult<usize> {
        self.require_file(node)?;
        if data.is_empty() {
            return Ok(0);
        }
        let (chunk, limit) = {
            let config = self.config_of(node)?;
            let limit = config.max_file_size.unwrap_or(MAX_FILE_OFFSET);
            (config.io_chunk_size, limit.min(MAX_FILE_OFFSET))
        };
        let provider = self.provider_of(node)?;
        let handle = self.open_for_io(node)?;

        let offset = if append {
            let path = self.node(node)?.path.clone();
            match provider.get_size(&path) {
                Ok(size) => size,
                Err(err) => return Err(self.stale_on_missing(node, err)),
            }
        } else {
            offset
        };
        if offset >= limit {
            return Err(FsError::FileTooLarge);
        }
        let room = usize::try_from(limit - offset).unwrap_or(usize::MAX);
        let data = &data[..data.len().min(room)];

        let mut done = 0;
        while done < data.len() {
            let end = data.len().min(done + chunk);
            let want = end - done;
            match provider.write(handle, offset + done as u64, &data[done..end]) {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(err) if done > 0 => {
                    warn!(error = %err, done, "write stopped after partial transfer");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn truncate(&mut self, node: NodeRef) -> FsResult<()> {
        self.require_file(node)?;
        let path = self.node(node)?.path.clone();
        let provider = self.provider_of(node)?;
        provider
            .truncate(&path)
            .map_err(|err| self.stale_on_missing(node, err))
    }

    fn get_attributes(&mut self, node: NodeRef) -> FsResult<Attributes> {
        let (path, kind, ino) = {
            let entry = self.node(node)?;
            (entry.path.clone(), entry.kind, entry.ino)
        };
        let owner = self.config_of(node)?.owner.clone();
        let provider = self.provider_of(node)?;

        let (mode, size, atime, mtime, ctime) = match fetch_attributes(provider.as_ref(), &path) {
            Ok(values) => values,
            Err(err) => return Err(self.stale_on_missing(node, err)),
        };

        Ok(Attributes {
            kind,
            mode: mode & 0o7777,
            uid: owner.uid,
            gid: owner.gid,
            ino,
            nlink: 1,
            size,
            blksize: ATTR_BLOCK_SIZE,
            blocks: size.div_ceil(u64::from(ATTR_BLOCK_SIZE)),
            atime,
            mtime,
            ctime,
        })
    }

    fn list_directory(&mut self, dir: NodeRef, start: usize, max: usize) -> FsResult<DirPage> {
        let (path, kind, state, ino, parent) = {
            let entry = self.node(dir)?;
            (entry.path.clone(), entry.kind, entry.state, entry.ino, entry.parent)
        };
        if kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        if state == NodeState::Stale {
            return Err(FsError::NotFound);
        }
        let provider = self.provider_of(dir)?;
        let listing = match provider.readdir(&path, start, max) {
            Ok(listing) => listing,
            Err(err) => return Err(self.stale_on_missing(dir, err)),
        };

        let mut entries = Vec::with_capacity(listing.names.len());
        for name in &listing.names {
            let (entry_ino, entry_kind) = match name.as_str() {
                "." => (ino, NodeKind::Directory),
                ".." => {
                    let parent_ino = match parent {
                        Some(parent) => self.node(parent)?.ino,
                        None => ino,
                    };
                    (parent_ino, NodeKind::Directory)
                }
                _ => match self.resolve(dir, name, ResolveMode::LookupOnly) {
                    Ok(child) => {
                        let child = self.node(child)?;
                        (child.ino, child.kind)
                    }
                    Err(FsError::NotFound) => {
                        warn!(dir = %path, name = %name, "entry vanished during listing");
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            entries.push(DirEntry {
                name: name.clone(),
                ino: entry_ino,
                kind: entry_kind,
            });
        }

        Ok(DirPage {
            entries,
            next_index: start + listing.names.len(),
            eof: listing.eof,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MountConfig;
    use crate::provider::MockProvider;
    use crate::testing::mock_provider::{MockHost, DIR_MODE, FILE_MODE};
    use crate::types::ACCESS_READ;

    fn owner() -> Credentials {
        Credentials::new(1000, 100)
    }

    fn mounted(host: &MockHost) -> (Cache, InstanceId, NodeRef) {
        mounted_with(host, MountConfig::new("vfs").with_owner(1000, 100))
    }

    fn mounted_with(host: &MockHost, config: MountConfig) -> (Cache, InstanceId, NodeRef) {
        let cache = Cache::new();
        let (instance, root) = cache.mount(config, Arc::new(host.provider())).unwrap();
        (cache, instance, root)
    }

    #[test]
    fn lookup_acquires_and_checks_search_permission() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_file("/d/f", b"");
        let (cache, _, root) = mounted(&host);

        let d = cache.lookup(root, "d", &owner()).unwrap();
        let f = cache.lookup(d, "f", &owner()).unwrap();
        assert!(cache.node_info(f).unwrap().has_external_handle);
        assert_eq!(cache.lookup(d, ".", &owner()).unwrap(), d);
        assert_eq!(cache.lookup(d, "..", &owner()).unwrap(), root);
        assert!(matches!(cache.lookup(f, "x", &owner()), Err(FsError::NotADirectory)));

        host.set_mode("/d", DIR_MODE & !0o100);
        assert!(matches!(cache.lookup(d, "f", &owner()), Err(FsError::AccessDenied)));
        // ".." skips the search check.
        assert_eq!(cache.lookup(d, "..", &owner()).unwrap(), root);
    }

    #[test]
    fn dot_lookups_take_their_own_hold() {
        let host = MockHost::new();
        host.add_dir("/d");
        let (cache, instance, root) = mounted(&host);
        let d = cache.lookup(root, "d", &owner()).unwrap();

        assert_eq!(cache.lookup(d, "..", &owner()).unwrap(), root);
        assert_eq!(cache.node_info(root).unwrap().external_holds, 2);
        cache.release_external_handle(root).unwrap();
        let info = cache.node_info(root).unwrap();
        assert_eq!(info.external_holds, 1);
        assert!(info.has_host_handle);

        assert_eq!(cache.lookup(d, ".", &owner()).unwrap(), d);
        cache.release_external_handle(d).unwrap();
        assert!(cache.node_info(d).unwrap().has_external_handle);

        assert_eq!(cache.lookup(root, ".", &owner()).unwrap(), root);
        cache.release_external_handle(d).unwrap();
        assert!(matches!(cache.unmount(instance), Err(FsError::Busy)));
        cache.release_external_handle(root).unwrap();
        cache.unmount(instance).unwrap();
        assert_eq!(host.open_handles(), 0);
    }

    #[test]
    fn create_paths() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_file("/existing", b"old contents");
        let (cache, instance, root) = mounted(&host);

        let fresh = cache.create(root, "new", CreateOptions::default(), &owner()).unwrap();
        assert!(host.exists("/new"));
        assert_eq!(cache.find_live(instance, "/new"), Some(fresh));

        let exclusive = CreateOptions {
            exclusive: true,
            ..CreateOptions::default()
        };
        assert!(matches!(
            cache.create(root, "existing", exclusive, &owner()),
            Err(FsError::AlreadyExists)
        ));
        assert!(matches!(
            cache.create(root, "d", CreateOptions::default(), &owner()),
            Err(FsError::IsADirectory)
        ));

        let truncating = CreateOptions {
            truncate: true,
            ..CreateOptions::default()
        };
        cache.create(root, "existing", truncating, &owner()).unwrap();
        assert_eq!(host.contents("/existing").unwrap(), b"");
        assert!(matches!(
            cache.create(root, "..", CreateOptions::default(), &owner()),
            Err(FsError::InvalidArgument)
        ));
        cache.verify_invariants().unwrap();
    }

    #[test]
    fn mkdir_reports_existing_names() {
        let host = MockHost::new();
        let (cache, instance, root) = mounted(&host);
        let d = cache.mkdir(root, "d", &owner()).unwrap();
        let info = cache.node_info(d).unwrap();
        assert_eq!(info.kind, NodeKind::Directory);
        assert!(info.has_external_handle);
        assert_eq!(cache.find_live(instance, "/d"), Some(d));
        assert!(matches!(cache.mkdir(root, "d", &owner()), Err(FsError::AlreadyExists)));
        assert!(matches!(cache.mkdir(root, "..", &owner()), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn remove_marks_node_stale_and_rejects_kind_mismatch() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_file("/f", b"x");
        let (cache, instance, root) = mounted(&host);

        assert!(matches!(cache.remove(root, "d", &owner()), Err(FsError::IsADirectory)));
        assert!(matches!(cache.rmdir(root, "f", &owner()), Err(FsError::NotADirectory)));
        assert!(matches!(cache.rmdir(root, "..", &owner()), Err(FsError::AlreadyExists)));
        assert!(matches!(cache.remove(root, ".", &owner()), Err(FsError::InvalidArgument)));

        cache.remove(root, "f", &owner()).unwrap();
        cache.rmdir(root, "d", &owner()).unwrap();
        assert!(!host.exists("/f"));
        assert!(!host.exists("/d"));
        assert_eq!(cache.find_live(instance, "/f"), None);
        assert_eq!(cache.stats().live_nodes, 1);
        cache.verify_invariants().unwrap();
    }

    #[test]
    fn remove_of_open_file_is_busy() {
        let host = MockHost::new();
        host.add_file("/f", b"x");
        let (cache, _, root) = mounted(&host);
        let f = cache.lookup(root, "f", &owner()).unwrap();
        assert!(matches!(cache.remove(root, "f", &owner()), Err(FsError::Busy)));
        assert!(host.exists("/f"));

        cache.release_external_handle(f).unwrap();
        cache.remove(root, "f", &owner()).unwrap();
        assert!(cache.node_info(f).is_err());
    }

    #[test]
    fn remove_closes_idle_host_handle_first() {
        let mut provider = MockProvider::new();
        provider.expect_open().returning(|_| Ok(HostHandle(1)));
        provider.expect_get_mode().returning(|path| {
            Ok(if path.is_empty() { DIR_MODE } else { FILE_MODE })
        });
        let mut seq = mockall::Sequence::new();
        provider
            .expect_close()
            .withf(|h| *h == HostHandle(9))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        provider
            .expect_remove()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let cache = Cache::new();
        let (_, root) = cache
            .mount(MountConfig::default().with_owner(1000, 100), Arc::new(provider))
            .unwrap();
        cache.create_node(root, "/f", NodeKind::File, Some(HostHandle(9))).unwrap();
        cache.remove(root, "f", &owner()).unwrap();
    }

    #[test]
    fn remove_of_vanished_file_reports_not_found_and_invalidates() {
        let host = MockHost::new();
        host.add_file("/f", b"x");
        let (cache, instance, root) = mounted(&host);
        let f = cache.resolve(root, "f", ResolveMode::LookupOnly).unwrap();
        host.remove_out_of_band("/f");

        // The cached node still answers the lookup; the host delete fails.
        assert!(matches!(cache.remove(root, "f", &owner()), Err(FsError::NotFound)));
        assert!(cache.node_info(f).is_err());
        assert_eq!(cache.find_live(instance, "/f"), None);
    }

    #[test]
    fn rename_moves_subtree_in_cache_and_host() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_dir("/d/sub");
        host.add_file("/d/sub/x", b"x");
        host.add_dir("/z");
        let (cache, instance, root) = mounted(&host);
        let x = cache.resolve_path(root, "d/sub/x").unwrap();
        let z = cache.resolve(root, "z", ResolveMode::LookupOnly).unwrap();

        cache.rename(root, "d", z, "moved", &owner()).unwrap();

        assert!(host.exists("/z/moved/sub/x"));
        assert_eq!(cache.find_live(instance, "/z/moved/sub/x"), Some(x));
        assert_eq!(cache.find_live(instance, "/d"), None);
        assert_eq!(cache.node_info(z).unwrap().child_count, 1);
        cache.verify_invariants().unwrap();
    }

    #[test]
    fn rename_validation() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_dir("/d/sub");
        let (cache, _, root) = mounted(&host);
        let sub = cache.resolve_path(root, "d/sub").unwrap();
        assert!(matches!(
            cache.rename(root, "d", sub, "d", &owner()),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            cache.rename(root, "..", root, "x", &owner()),
            Err(FsError::InvalidArgument)
        ));
        cache.rename(root, "d", root, "d", &owner()).unwrap();
    }

    #[test]
    fn rename_of_missing_source_invalidates_cached_node() {
        let host = MockHost::new();
        host.add_file("/a", b"");
        let (cache, instance, root) = mounted(&host);
        cache.resolve(root, "a", ResolveMode::LookupOnly).unwrap();
        host.remove_out_of_band("/a");
        assert!(matches!(
            cache.rename(root, "a", root, "b", &owner()),
            Err(FsError::NotFound)
        ));
        assert_eq!(cache.find_live(instance, "/a"), None);
    }

    #[test]
    fn io_splits_into_chunks_and_appends() {
        let host = MockHost::new();
        let mut config = MountConfig::new("io").with_owner(1000, 100);
        config.io_chunk_size = 3;
        let (cache, _, root) = mounted_with(&host, config);

        let f = cache.create(root, "f", CreateOptions::default(), &owner()).unwrap();
        assert_eq!(cache.write(f, 0, b"hello world", false).unwrap(), 11);
        assert_eq!(cache.write(f, 0, b"!", true).unwrap(), 1);
        assert_eq!(host.contents("/f").unwrap(), b"hello world!");

        let mut buf = [0u8; 32];
        let n = cache.read(f, 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world!");
        assert_eq!(cache.read(f, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn io_rejects_directories_and_enforces_size_limit() {
        let host = MockHost::new();
        let mut config = MountConfig::new("io").with_owner(1000, 100);
        config.max_file_size = Some(4);
        let (cache, _, root) = mounted_with(&host, config);
        let mut buf = [0u8; 4];
        assert!(matches!(cache.read(root, 0, &mut buf), Err(FsError::IsADirectory)));

        let f = cache.create(root, "f", CreateOptions::default(), &owner()).unwrap();
        assert_eq!(cache.write(f, 2, b"abcdef", false).unwrap(), 2);
        assert!(matches!(cache.write(f, 4, b"x", false), Err(FsError::FileTooLarge)));
    }

    #[test]
    fn io_positions_stay_within_host_offset_range() {
        let host = MockHost::new();
        let (cache, _, root) = mounted(&host);
        let f = cache.create(root, "f", CreateOptions::default(), &owner()).unwrap();
        cache.write(f, 0, b"data", false).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(cache.read(f, u64::MAX - 1, &mut buf), Err(FsError::InvalidArgument)));
        assert!(matches!(cache.read(f, MAX_FILE_OFFSET + 1, &mut buf), Err(FsError::InvalidArgument)));
        assert_eq!(cache.read(f, MAX_FILE_OFFSET - 2, &mut buf).unwrap(), 0);
        assert_eq!(cache.read(f, MAX_FILE_OFFSET, &mut buf).unwrap(), 0);

        assert!(matches!(cache.write(f, u64::MAX, b"x", false), Err(FsError::FileTooLarge)));
        assert!(matches!(cache.write(f, MAX_FILE_OFFSET, b"x", false), Err(FsError::FileTooLarge)));
        assert_eq!(host.contents("/f").unwrap(), b"data");
    }

    #[test]
    fn partial_read_is_not_an_error() {
        let mut provider = MockProvider::new();
        provider.expect_open().returning(|_| Ok(HostHandle(1)));
        provider.expect_get_mode().returning(|_| Ok(FILE_MODE));
        let mut calls = 0;
        provider.expect_read().returning(move |_, _, buf| {
            calls += 1;
            if calls == 1 {
                buf.fill(b'a');
                Ok(buf.len())
            } else {
                Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EIO)))
            }
        });
        let mut config = MountConfig::default();
        config.io_chunk_size = 2;
        let cache = Cache::new();
        let (_, root) = cache.mount(config, Arc::new(provider)).unwrap();
        let f = cache.resolve(root, "f", ResolveMode::LookupOnly).unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(cache.read(f, 0, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"aa");
    }

    #[test]
    fn attributes_report_owner_and_blocks() {
        let host = MockHost::new();
        host.add_file("/f", &[7u8; 513]);
        let (cache, _, root) = mounted(&host);
        let f = cache.resolve(root, "f", ResolveMode::LookupOnly).unwrap();
        let attrs = cache.get_attributes(f).unwrap();
        assert_eq!(attrs.kind, NodeKind::File);
        assert_eq!(attrs.mode, 0o644);
        assert_eq!((attrs.uid, attrs.gid), (1000, 100));
        assert_eq!(attrs.size, 513);
        assert_eq!(attrs.blocks, 2);
        assert_eq!(attrs.blksize, ATTR_BLOCK_SIZE);
        assert_eq!(attrs.nlink, 1);
        assert_eq!(attrs.ino, cache.node_info(f).unwrap().ino);
        assert!(attrs.mtime > attrs.atime);
    }

    #[test]
    fn attributes_of_deleted_node_invalidate_it() {
        let host = MockHost::new();
        host.add_file("/f", b"");
        let (cache, instance, root) = mounted(&host);
        let f = cache.lookup(root, "f", &owner()).unwrap();
        host.remove_out_of_band("/f");
        assert!(matches!(cache.get_attributes(f), Err(FsError::NotFound)));
        assert_eq!(cache.node_info(f).unwrap().state, NodeState::Stale);
        assert_eq!(cache.find_live(instance, "/f"), None);

        // The old host handle now points at nothing.
        let mut buf = [0u8; 1];
        assert!(cache.read(f, 0, &mut buf).is_err());
        cache.release_external_handle(f).unwrap();
        assert_eq!(cache.stats().stale_nodes, 0);
    }

    #[test]
    fn listing_reports_cache_ids() {
        let host = MockHost::new();
        host.add_dir("/d");
        host.add_file("/d/a", b"");
        host.add_dir("/d/b");
        let (cache, _, root) = mounted(&host);
        let d = cache.resolve(root, "d", ResolveMode::LookupOnly).unwrap();

        let page = cache.list_directory(d, 0, 16).unwrap();
        assert!(page.eof);
        assert_eq!(page.next_index, 4);
        let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);
        let d_ino = cache.node_info(d).unwrap().ino;
        assert_eq!(page.entries[0].ino, d_ino);
        assert_eq!(page.entries[1].ino, 1);
        assert_eq!(page.entries[3].kind, NodeKind::Directory);
        let a = cache.find_live(cache.node_info(d).unwrap().instance, "/d/a").unwrap();
        assert_eq!(page.entries[2].ino, cache.node_info(a).unwrap().ino);

        let root_page = cache.list_directory(root, 0, 2).unwrap();
        assert!(!root_page.eof);
        assert_eq!(root_page.entries[1].ino, 1, "root's .. is the root");

        let second = cache.list_directory(d, 2, 1).unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.next_index, 3);
    }

    #[test]
    fn listing_skips_names_that_vanish() {
        let mut provider = MockProvider::new();
        provider.expect_open().returning(|_| Ok(HostHandle(1)));
        provider.expect_readdir().returning(|_, _, _| {
            Ok(crate::types::DirListing {
                names: vec!["gone".to_string(), "here".to_string()],
                eof: true,
            })
        });
        provider.expect_get_mode().returning(|path| {
            if path == "/here" {
                Ok(FILE_MODE)
            } else {
                Err(FsError::NotFound)
            }
        });
        let cache = Cache::new();
        let (_, root) = cache.mount(MountConfig::default(), Arc::new(provider)).unwrap();
        let page = cache.list_directory(root, 0, 10).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].name, "here");
        assert_eq!(page.next_index, 2);
    }

    #[test]
    fn access_check_on_create_of_existing_file() {
        let host = MockHost::new();
        host.add_file("/ro", b"");
        host.set_mode("/ro", libc::S_IFREG as u32 | 0o444);
        let (cache, _, root) = mounted(&host);
        let read_only = CreateOptions {
            access: ACCESS_READ,
            ..CreateOptions::default()
        };
        cache.create(root, "ro", read_only, &owner()).unwrap();
        assert!(matches!(
            cache.create(root, "ro", CreateOptions::default(), &owner()),
            Err(FsError::AccessDenied)
        ));
    }
}
