// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Provider backed by a directory on the local filesystem

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::provider::Provider;
use crate::types::{DirListing, HostHandle, Timespec};

/// Map a host I/O failure onto the cache's error kinds.
fn map_io(err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
        io::ErrorKind::PermissionDenied => FsError::AccessDenied,
        _ => match err.raw_os_error() {
            Some(libc::ENOTEMPTY) | Some(libc::EBUSY) => FsError::Busy,
            Some(libc::ENOTDIR) => FsError::NotADirectory,
            Some(libc::EISDIR) => FsError::IsADirectory,
            _ => FsError::Io(err),
        },
    }
}

/// Host directory exposed as a shared folder
pub struct HostFsProvider {
    root: PathBuf,
    next_handle: AtomicU64,
    handles: Mutex<HashMap<u64, File>>,
}

impl HostFsProvider {
    pub fn new(root: PathBuf) -> FsResult<Self> {
        if !fs::metadata(&root).map_err(map_io)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Self {
            root,
            next_handle: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for an instance-relative path (`""` or `"/a/b"`).
    fn host_path(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn register(&self, file: File) -> HostHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, file);
        HostHandle(id)
    }

    fn with_file<R>(&self, handle: HostHandle, f: impl FnOnce(&File) -> io::Result<R>) -> FsResult<R> {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let file = handles.get(&handle.0).ok_or(FsError::InvalidArgument)?;
        f(file).map_err(map_io)
    }

    fn metadata(&self, path: &str) -> FsResult<fs::Metadata> {
        fs::symlink_metadata(self.host_path(path)).map_err(map_io)
    }

    /// Number of handles issued and not yet closed.
    pub fn open_handle_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Provider for HostFsProvider {
    fn open(&self, path: &str) -> FsResult<HostHandle> {
        let host = self.host_path(path);
        trace!(path, "host open");
        // Directories and read-only files only open for reading.
        let file = match OpenOptions::new().read(true).write(true).open(&host) {
            Ok(file) => file,
            Err(_) => File::open(&host).map_err(map_io)?,
        };
        Ok(self.register(file))
    }

    fn create(&self, path: &str) -> FsResult<HostHandle> {
        trace!(path, "host create");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.host_path(path))
            .map_err(map_io)?;
        Ok(self.register(file))
    }

    fn mkdir(&self, path: &str) -> FsResult<HostHandle> {
        trace!(path, "host mkdir");
        let host = self.host_path(path);
        fs::create_dir(&host).map_err(map_io)?;
        let dir = File::open(&host).map_err(map_io)?;
        Ok(self.register(dir))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        trace!(path, "host remove");
        fs::remove_file(self.host_path(path)).map_err(map_io)
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        trace!(path, "host rmdir");
        fs::remove_dir(self.host_path(path)).map_err(map_io)
    }

    fn rename(&self, from: &str, to: &str, is_dir: bool) -> FsResult<()> {
        trace!(from, to, is_dir, "host rename");
        fs::rename(self.host_path(from), self.host_path(to)).map_err(map_io)
    }

    fn get_mode(&self, path: &str) -> FsResult<u32> {
        Ok(self.metadata(path)?.mode())
    }

    fn get_size(&self, path: &str) -> FsResult<u64> {
        Ok(self.metadata(path)?.len())
    }

    fn get_atime(&self, path: &str) -> FsResult<Timespec> {
        let meta = self.metadata(path)?;
        Ok(Timespec::new(meta.atime(), meta.atime_nsec() as u32))
    }

    fn get_mtime(&self, path: &str) -> FsResult<Timespec> {
        let meta = self.metadata(path)?;
        Ok(Timespec::new(meta.mtime(), meta.mtime_nsec() as u32))
    }

    fn get_ctime(&self, path: &str) -> FsResult<Timespec> {
        let meta = self.metadata(path)?;
        Ok(Timespec::new(meta.ctime(), meta.ctime_nsec() as u32))
    }

    fn read(&self, handle: HostHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.with_file(handle, |file| file.read_at(buf, offset))
    }

    fn write(&self, handle: HostHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.with_file(handle, |file| file.write_at(data, offset))
    }

    fn close(&self, handle: HostHandle) {
        trace!(handle = handle.0, "host close");
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
    }

    fn truncate(&self, path: &str) -> FsResult<()> {
        trace!(path, "host truncate");
        let file = OpenOptions::new()
            .write(true)
            .open(self.host_path(path))
            .map_err(map_io)?;
        file.set_len(0).map_err(map_io)
    }

    fn readdir(&self, path: &str, start: usize, max: usize) -> FsResult<DirListing> {
        let mut names = vec![".".to_string(), "..".to_string()];
        let mut children = Vec::new();
        for entry in fs::read_dir(self.host_path(path)).map_err(map_io)? {
            let entry = entry.map_err(map_io)?;
            children.push(entry.file_name().to_string_lossy().into_owned());
        }
        children.sort();
        names.extend(children);

        let end = start.saturating_add(max).min(names.len());
        let page = names.get(start..end).map(<[String]>::to_vec).unwrap_or_default();
        Ok(DirListing {
            names: page,
            eof: end >= names.len(),
        })
    }
}
