// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-facing seams consumed by the cache

use crate::error::{FsError, FsResult};
use crate::types::{Credentials, DirListing, HostHandle, Timespec};

/// Host-side file I/O for one shared folder.
///
/// Paths are instance-relative: the folder root is `""` and every other
/// node is `"/a/b"`. Calls are made with the cache lock held and must never
/// call back into the cache.
#[cfg_attr(test, mockall::automock)]
pub trait Provider: Send + Sync {
    /// Open an existing file or directory.
    fn open(&self, path: &str) -> FsResult<HostHandle>;

    /// Create a regular file that must not exist yet.
    fn create(&self, path: &str) -> FsResult<HostHandle>;

    /// Create a directory that must not exist yet.
    fn mkdir(&self, path: &str) -> FsResult<HostHandle>;

    fn remove(&self, path: &str) -> FsResult<()>;

    fn rmdir(&self, path: &str) -> FsResult<()>;

    fn rename(&self, from: &str, to: &str, is_dir: bool) -> FsResult<()>;

    /// Mode word including the file type bits.
    fn get_mode(&self, path: &str) -> FsResult<u32>;

    fn get_size(&self, path: &str) -> FsResult<u64>;

    fn get_atime(&self, path: &str) -> FsResult<Timespec>;

    fn get_mtime(&self, path: &str) -> FsResult<Timespec>;

    fn get_ctime(&self, path: &str) -> FsResult<Timespec>;

    /// Read into `buf` at `offset`; returns the number of bytes read.
    fn read(&self, handle: HostHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize>;

    /// Write `data` at `offset`; returns the number of bytes written.
    fn write(&self, handle: HostHandle, offset: u64, data: &[u8]) -> FsResult<usize>;

    fn close(&self, handle: HostHandle);

    /// Truncate to zero length.
    fn truncate(&self, path: &str) -> FsResult<()>;

    /// Up to `max` names starting at index `start`.
    fn readdir(&self, path: &str, start: usize, max: usize) -> FsResult<DirListing>;
}

/// Generic permission check, consulted for access bits the mode did not grant.
#[cfg_attr(test, mockall::automock)]
pub trait AccessPolicy: Send + Sync {
    fn check(&self, creds: &Credentials, owner_uid: u32, missing: u32) -> FsResult<()>;
}

/// Default policy: the superuser may do anything (when allowed), everyone else is denied.
#[derive(Clone, Debug)]
pub struct PosixAccessPolicy {
    pub root_bypass: bool,
}

impl AccessPolicy for PosixAccessPolicy {
    fn check(&self, creds: &Credentials, _owner_uid: u32, _missing: u32) -> FsResult<()> {
        if self.root_bypass && creds.uid == 0 {
            return Ok(());
        }
        Err(FsError::AccessDenied)
    }
}
