// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the shared folder node cache

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("busy")]
    Busy,
    #[error("file too large")]
    FileTooLarge,
    #[error("node cache inconsistency: {0}")]
    Consistency(#[from] ConsistencyError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// True for invariant violations detected inside the cache.
    pub fn is_consistency(&self) -> bool {
        matches!(self, FsError::Consistency(_))
    }

    /// POSIX errno the guest should see for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::AccessDenied => libc::EACCES,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::Busy => libc::EBUSY,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Consistency(_) => libc::EIO,
        }
    }
}

/// A violated node-graph invariant.
///
/// These never come from the host. Seeing one means the cache was driven
/// outside its locking rules or has a logic defect; the instance that
/// produced it should be treated as suspect.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("duplicate live node for {path:?}")]
    DuplicateLive { path: String },
    #[error("duplicate stale node for {path:?}")]
    DuplicateStale { path: String },
    #[error("node {path:?} missing from the live store")]
    MissingLive { path: String },
    #[error("node {path:?} missing from the stale store")]
    MissingStale { path: String },
    #[error("cannot destroy {path:?}: {children} children remain")]
    DestroyWithChildren { path: String, children: u32 },
    #[error("cannot destroy {path:?}: external handle still held")]
    DestroyWithHandle { path: String },
    #[error("child count of {path:?} would drop below zero")]
    ChildCountUnderflow { path: String },
    #[error("child count of {path:?} is {recorded}, but {actual} nodes name it as parent")]
    ChildCountMismatch {
        path: String,
        recorded: u32,
        actual: u32,
    },
    #[error("stale node {path:?} has no children and no external handle")]
    UnreferencedStale { path: String },
    #[error("node {path:?} is indexed by {stores} stores")]
    StoreMembership { path: String, stores: usize },
    #[error("parent chain of {path:?} does not reach a root")]
    BrokenParentChain { path: String },
    #[error("node {path:?} is not live")]
    NotLive { path: String },
    #[error("external handle on {path:?} is not held")]
    HandleNotHeld { path: String },
    #[error("unknown node reference {0}")]
    UnknownNode(u64),
    #[error("unknown filesystem instance {0}")]
    UnknownInstance(u64),
}

/// Log a violation loudly and turn it into an error value.
pub(crate) fn violation(err: ConsistencyError) -> FsError {
    tracing::error!(target: "sharedfs::consistency", error = %err, "node cache invariant violated");
    FsError::Consistency(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_guest_codes() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Busy.errno(), libc::EBUSY);
        assert_eq!(FsError::Io(io::Error::from_raw_os_error(libc::ENOSPC)).errno(), libc::ENOSPC);
        assert_eq!(FsError::Io(io::Error::other("boom")).errno(), libc::EIO);
        let err = FsError::from(ConsistencyError::UnknownNode(7));
        assert!(err.is_consistency());
        assert_eq!(err.errno(), libc::EIO);
    }
}
