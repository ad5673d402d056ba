// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the shared folder cache

use serde::{Deserialize, Serialize};

/// Read permission, in owner-bit position.
pub const ACCESS_READ: u32 = 0o400;
/// Write permission, in owner-bit position.
pub const ACCESS_WRITE: u32 = 0o200;
/// Execute/search permission, in owner-bit position.
pub const ACCESS_EXEC: u32 = 0o100;

/// Identifies one mounted filesystem instance inside a [`crate::Cache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub(crate) u64);

impl InstanceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sf{}", self.0)
    }
}

/// Reference to a cached node.
///
/// References are never reused, so a reference to a destroyed node resolves
/// to a consistency error instead of to some unrelated node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub(crate) u64);

impl NodeRef {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Opaque host-side file handle issued by a [`crate::Provider`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostHandle(pub u64);

/// What a node refers to on the host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Unknown,
}

impl NodeKind {
    /// Classify a host mode word (`st_mode` layout).
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => NodeKind::Directory,
            m if m == libc::S_IFREG as u32 => NodeKind::File,
            _ => NodeKind::Unknown,
        }
    }
}

/// Lifecycle state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Live,
    Stale,
}

/// How `resolve` treats a name that is not cached yet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveMode {
    LookupOnly,
    CreateFile,
    CreateDirectory,
}

/// Security identity of the guest caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Host timestamp
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// Attributes reported to the guest for one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attributes {
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

/// One page of names from `Provider::readdir`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirListing {
    pub names: Vec<String>,
    pub eof: bool,
}

/// Directory entry with its guest-visible id
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: NodeKind,
}

/// Result of `list_directory`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    pub next_index: usize,
    pub eof: bool,
}

/// Options for the bridge-level `create`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateOptions {
    /// Fail with `AlreadyExists` if the name is taken.
    pub exclusive: bool,
    /// Truncate an existing regular file to zero length.
    pub truncate: bool,
    /// Access bits (`ACCESS_*`) checked against an existing file.
    pub access: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            exclusive: false,
            truncate: false,
            access: ACCESS_READ | ACCESS_WRITE,
        }
    }
}

/// Point-in-time copy of a node's bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub instance: InstanceId,
    pub ino: u64,
    pub path: String,
    pub kind: NodeKind,
    pub state: NodeState,
    pub has_external_handle: bool,
    pub external_holds: u32,
    pub has_host_handle: bool,
    pub child_count: u32,
    pub parent: Option<NodeRef>,
}

/// Cache statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub instances: u32,
    pub live_nodes: u32,
    pub stale_nodes: u32,
    pub external_handles: u32,
    pub host_handles: u32,
}
