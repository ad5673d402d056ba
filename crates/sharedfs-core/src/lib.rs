// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest-side node cache for host-backed shared folders
//!
//! A [`Cache`] maps host paths to stable guest-visible node identities,
//! keeps them coherent as the host changes underneath, and exposes the file
//! operations a VFS bridge needs on top of a [`Provider`].

pub mod cache;
pub mod config;
pub mod error;
pub mod fault;
pub mod host;
pub mod provider;
mod store;
pub mod testing;
mod tree;
pub mod types;
pub mod vfs;

pub use cache::{Cache, ROOT_INO};
pub use config::{MountConfig, OwnerConfig, SecurityPolicy};
pub use error::{ConsistencyError, FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyProvider};
pub use host::HostFsProvider;
pub use provider::{AccessPolicy, PosixAccessPolicy, Provider};
pub use types::*;
