// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Guest page size; the largest single transfer handed to the provider by default.
pub const DEFAULT_IO_CHUNK_SIZE: usize = 4096;

/// Owner reported for every node of an instance.
///
/// Shared folders have no per-file ownership: one configured identity owns
/// everything, and permission checks collapse to owner/group/other against it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    pub uid: u32,
    pub gid: u32,
}

/// Permission enforcement knobs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SecurityPolicy {
    pub enforce_posix_permissions: bool,
    pub root_bypass_permissions: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_posix_permissions: true,
            root_bypass_permissions: true,
        }
    }
}

/// Configuration of one mounted shared folder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MountConfig {
    /// Share name, used in log fields
    pub name: String,
    pub owner: OwnerConfig,
    pub security: SecurityPolicy,
    /// Largest single provider read/write
    pub io_chunk_size: usize,
    /// Writes at or beyond this offset fail with `FileTooLarge`
    pub max_file_size: Option<u64>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            name: "share".to_string(),
            owner: OwnerConfig::default(),
            security: SecurityPolicy::default(),
            io_chunk_size: DEFAULT_IO_CHUNK_SIZE,
            max_file_size: None,
        }
    }
}

impl MountConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = OwnerConfig { uid, gid };
        self
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> FsResult<Self> {
        let config: MountConfig = toml::from_str(s).map_err(|e| {
            tracing::warn!(error = %e, "rejecting mount configuration");
            FsError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.io_chunk_size == 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}
