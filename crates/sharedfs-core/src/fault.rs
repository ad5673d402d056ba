// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + a provider decorator that applies it

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::EIO;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::provider::Provider;
use crate::types::{DirListing, HostHandle, Timespec};

/// Provider operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Open,
    Create,
    Mkdir,
    Remove,
    Rmdir,
    Rename,
    /// Any of the mode/size/time getters
    Stat,
    Read,
    Write,
    Truncate,
    Readdir,
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enoent,
    Eexist,
    Ebusy,
}

impl FaultErrno {
    fn to_error(self) -> FsError {
        match self {
            FaultErrno::Eio => FsError::Io(io::Error::from_raw_os_error(EIO)),
            FaultErrno::Enoent => FsError::NotFound,
            FaultErrno::Eexist => FsError::AlreadyExists,
            FaultErrno::Ebusy => FsError::Busy,
        }
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    /// Maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

/// JSON-serializable fault policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.rules.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
#[derive(Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> FaultPolicy {
        self.lock().policy.clone()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.lock();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total faults injected so far across all rules.
    pub fn injected(&self) -> u64 {
        self.lock().counters.iter().map(|c| c.hits).sum()
    }

    pub fn should_fault(&self, op: FaultOp) -> Option<FsError> {
        let mut guard = self.lock();
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counter) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counter.invocations = counter.invocations.saturating_add(1);
            if counter.invocations <= rule.start_after {
                continue;
            }
            if rule.max_faults.is_some_and(|max| counter.hits >= max) {
                continue;
            }
            counter.hits = counter.hits.saturating_add(1);
            debug!(?op, errno = ?rule.errno, "injecting provider fault");
            return Some(rule.errno.to_error());
        }
        None
    }
}

/// Wraps a provider and fails selected calls according to a [`FaultInjector`].
pub struct FaultyProvider<P> {
    inner: P,
    injector: FaultInjector,
}

impl<P: Provider> FaultyProvider<P> {
    pub fn new(inner: P, policy: FaultPolicy) -> Self {
        let injector = FaultInjector::new();
        injector.set_policy(policy);
        Self { inner, injector }
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    fn check(&self, op: FaultOp) -> FsResult<()> {
        match self.injector.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<P: Provider> Provider for FaultyProvider<P> {
    fn open(&self, path: &str) -> FsResult<HostHandle> {
        self.check(FaultOp::Open)?;
        self.inner.open(path)
    }

    fn create(&self, path: &str) -> FsResult<HostHandle> {
        self.check(FaultOp::Create)?;
        self.inner.create(path)
    }

    fn mkdir(&self, path: &str) -> FsResult<HostHandle> {
        self.check(FaultOp::Mkdir)?;
        self.inner.mkdir(path)
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.check(FaultOp::Remove)?;
        self.inner.remove(path)
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.check(FaultOp::Rmdir)?;
        self.inner.rmdir(path)
    }

    fn rename(&self, from: &str, to: &str, is_dir: bool) -> FsResult<()> {
        self.check(FaultOp::Rename)?;
        self.inner.rename(from, to, is_dir)
    }

    fn get_mode(&self, path: &str) -> FsResult<u32> {
        self.check(FaultOp::Stat)?;
        self.inner.get_mode(path)
    }

    fn get_size(&self, path: &str) -> FsResult<u64> {
        self.check(FaultOp::Stat)?;
        self.inner.get_size(path)
    }

    fn get_atime(&self, path: &str) -> FsResult<Timespec> {
        self.check(FaultOp::Stat)?;
        self.inner.get_atime(path)
    }

    fn get_mtime(&self, path: &str) -> FsResult<Timespec> {
        self.check(FaultOp::Stat)?;
        self.inner.get_mtime(path)
    }

    fn get_ctime(&self, path: &str) -> FsResult<Timespec> {
        self.check(FaultOp::Stat)?;
        self.inner.get_ctime(path)
    }

    fn read(&self, handle: HostHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.check(FaultOp::Read)?;
        self.inner.read(handle, offset, buf)
    }

    fn write(&self, handle: HostHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check(FaultOp::Write)?;
        self.inner.write(handle, offset, data)
    }

    fn close(&self, handle: HostHandle) {
        self.inner.close(handle)
    }

    fn truncate(&self, path: &str) -> FsResult<()> {
        self.check(FaultOp::Truncate)?;
        self.inner.truncate(path)
    }

    fn readdir(&self, path: &str, start: usize, max: usize) -> FsResult<DirListing> {
        self.check(FaultOp::Readdir)?;
        self.inner.readdir(path, start, max)
    }
}
