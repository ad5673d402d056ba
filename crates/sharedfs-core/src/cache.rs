// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The node cache: instances, name resolution, access checks and handle bridging
//!
//! One [`Cache`] may host several mounted instances. Every operation runs
//! inside a single lock acquisition, provider calls included, so cascades
//! and create-on-miss are atomic with respect to each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::config::{MountConfig, OwnerConfig};
use crate::error::{violation, ConsistencyError, FsError, FsResult};
use crate::provider::{AccessPolicy, PosixAccessPolicy, Provider};
use crate::tree::{Node, NodeTree};
use crate::types::{
    CacheStats, Credentials, HostHandle, InstanceId, NodeInfo, NodeKind, NodeRef, NodeState,
    ResolveMode,
};

/// Inode number of every instance root.
pub const ROOT_INO: u64 = 1;

pub(crate) struct Instance {
    pub config: MountConfig,
    pub provider: Arc<dyn Provider>,
    pub access: Arc<dyn AccessPolicy>,
    pub root: NodeRef,
    next_ino: u64,
}

/// Everything the cache lock protects.
pub(crate) struct CacheState {
    pub(crate) instances: HashMap<InstanceId, Instance>,
    pub(crate) tree: NodeTree,
    next_instance: u64,
}

/// Shared-folder node cache
pub struct Cache {
    state: Mutex<CacheState>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                instances: HashMap::new(),
                tree: NodeTree::new(),
                next_instance: 1,
            }),
        }
    }

    /// A panic while holding the lock leaves no half-applied cascade behind
    /// that the next caller could not detect with `verify_invariants`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mount a new instance with the default permission policy.
    pub fn mount(
        &self,
        config: MountConfig,
        provider: Arc<dyn Provider>,
    ) -> FsResult<(InstanceId, NodeRef)> {
        let access = Arc::new(PosixAccessPolicy {
            root_bypass: config.security.root_bypass_permissions,
        });
        self.mount_with_policy(config, provider, access)
    }

    pub fn mount_with_policy(
        &self,
        config: MountConfig,
        provider: Arc<dyn Provider>,
        access: Arc<dyn AccessPolicy>,
    ) -> FsResult<(InstanceId, NodeRef)> {
        self.lock().mount(config, provider, access)
    }

    /// Tear an instance down; see [`Cache::purge_instance`].
    pub fn unmount(&self, instance: InstanceId) -> FsResult<()> {
        self.purge_instance(instance)
    }

    pub fn resolve(&self, dir: NodeRef, name: &str, mode: ResolveMode) -> FsResult<NodeRef> {
        self.lock().resolve(dir, name, mode)
    }

    /// Resolve a relative multi-component path one name at a time.
    pub fn resolve_path(&self, dir: NodeRef, path: &str) -> FsResult<NodeRef> {
        self.lock().resolve_path(dir, path)
    }

    /// Insert a node for `path` below `parent`; `path` must be `parent`'s path plus one name.
    pub fn create_node(
        &self,
        parent: NodeRef,
        path: &str,
        kind: NodeKind,
        host_handle: Option<HostHandle>,
    ) -> FsResult<NodeRef> {
        self.lock().create_node(parent, path.to_string(), kind, host_handle)
    }

    pub fn destroy_node(&self, node: NodeRef) -> FsResult<()> {
        self.lock().destroy_node(node)
    }

    pub fn mark_stale(&self, node: NodeRef) -> FsResult<()> {
        self.lock().mark_stale(node)
    }

    /// Cache-only rename; the host is expected to have renamed already.
    pub fn rename_node(&self, node: NodeRef, new_parent: NodeRef, new_path: &str) -> FsResult<()> {
        self.lock().rename_node(node, new_parent, new_path.to_string())
    }

    pub fn ensure_open(&self, node: NodeRef) -> FsResult<()> {
        self.lock().ensure_open(node)
    }

    pub fn acquire_external_handle(&self, node: NodeRef) -> FsResult<NodeRef> {
        self.lock().acquire_external_handle(node)
    }

    pub fn release_external_handle(&self, node: NodeRef) -> FsResult<()> {
        self.lock().release_external_handle(node)
    }

    pub fn check_access(&self, node: NodeRef, requested: u32, creds: &Credentials) -> FsResult<()> {
        self.lock().check_access(node, requested, creds)
    }

    pub fn node_info(&self, node: NodeRef) -> FsResult<NodeInfo> {
        Ok(self.lock().tree.get(node)?.info())
    }

    pub fn find_live(&self, instance: InstanceId, path: &str) -> Option<NodeRef> {
        self.lock().tree.find_live(instance, path)
    }

    pub fn root(&self, instance: InstanceId) -> FsResult<NodeRef> {
        Ok(self.lock().instance(instance)?.root)
    }

    /// Snapshot of every node of one instance, live and stale, sorted by path.
    pub fn nodes(&self, instance: InstanceId) -> Vec<(NodeRef, NodeInfo)> {
        let state = self.lock();
        let mut nodes: Vec<(NodeRef, NodeInfo)> = state
            .tree
            .nodes_of(instance)
            .into_iter()
            .filter_map(|r| state.tree.get(r).ok().map(|node| (r, node.info())))
            .collect();
        nodes.sort_by(|a, b| a.1.path.cmp(&b.1.path).then(a.0.cmp(&b.0)));
        nodes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let mut stats = CacheStats {
            instances: state.instances.len() as u32,
            live_nodes: state.tree.live_count() as u32,
            stale_nodes: state.tree.stale_count() as u32,
            ..CacheStats::default()
        };
        for node in state.tree.all_nodes() {
            stats.external_handles += u32::from(node.has_external_handle());
            stats.host_handles += u32::from(node.host_handle.is_some());
        }
        stats
    }

    pub fn verify_invariants(&self) -> FsResult<()> {
        self.lock().tree.verify()
    }
}

impl CacheState {
    pub(crate) fn instance(&self, instance: InstanceId) -> FsResult<&Instance> {
        self.instances
            .get(&instance)
            .ok_or_else(|| violation(ConsistencyError::UnknownInstance(instance.0)))
    }

    pub(crate) fn node(&self, node: NodeRef) -> FsResult<&Node> {
        self.tree.get(node)
    }

    pub(crate) fn provider_of(&self, node: NodeRef) -> FsResult<Arc<dyn Provider>> {
        let instance = self.tree.get(node)?.instance;
        Ok(self.instance(instance)?.provider.clone())
    }

    pub(crate) fn config_of(&self, node: NodeRef) -> FsResult<&MountConfig> {
        let instance = self.tree.get(node)?.instance;
        Ok(&self.instance(instance)?.config)
    }

    fn mount(
        &mut self,
        config: MountConfig,
        provider: Arc<dyn Provider>,
        access: Arc<dyn AccessPolicy>,
    ) -> FsResult<(InstanceId, NodeRef)> {
        config.validate()?;
        let instance = InstanceId(self.next_instance);
        self.next_instance += 1;

        let root = self
            .tree
            .make(instance, ROOT_INO, None, String::new(), NodeKind::Directory, None)?;
        info!(instance = %instance, share = %config.name, "mounted shared folder");
        self.instances.insert(
            instance,
            Instance {
                config,
                provider,
                access,
                root,
                next_ino: ROOT_INO + 1,
            },
        );
        self.acquire_external_handle(root)?;
        Ok((instance, root))
    }

    pub(crate) fn resolve(
        &mut self,
        dir: NodeRef,
        name: &str,
        mode: ResolveMode,
    ) -> FsResult<NodeRef> {
        let dir_node = self.tree.get(dir)?;
        if name.is_empty() || name == "." {
            return Ok(dir);
        }
        if name == ".." {
            return Ok(dir_node.parent.unwrap_or(dir));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(FsError::InvalidArgument);
        }
        if dir_node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        if dir_node.state == NodeState::Stale {
            return Err(FsError::NotFound);
        }

        let instance = dir_node.instance;
        let child_path = format!("{}/{}", dir_node.path, name);
        if let Some(existing) = self.tree.find_live(instance, &child_path) {
            return match mode {
                ResolveMode::LookupOnly => Ok(existing),
                ResolveMode::CreateFile | ResolveMode::CreateDirectory => {
                    Err(FsError::AlreadyExists)
                }
            };
        }

        let provider = self.instance(instance)?.provider.clone();
        trace!(path = %child_path, ?mode, "resolve miss");
        let (kind, handle) = match mode {
            ResolveMode::LookupOnly => {
                let host_mode = provider.get_mode(&child_path)?;
                (NodeKind::from_mode(host_mode), None)
            }
            ResolveMode::CreateFile => (NodeKind::File, Some(provider.create(&child_path)?)),
            ResolveMode::CreateDirectory => {
                (NodeKind::Directory, Some(provider.mkdir(&child_path)?))
            }
        };

        self.create_node(dir, child_path, kind, handle).inspect_err(|_| {
            if let Some(handle) = handle {
                provider.close(handle);
            }
        })
    }

    pub(crate) fn resolve_path(&mut self, dir: NodeRef, path: &str) -> FsResult<NodeRef> {
        let mut current = dir;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            current = self.resolve(current, name, ResolveMode::LookupOnly)?;
        }
        Ok(current)
    }

    pub(crate) fn create_node(
        &mut self,
        parent: NodeRef,
        path: String,
        kind: NodeKind,
        host_handle: Option<HostHandle>,
    ) -> FsResult<NodeRef> {
        let instance = self.tree.get(parent)?.instance;
        if self.tree.find_live(instance, &path).is_some() {
            return Err(violation(ConsistencyError::DuplicateLive { path }));
        }
        let entry = self
            .instances
            .get_mut(&instance)
            .ok_or_else(|| violation(ConsistencyError::UnknownInstance(instance.0)))?;
        let ino = entry.next_ino;
        entry.next_ino += 1;
        self.tree.make(instance, ino, Some(parent), path, kind, host_handle)
    }

    pub(crate) fn destroy_node(&mut self, node: NodeRef) -> FsResult<()> {
        let provider = self.provider_of(node)?;
        self.tree.destroy(node, provider.as_ref())
    }

    pub(crate) fn mark_stale(&mut self, node: NodeRef) -> FsResult<()> {
        let provider = self.provider_of(node)?;
        self.tree.mark_stale(node, provider.as_ref())
    }

    pub(crate) fn rename_node(
        &mut self,
        node: NodeRef,
        new_parent: NodeRef,
        new_path: String,
    ) -> FsResult<()> {
        let provider = self.provider_of(node)?;
        self.tree.rename(node, new_parent, new_path, provider.as_ref())
    }

    /// Invalidate `node` if the host says it is gone, then hand the error back.
    pub(crate) fn stale_on_missing(&mut self, node: NodeRef, err: FsError) -> FsError {
        if matches!(err, FsError::NotFound) {
            debug!(target: "sharedfs::node", node = node.as_u64(), "host reports node missing");
            if let Err(stale_err) = self.mark_stale(node) {
                return stale_err;
            }
        }
        err
    }

    pub(crate) fn ensure_open(&mut self, node: NodeRef) -> FsResult<()> {
        let (path, provider) = {
            let entry = self.tree.get(node)?;
            if entry.host_handle.is_some() || entry.state == NodeState::Stale {
                return Ok(());
            }
            (entry.path.clone(), self.provider_of(node)?)
        };
        match provider.open(&path) {
            Ok(handle) => {
                trace!(path = %path, handle = handle.0, "opened host handle");
                self.tree.get_mut(node)?.host_handle = Some(handle);
            }
            Err(err) => warn!(path = %path, error = %err, "deferring host open failure"),
        }
        Ok(())
    }

    /// Add one guest reference to `node`. Every acquire needs its own release.
    pub(crate) fn acquire_external_handle(&mut self, node: NodeRef) -> FsResult<NodeRef> {
        self.tree.get_mut(node)?.external_holds += 1;
        self.ensure_open(node)?;
        Ok(node)
    }

    /// Drop one guest reference. The host handle is closed, and a stale
    /// node destroyed, only when the last reference goes.
    pub(crate) fn release_external_handle(&mut self, node: NodeRef) -> FsResult<()> {
        let provider = self.provider_of(node)?;
        let entry = self.tree.get_mut(node)?;
        if entry.external_holds == 0 {
            return Err(violation(ConsistencyError::HandleNotHeld {
                path: entry.path.clone(),
            }));
        }
        entry.external_holds -= 1;
        if entry.external_holds > 0 {
            return Ok(());
        }
        if let Some(handle) = entry.host_handle.take() {
            provider.close(handle);
        }
        if entry.state == NodeState::Stale && entry.child_count == 0 {
            self.tree.destroy(node, provider.as_ref())?;
        }
        Ok(())
    }

    pub(crate) fn check_access(
        &mut self,
        node: NodeRef,
        requested: u32,
        creds: &Credentials,
    ) -> FsResult<()> {
        let (owner, policy, provider) = {
            let instance = self.instance(self.tree.get(node)?.instance)?;
            if !instance.config.security.enforce_posix_permissions {
                return Ok(());
            }
            (
                instance.config.owner.clone(),
                instance.access.clone(),
                instance.provider.clone(),
            )
        };
        let path = self.tree.get(node)?.path.clone();
        let mode = match provider.get_mode(&path) {
            Ok(mode) => mode,
            Err(err) => return Err(self.stale_on_missing(node, err)),
        };

        let missing = requested & 0o700 & !granted_bits(mode, &owner, creds);
        if missing == 0 {
            return Ok(());
        }
        trace!(path = %path, uid = creds.uid, missing = format_args!("{missing:o}"), "consulting access policy");
        policy.check(creds, owner.uid, missing)
    }

    pub(crate) fn purge_instance(&mut self, instance: InstanceId) -> FsResult<()> {
        let root = self.instance(instance)?.root;
        for node in self.tree.nodes_of(instance) {
            let entry = self.tree.get(node)?;
            // The mount itself owns one reference on the root.
            let own_holds = if node == root { 1 } else { 0 };
            if entry.external_holds > own_holds {
                debug!(instance = %instance, path = %entry.path, "purge refused: node in use");
                return Err(FsError::Busy);
            }
        }

        if self.tree.exists(root) && self.tree.get(root)?.has_external_handle() {
            self.release_external_handle(root)?;
        }
        for node in self.tree.live_nodes_of(instance) {
            let live = self.tree.exists(node) && self.tree.get(node)?.state == NodeState::Live;
            if node != root && live {
                self.mark_stale(node)?;
            }
        }
        // A root that went stale earlier was destroyed by the release above.
        if self.tree.exists(root) && self.tree.get(root)?.state == NodeState::Live {
            self.mark_stale(root)?;
        }

        if let Some(leftover) = self.tree.nodes_of(instance).first() {
            return Err(violation(ConsistencyError::UnreferencedStale {
                path: self.tree.get(*leftover)?.path.clone(),
            }));
        }
        self.instances.remove(&instance);
        info!(instance = %instance, "unmounted shared folder");
        Ok(())
    }
}

/// Owner-position permission bits `creds` receive from `mode`.
///
/// The instance owner sees the owner triplet; a group member sees the group
/// triplet shifted into owner position; anyone else sees the other triplet.
fn granted_bits(mode: u32, owner: &OwnerConfig, creds: &Credentials) -> u32 {
    let mut shift = 0;
    if creds.uid != owner.uid {
        shift += 3;
        if !creds.in_group(owner.gid) {
            shift += 3;
        }
    }
    (mode << shift) & 0o700
}
