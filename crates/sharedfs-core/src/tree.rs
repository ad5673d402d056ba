// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node arena and its live/stale lifecycle
//!
//! Nodes live in an arena addressed by [`NodeRef`]; parent links are
//! references into the same arena. Exactly one of the two stores indexes
//! each node at any time. Cascades run as loops over collected worklists,
//! so their depth never depends on the call stack.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{violation, ConsistencyError, FsError, FsResult};
use crate::provider::Provider;
use crate::store::{NodeStore, StaleNodeStore};
use crate::types::{HostHandle, InstanceId, NodeInfo, NodeKind, NodeRef, NodeState};

/// Cached identity of one host path
#[derive(Debug)]
pub(crate) struct Node {
    pub instance: InstanceId,
    pub ino: u64,
    pub path: String,
    pub kind: NodeKind,
    pub host_handle: Option<HostHandle>,
    pub state: NodeState,
    /// Outstanding guest references; the node is held while this is non-zero.
    pub external_holds: u32,
    pub child_count: u32,
    pub parent: Option<NodeRef>,
}

impl Node {
    pub fn has_external_handle(&self) -> bool {
        self.external_holds > 0
    }

    /// Nothing keeps this node alive once it is stale.
    fn is_idle(&self) -> bool {
        self.child_count == 0 && !self.has_external_handle()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            instance: self.instance,
            ino: self.ino,
            path: self.path.clone(),
            kind: self.kind,
            state: self.state,
            has_external_handle: self.has_external_handle(),
            external_holds: self.external_holds,
            has_host_handle: self.host_handle.is_some(),
            child_count: self.child_count,
            parent: self.parent,
        }
    }
}

pub(crate) struct NodeTree {
    nodes: HashMap<NodeRef, Node>,
    live: NodeStore,
    stale: StaleNodeStore,
    next_ref: u64,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            live: NodeStore::new(),
            stale: StaleNodeStore::new(),
            next_ref: 1,
        }
    }

    pub fn get(&self, node: NodeRef) -> FsResult<&Node> {
        self.nodes
            .get(&node)
            .ok_or_else(|| violation(ConsistencyError::UnknownNode(node.0)))
    }

    pub fn get_mut(&mut self, node: NodeRef) -> FsResult<&mut Node> {
        self.nodes
            .get_mut(&node)
            .ok_or_else(|| violation(ConsistencyError::UnknownNode(node.0)))
    }

    pub fn exists(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn find_live(&self, instance: InstanceId, path: &str) -> Option<NodeRef> {
        self.live.get(instance, path)
    }

    /// Live nodes of one instance in path order.
    pub fn live_nodes_of(&self, instance: InstanceId) -> Vec<NodeRef> {
        self.live.instance_nodes(instance).into_iter().map(|(_, node)| node).collect()
    }

    /// Every node of one instance, live or stale.
    pub fn nodes_of(&self, instance: InstanceId) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.instance == instance)
            .map(|(r, _)| *r)
            .collect();
        nodes.sort();
        nodes
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    /// Insert a new live node under `parent`.
    pub fn make(
        &mut self,
        instance: InstanceId,
        ino: u64,
        parent: Option<NodeRef>,
        path: String,
        kind: NodeKind,
        host_handle: Option<HostHandle>,
    ) -> FsResult<NodeRef> {
        if self.live.contains(instance, &path) {
            return Err(violation(ConsistencyError::DuplicateLive { path }));
        }
        if let Some(parent) = parent {
            self.get(parent)?;
        }

        let node_ref = NodeRef(self.next_ref);
        self.next_ref += 1;
        self.live.insert(instance, &path, node_ref)?;
        if let Some(parent) = parent {
            self.get_mut(parent)?.child_count += 1;
        }

        debug!(target: "sharedfs::node", path = %path, ino, ?kind, "make");
        self.nodes.insert(
            node_ref,
            Node {
                instance,
                ino,
                path,
                kind,
                host_handle,
                state: NodeState::Live,
                external_holds: 0,
                child_count: 0,
                parent,
            },
        );
        Ok(node_ref)
    }

    /// All preconditions of `destroy`, checked before anything changes.
    fn check_destroyable(&self, node_ref: NodeRef) -> FsResult<()> {
        let node = self.get(node_ref)?;
        if node.child_count != 0 {
            return Err(violation(ConsistencyError::DestroyWithChildren {
                path: node.path.clone(),
                children: node.child_count,
            }));
        }
        if node.has_external_handle() {
            return Err(violation(ConsistencyError::DestroyWithHandle {
                path: node.path.clone(),
            }));
        }
        match node.state {
            NodeState::Live if self.live.get(node.instance, &node.path) != Some(node_ref) => {
                return Err(violation(ConsistencyError::MissingLive {
                    path: node.path.clone(),
                }));
            }
            NodeState::Stale if !self.stale.contains(&node.path, node_ref) => {
                return Err(violation(ConsistencyError::MissingStale {
                    path: node.path.clone(),
                }));
            }
            _ => {}
        }
        if let Some(parent) = node.parent {
            if self.get(parent)?.child_count == 0 {
                return Err(violation(ConsistencyError::ChildCountUnderflow {
                    path: node.path.clone(),
                }));
            }
        }
        Ok(())
    }

    /// Remove an idle node, then keep going up while the parent is stale and idle.
    pub fn destroy(&mut self, node_ref: NodeRef, provider: &dyn Provider) -> FsResult<()> {
        self.check_destroyable(node_ref)?;

        let mut current = node_ref;
        loop {
            let (instance, path, state) = {
                let node = self.get(current)?;
                (node.instance, node.path.clone(), node.state)
            };
            match state {
                NodeState::Live => {
                    self.live.remove(instance, &path)?;
                }
                NodeState::Stale => self.stale.remove(&path, current)?,
            }
            let node = self
                .nodes
                .remove(&current)
                .ok_or_else(|| violation(ConsistencyError::UnknownNode(current.0)))?;
            if let Some(handle) = node.host_handle {
                provider.close(handle);
            }
            debug!(
                target: "sharedfs::node",
                path = %node.path,
                stale = node.state == NodeState::Stale,
                "destroy"
            );

            let Some(parent_ref) = node.parent else {
                return Ok(());
            };
            let parent = self.get_mut(parent_ref)?;
            if parent.child_count == 0 {
                return Err(violation(ConsistencyError::ChildCountUnderflow {
                    path: parent.path.clone(),
                }));
            }
            parent.child_count -= 1;
            if parent.state == NodeState::Stale && parent.is_idle() {
                current = parent_ref;
                continue;
            }
            return Ok(());
        }
    }

    /// Move a live node into the stale store.
    fn move_to_stale(&mut self, node_ref: NodeRef) -> FsResult<()> {
        let (instance, path) = {
            let node = self.get(node_ref)?;
            if node.state != NodeState::Live {
                return Err(violation(ConsistencyError::NotLive {
                    path: node.path.clone(),
                }));
            }
            (node.instance, node.path.clone())
        };
        if self.stale.contains(&path, node_ref) {
            return Err(violation(ConsistencyError::DuplicateStale { path }));
        }
        let indexed = self.live.remove(instance, &path)?;
        if indexed != node_ref {
            self.live.insert(instance, &path, indexed)?;
            return Err(violation(ConsistencyError::MissingLive { path }));
        }
        self.stale.insert(&path, node_ref)?;
        self.get_mut(node_ref)?.state = NodeState::Stale;
        debug!(target: "sharedfs::node", path = %path, "stale");
        Ok(())
    }

    /// Destroy an idle live node, or park a referenced one in the stale store.
    fn retire(&mut self, node_ref: NodeRef, provider: &dyn Provider) -> FsResult<()> {
        if self.get(node_ref)?.is_idle() {
            self.destroy(node_ref, provider)
        } else {
            self.move_to_stale(node_ref)
        }
    }

    /// Invalidate a node and, for directories, everything cached below it.
    pub fn mark_stale(&mut self, node_ref: NodeRef, provider: &dyn Provider) -> FsResult<()> {
        let (instance, path, kind) = {
            let node = self.get(node_ref)?;
            if node.state == NodeState::Stale {
                return Ok(());
            }
            (node.instance, node.path.clone(), node.kind)
        };

        if kind == NodeKind::Directory {
            // Ancestors sort before their descendants, so a parent has
            // already been parked when a destroyed child cascades into it.
            for (_, child) in self.live.descendants(instance, &path) {
                let still_live = self
                    .nodes
                    .get(&child)
                    .is_some_and(|node| node.state == NodeState::Live);
                if still_live {
                    self.retire(child, provider)?;
                }
            }
        }

        self.retire(node_ref, provider)
    }

    /// Move a live node (and its live subtree) to `new_path` under `new_parent`.
    ///
    /// A live node already at `new_path` is invalidated first.
    pub fn rename(
        &mut self,
        node_ref: NodeRef,
        new_parent: NodeRef,
        new_path: String,
        provider: &dyn Provider,
    ) -> FsResult<()> {
        let (instance, old_path, kind, old_parent) = {
            let node = self.get(node_ref)?;
            if node.state != NodeState::Live {
                return Err(violation(ConsistencyError::NotLive {
                    path: node.path.clone(),
                }));
            }
            (node.instance, node.path.clone(), node.kind, node.parent)
        };
        // The instance root has no name to change.
        let old_parent = old_parent.ok_or(FsError::InvalidArgument)?;
        {
            let parent = self.get(new_parent)?;
            if parent.state != NodeState::Live {
                return Err(violation(ConsistencyError::NotLive {
                    path: parent.path.clone(),
                }));
            }
            let is_child_path = new_path
                .strip_prefix(&parent.path)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|name| !name.is_empty() && !name.contains('/'));
            if parent.instance != instance || !is_child_path {
                return Err(FsError::InvalidArgument);
            }
        }
        if new_path == old_path {
            return Ok(());
        }
        let old_prefix = format!("{old_path}/");
        if new_path.starts_with(&old_prefix) {
            return Err(FsError::InvalidArgument);
        }
        if old_path.starts_with(&format!("{new_path}/")) {
            // Replacing one of our own ancestors.
            return Err(FsError::InvalidArgument);
        }
        if self.get(old_parent)?.child_count == 0 {
            return Err(violation(ConsistencyError::ChildCountUnderflow {
                path: old_path,
            }));
        }

        if let Some(occupant) = self.live.get(instance, &new_path) {
            self.mark_stale(occupant, provider)?;
        }

        if kind == NodeKind::Directory {
            let descendants = self.live.descendants(instance, &old_path);
            for (path, _) in &descendants {
                self.live.remove(instance, path)?;
            }
            for (path, child) in descendants {
                let moved = format!("{new_path}{}", &path[old_path.len()..]);
                debug!(target: "sharedfs::node", from = %path, to = %moved, "rename sub");
                self.live.insert(instance, &moved, child)?;
                self.get_mut(child)?.path = moved;
            }
        }

        self.live.remove(instance, &old_path)?;
        self.live.insert(instance, &new_path, node_ref)?;
        debug!(target: "sharedfs::node", from = %old_path, to = %new_path, "rename");
        self.get_mut(node_ref)?.path = new_path;

        if old_parent != new_parent {
            let parent = self.get_mut(old_parent)?;
            if parent.child_count == 0 {
                return Err(violation(ConsistencyError::ChildCountUnderflow {
                    path: parent.path.clone(),
                }));
            }
            parent.child_count -= 1;
            self.get_mut(new_parent)?.child_count += 1;
            self.get_mut(node_ref)?.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Check every graph invariant; returns the first violation found.
    pub fn verify(&self) -> FsResult<()> {
        let mut actual_children: HashMap<NodeRef, u32> = HashMap::new();

        for (node_ref, node) in &self.nodes {
            let in_live = self.live.get(node.instance, &node.path) == Some(*node_ref);
            let in_stale = self.stale.contains(&node.path, *node_ref);
            let stores = usize::from(in_live) + usize::from(in_stale);
            let state_matches = match node.state {
                NodeState::Live => in_live,
                NodeState::Stale => in_stale,
            };
            if stores != 1 || !state_matches {
                return Err(violation(ConsistencyError::StoreMembership {
                    path: node.path.clone(),
                    stores,
                }));
            }
            if node.state == NodeState::Stale && node.is_idle() {
                return Err(violation(ConsistencyError::UnreferencedStale {
                    path: node.path.clone(),
                }));
            }

            // A chain longer than the arena must contain a cycle.
            let mut hops = 0usize;
            let mut cursor = node.parent;
            while let Some(parent) = cursor {
                let Some(parent_node) = self.nodes.get(&parent) else {
                    return Err(violation(ConsistencyError::BrokenParentChain {
                        path: node.path.clone(),
                    }));
                };
                hops += 1;
                if hops > self.nodes.len() {
                    return Err(violation(ConsistencyError::BrokenParentChain {
                        path: node.path.clone(),
                    }));
                }
                cursor = parent_node.parent;
            }
            if let Some(parent) = node.parent {
                *actual_children.entry(parent).or_insert(0) += 1;
            }
        }

        for (node_ref, node) in &self.nodes {
            let actual = actual_children.get(node_ref).copied().unwrap_or(0);
            if actual != node.child_count {
                return Err(violation(ConsistencyError::ChildCountMismatch {
                    path: node.path.clone(),
                    recorded: node.child_count,
                    actual,
                }));
            }
        }

        for (_, _, node_ref) in self.live.iter() {
            if !self.nodes.contains_key(&node_ref) {
                return Err(violation(ConsistencyError::UnknownNode(node_ref.0)));
            }
        }
        for (_, node_ref) in self.stale.iter() {
            if !self.nodes.contains_key(&node_ref) {
                return Err(violation(ConsistencyError::UnknownNode(node_ref.0)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    const INST: InstanceId = InstanceId(1);

    fn closing_provider() -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_close().returning(|_| ());
        provider
    }

    struct Fixture {
        tree: NodeTree,
        next_ino: u64,
        root: NodeRef,
    }

    impl Fixture {
        fn new() -> Self {
            let mut tree = NodeTree::new();
            let root = tree.make(INST, 1, None, String::new(), NodeKind::Directory, None).unwrap();
            Self {
                tree,
                next_ino: 2,
                root,
            }
        }

        fn add(&mut self, parent: NodeRef, path: &str, kind: NodeKind) -> NodeRef {
            let ino = self.next_ino;
            self.next_ino += 1;
            self.tree.make(INST, ino, Some(parent), path.to_string(), kind, None).unwrap()
        }

        fn hold(&mut self, node: NodeRef) {
            self.tree.get_mut(node).unwrap().external_holds += 1;
        }
    }

    #[test]
    fn make_counts_children_and_rejects_duplicates() {
        let mut fx = Fixture::new();
        let a = fx.add(fx.root, "/a", NodeKind::Directory);
        fx.add(a, "/a/f", NodeKind::File);
        assert_eq!(fx.tree.get(fx.root).unwrap().child_count, 1);
        assert_eq!(fx.tree.get(a).unwrap().child_count, 1);

        let err = fx
            .tree
            .make(INST, 99, Some(a), "/a/f".to_string(), NodeKind::File, None)
            .unwrap_err();
        assert!(err.is_consistency());
        assert_eq!(fx.tree.get(a).unwrap().child_count, 1);
        fx.tree.verify().unwrap();
    }

    #[test]
    fn destroy_refuses_busy_nodes_without_touching_stores() {
        let mut fx = Fixture::new();
        let provider = MockProvider::new();
        let a = fx.add(fx.root, "/a", NodeKind::Directory);
        let f = fx.add(a, "/a/f", NodeKind::File);

        assert!(fx.tree.destroy(a, &provider).unwrap_err().is_consistency());
        fx.hold(f);
        assert!(fx.tree.destroy(f, &provider).unwrap_err().is_consistency());

        assert_eq!(fx.tree.live_count(), 3);
        assert_eq!(fx.tree.get(a).unwrap().child_count, 1);
        fx.tree.verify().unwrap();
    }

    #[test]
    fn destroy_closes_host_handle_and_cascades_into_idle_stale_parent() {
        let mut fx = Fixture::new();
        let mut provider = MockProvider::new();
        provider.expect_close().withf(|h| *h == HostHandle(7)).times(1).returning(|_| ());

        let a = fx.add(fx.root, "/a", NodeKind::Directory);
        let f = fx.add(a, "/a/f", NodeKind::File);
        fx.tree.get_mut(f).unwrap().host_handle = Some(HostHandle(7));
        fx.hold(f);

        fx.tree.mark_stale(a, &provider).unwrap();
        assert_eq!(fx.tree.get(a).unwrap().state, NodeState::Stale);
        assert_eq!(fx.tree.get(f).unwrap().state, NodeState::Stale);

        fx.tree.get_mut(f).unwrap().external_holds = 0;
        fx.tree.destroy(f, &provider).unwrap();

        assert!(!fx.tree.exists(f));
        assert!(!fx.tree.exists(a), "idle stale parent goes with its last child");
        assert_eq!(fx.tree.get(fx.root).unwrap().child_count, 0);
        assert_eq!(fx.tree.stale_count(), 0);
        fx.tree.verify().unwrap();
    }

    #[test]
    fn mark_stale_destroys_idle_descendants_and_parks_referenced_ones() {
        let mut fx = Fixture::new();
        let provider = closing_provider();
        let d = fx.add(fx.root, "/d", NodeKind::Directory);
        let idle = fx.add(d, "/d/idle", NodeKind::File);
        let held = fx.add(d, "/d/held", NodeKind::File);
        let sub = fx.add(d, "/d/sub", NodeKind::Directory);
        let deep = fx.add(sub, "/d/sub/x", NodeKind::File);
        let sibling = fx.add(fx.root, "/d2", NodeKind::File);
        fx.hold(held);

        fx.tree.mark_stale(d, &provider).unwrap();

        assert!(!fx.tree.exists(idle));
        assert!(!fx.tree.exists(deep));
        assert!(!fx.tree.exists(sub), "sub lost its only child and had no handle");
        assert_eq!(fx.tree.get(held).unwrap().state, NodeState::Stale);
        assert_eq!(fx.tree.get(d).unwrap().state, NodeState::Stale);
        assert_eq!(fx.tree.get(d).unwrap().child_count, 1);
        assert_eq!(fx.tree.get(sibling).unwrap().state, NodeState::Live);
        assert_eq!(fx.tree.find_live(INST, "/d"), None);
        fx.tree.verify().unwrap();

        // Idempotent.
        fx.tree.mark_stale(d, &provider).unwrap();
        fx.tree.verify().unwrap();
    }

    #[test]
    fn mark_stale_on_idle_leaf_destroys_it() {
        let mut fx = Fixture::new();
        let provider = closing_provider();
        let f = fx.add(fx.root, "/f", NodeKind::File);
        fx.tree.mark_stale(f, &provider).unwrap();
        assert!(!fx.tree.exists(f));
        assert_eq!(fx.tree.get(fx.root).unwrap().child_count, 0);
    }

    #[test]
    fn rename_rewrites_whole_live_subtree() {
        let mut fx = Fixture::new();
        let provider = closing_provider();
        let d = fx.add(fx.root, "/d", NodeKind::Directory);
        let sub = fx.add(d, "/d/sub", NodeKind::Directory);
        let x = fx.add(sub, "/d/sub/x", NodeKind::File);
        let z_parent = fx.add(fx.root, "/zp", NodeKind::Directory);

        fx.tree.rename(d, z_parent, "/zp/z".to_string(), &provider).unwrap();

        assert_eq!(fx.tree.find_live(INST, "/zp/z"), Some(d));
        assert_eq!(fx.tree.find_live(INST, "/zp/z/sub"), Some(sub));
        assert_eq!(fx.tree.find_live(INST, "/zp/z/sub/x"), Some(x));
        assert_eq!(fx.tree.find_live(INST, "/d"), None);
        assert_eq!(fx.tree.find_live(INST, "/d/sub"), None);
        assert_eq!(fx.tree.find_live(INST, "/d/sub/x"), None);
        assert_eq!(fx.tree.get(fx.root).unwrap().child_count, 1);
        assert_eq!(fx.tree.get(z_parent).unwrap().child_count, 1);
        assert_eq!(fx.tree.get(d).unwrap().parent, Some(z_parent));
        fx.tree.verify().unwrap();
    }

    #[test]
    fn rename_evicts_destination_occupant() {
        let mut fx = Fixture::new();
        let provider = closing_provider();
        let src = fx.add(fx.root, "/src", NodeKind::File);
        let dst = fx.add(fx.root, "/dst", NodeKind::File);
        fx.hold(dst);

        fx.tree.rename(src, fx.root, "/dst".to_string(), &provider).unwrap();

        assert_eq!(fx.tree.find_live(INST, "/dst"), Some(src));
        assert_eq!(fx.tree.get(dst).unwrap().state, NodeState::Stale);
        assert_eq!(fx.tree.get(dst).unwrap().path, "/dst");
        fx.tree.verify().unwrap();
    }

    #[test]
    fn rename_rejects_moving_directory_into_itself() {
        let mut fx = Fixture::new();
        let provider = MockProvider::new();
        let d = fx.add(fx.root, "/d", NodeKind::Directory);
        let sub = fx.add(d, "/d/sub", NodeKind::Directory);
        let err = fx.tree.rename(d, sub, "/d/sub/d".to_string(), &provider).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
        let err = fx.tree.rename(fx.root, d, "/d/root".to_string(), &provider).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
        fx.tree.verify().unwrap();
    }

    #[test]
    fn verify_reports_corrupted_child_count() {
        let mut fx = Fixture::new();
        fx.add(fx.root, "/a", NodeKind::File);
        fx.tree.get_mut(fx.root).unwrap().child_count = 5;
        let err = fx.tree.verify().unwrap_err();
        assert!(matches!(
            err,
            FsError::Consistency(ConsistencyError::ChildCountMismatch {
                recorded: 5,
                actual: 1,
                ..
            })
        ));
    }
}
