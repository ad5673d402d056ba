// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered indexes over live and stale nodes
//!
//! Both stores keep their keys sorted by path so that every descendant of a
//! directory `d` forms one contiguous run starting at `d + "/"`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::{violation, ConsistencyError, FsResult};
use crate::types::{InstanceId, NodeRef};

/// Live nodes, one path index per instance.
#[derive(Debug, Default)]
pub(crate) struct NodeStore {
    entries: BTreeMap<InstanceId, BTreeMap<String, NodeRef>>,
    len: usize,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance: InstanceId, path: &str) -> Option<NodeRef> {
        self.entries.get(&instance)?.get(path).copied()
    }

    pub fn contains(&self, instance: InstanceId, path: &str) -> bool {
        self.get(instance, path).is_some()
    }

    pub fn insert(&mut self, instance: InstanceId, path: &str, node: NodeRef) -> FsResult<()> {
        let paths = self.entries.entry(instance).or_default();
        if paths.contains_key(path) {
            return Err(violation(ConsistencyError::DuplicateLive {
                path: path.to_string(),
            }));
        }
        paths.insert(path.to_string(), node);
        self.len += 1;
        Ok(())
    }

    pub fn remove(&mut self, instance: InstanceId, path: &str) -> FsResult<NodeRef> {
        let missing = || {
            violation(ConsistencyError::MissingLive {
                path: path.to_string(),
            })
        };
        let paths = self.entries.get_mut(&instance).ok_or_else(missing)?;
        let node = paths.remove(path).ok_or_else(missing)?;
        if paths.is_empty() {
            self.entries.remove(&instance);
        }
        self.len -= 1;
        Ok(node)
    }

    /// Every live strict descendant of `path`, in path order.
    pub fn descendants(&self, instance: InstanceId, path: &str) -> Vec<(String, NodeRef)> {
        let Some(paths) = self.entries.get(&instance) else {
            return Vec::new();
        };
        let prefix = format!("{path}/");
        paths
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, node)| (p.clone(), *node))
            .collect()
    }

    /// Every live node of `instance`, in path order.
    pub fn instance_nodes(&self, instance: InstanceId) -> Vec<(String, NodeRef)> {
        self.entries
            .get(&instance)
            .map(|paths| paths.iter().map(|(p, node)| (p.clone(), *node)).collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &str, NodeRef)> + '_ {
        self.entries.iter().flat_map(|(inst, paths)| {
            paths.iter().map(move |(p, node)| (*inst, p.as_str(), *node))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Stale nodes, keyed by path; each path may hold several nodes.
///
/// Several stale nodes may carry the same path at once, e.g. a file that was
/// deleted and recreated on the host while the guest kept the old one open.
#[derive(Debug, Default)]
pub(crate) struct StaleNodeStore {
    entries: BTreeMap<String, BTreeSet<NodeRef>>,
    len: usize,
}

impl StaleNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str, node: NodeRef) -> bool {
        self.entries.get(path).is_some_and(|nodes| nodes.contains(&node))
    }

    pub fn insert(&mut self, path: &str, node: NodeRef) -> FsResult<()> {
        if self.contains(path, node) {
            return Err(violation(ConsistencyError::DuplicateStale {
                path: path.to_string(),
            }));
        }
        self.entries.entry(path.to_string()).or_default().insert(node);
        self.len += 1;
        Ok(())
    }

    pub fn remove(&mut self, path: &str, node: NodeRef) -> FsResult<()> {
        let removed = match self.entries.get_mut(path) {
            Some(nodes) => {
                let removed = nodes.remove(&node);
                if nodes.is_empty() {
                    self.entries.remove(path);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return Err(violation(ConsistencyError::MissingStale {
                path: path.to_string(),
            }));
        }
        self.len -= 1;
        Ok(())
    }

    /// Stale entries whose path is `path` or sorts after it, in order.
    pub fn iter_from<'a>(&'a self, path: &str) -> impl Iterator<Item = (&'a str, NodeRef)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(path), Bound::Unbounded))
            .flat_map(|(p, nodes)| nodes.iter().map(move |node| (p.as_str(), *node)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeRef)> + '_ {
        self.iter_from("")
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
