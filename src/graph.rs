// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! The persisted feedstock dependency graph
//!
//! `graph.json` holds the node names, the edges, and the output-name lookup
//! table. Each node's attributes live in `node_attrs/<name>.json` and are only
//! read when first asked for, so listing names or walking edges never touches
//! the attribute files. Attribute writes go straight to disk; `save` rewrites
//! `graph.json` itself.

use crate::error::PersistError;
use crate::types::NodeAttrs;
use anyhow::{Context, Result};
use once_cell::unsync::OnceCell;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the graph document inside the data directory
pub const GRAPH_FILE: &str = "graph.json";

/// Directory of per-node attribute files inside the data directory
pub const NODE_ATTRS_DIR: &str = "node_attrs";

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    graph: GraphMeta,
    #[serde(default)]
    nodes: BTreeMap<String, NodeEntry>,
    #[serde(default)]
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphMeta {
    #[serde(default)]
    outputs_lut: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeEntry {
    payload: LazyPayload,
}

#[derive(Debug, Serialize, Deserialize)]
struct LazyPayload {
    #[serde(rename = "__lazy_json__")]
    path: String,
}

/// A persisted edge: `from` is required by `to`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// The dependency
    pub from: String,
    /// The dependent
    pub to: String,
}

/// Dependency graph with lazily loaded node attributes
pub struct DependencyGraph {
    /// Directory the graph is persisted in
    root: PathBuf,
    /// The underlying directed graph; edges point from dependency to dependent
    graph: DiGraph<String, ()>,
    /// Map from node name to node index
    node_indices: HashMap<String, NodeIndex>,
    /// Attribute slots, filled on first access; `None` when no file exists
    slots: BTreeMap<String, OnceCell<Option<NodeAttrs>>>,
    /// Output name to owning feedstock
    outputs_lut: BTreeMap<String, String>,
}

impl DependencyGraph {
    /// Create an empty graph persisted under `root`
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            slots: BTreeMap::new(),
            outputs_lut: BTreeMap::new(),
        }
    }

    /// Load the graph from `root`, or start empty if nothing is persisted
    pub fn load(root: &Path) -> Result<Self> {
        let graph_path = root.join(GRAPH_FILE);
        let mut graph = Self::new(root);
        if !graph_path.exists() {
            return Ok(graph);
        }

        let content = fs::read_to_string(&graph_path)
            .with_context(|| format!("Failed to read {}", graph_path.display()))?;
        let document: GraphDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", graph_path.display()))?;

        for name in document.nodes.keys() {
            graph.insert_node(name);
        }
        for edge in &document.edges {
            let (Some(&from), Some(&to)) = (
                graph.node_indices.get(&edge.from),
                graph.node_indices.get(&edge.to),
            ) else {
                tracing::warn!("Dropping edge {} -> {} with unknown endpoint", edge.from, edge.to);
                continue;
            };
            if from != to && graph.graph.find_edge(from, to).is_none() {
                graph.graph.add_edge(from, to, ());
            }
        }
        graph.outputs_lut = document.graph.outputs_lut;

        Ok(graph)
    }

    /// Write `graph.json` atomically
    pub fn save(&self) -> Result<()> {
        let document = GraphDocument {
            graph: GraphMeta {
                outputs_lut: self.outputs_lut.clone(),
            },
            nodes: self
                .slots
                .keys()
                .map(|name| {
                    (
                        name.clone(),
                        NodeEntry {
                            payload: LazyPayload {
                                path: format!("{NODE_ATTRS_DIR}/{name}.json"),
                            },
                        },
                    )
                })
                .collect(),
            edges: self.edges(),
        };

        let mut json = serde_json::to_string_pretty(&document).context("Failed to serialize graph")?;
        json.push('\n');
        write_atomic(&self.root.join(GRAPH_FILE), json.as_bytes())
    }

    /// Directory the graph is persisted in
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn attrs_path(&self, name: &str) -> PathBuf {
        self.root.join(NODE_ATTRS_DIR).join(format!("{name}.json"))
    }

    fn insert_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.node_indices.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_indices.insert(name.to_string(), idx);
        self.slots.insert(name.to_string(), OnceCell::new());
        idx
    }

    fn read_attrs(&self, name: &str) -> Result<Option<NodeAttrs>> {
        let path = self.attrs_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let attrs = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(attrs))
    }

    fn write_attrs(&self, attrs: &NodeAttrs) -> Result<()> {
        let mut json = serde_json::to_string_pretty(attrs).context("Failed to serialize node attributes")?;
        json.push('\n');
        write_atomic(&self.attrs_path(&attrs.feedstock_name), json.as_bytes())
    }

    /// Add a node with its attributes; an existing node is left untouched.
    ///
    /// Returns whether the node was new.
    pub fn add_node(&mut self, attrs: NodeAttrs) -> Result<bool, PersistError> {
        if self.contains(&attrs.feedstock_name) {
            return Ok(false);
        }
        self.replace_attrs(attrs)?;
        Ok(true)
    }

    /// Set a node's attributes, creating the node if needed, and persist them
    pub fn replace_attrs(&mut self, attrs: NodeAttrs) -> Result<(), PersistError> {
        let name = attrs.feedstock_name.clone();
        self.write_attrs(&attrs).map_err(|cause| PersistError::Write {
            name: name.clone(),
            cause,
        })?;
        self.insert_node(&name);
        self.slots.insert(name, OnceCell::with_value(Some(attrs)));
        Ok(())
    }

    /// Attributes of a node, loading them on first access.
    ///
    /// `Ok(None)` means the node is unknown or has no attribute file.
    pub fn attrs(&self, name: &str) -> Result<Option<&NodeAttrs>, PersistError> {
        let Some(slot) = self.slots.get(name) else {
            return Ok(None);
        };
        let attrs = slot
            .get_or_try_init(|| self.read_attrs(name))
            .map_err(|cause| PersistError::Load {
                name: name.to_string(),
                cause,
            })?;
        Ok(attrs.as_ref())
    }

    /// Open a node for mutation; the attributes are persisted afterwards
    /// whether `f` succeeded or failed.
    ///
    /// The outer result reports persistence failures, the inner one is
    /// whatever `f` returned.
    pub fn update_node<T, E>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut NodeAttrs) -> Result<T, E>,
    ) -> Result<Result<T, E>, PersistError> {
        let mut attrs = self.owned_attrs(name)?;
        let result = f(&mut attrs);
        self.replace_attrs(attrs)?;
        Ok(result)
    }

    /// [`update_node`](Self::update_node) for mutations that cannot fail
    pub fn modify_node(&mut self, name: &str, f: impl FnOnce(&mut NodeAttrs)) -> Result<(), PersistError> {
        match self.update_node(name, |attrs| {
            f(attrs);
            Ok::<(), std::convert::Infallible>(())
        })? {
            Ok(()) => Ok(()),
            Err(never) => match never {},
        }
    }

    /// Run `f` against a copy of a node's attributes without persisting
    pub fn preview_node<T, E>(
        &self,
        name: &str,
        f: impl FnOnce(&mut NodeAttrs) -> Result<T, E>,
    ) -> Result<Result<T, E>, PersistError> {
        let mut attrs = self.owned_attrs(name)?;
        Ok(f(&mut attrs))
    }

    fn owned_attrs(&self, name: &str) -> Result<NodeAttrs, PersistError> {
        if !self.contains(name) {
            return Err(PersistError::UnknownNode(name.to_string()));
        }
        Ok(self
            .attrs(name)?
            .cloned()
            .unwrap_or_else(|| NodeAttrs::new(name)))
    }

    /// Add an edge meaning `from` is required by `to`.
    ///
    /// Returns whether an edge was added. Self-loops and duplicates are not.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<bool> {
        let from_idx = *self
            .node_indices
            .get(from)
            .ok_or_else(|| anyhow::anyhow!("Source node not found: {from}"))?;
        let to_idx = *self
            .node_indices
            .get(to)
            .ok_or_else(|| anyhow::anyhow!("Target node not found: {to}"))?;

        if from_idx == to_idx || self.graph.find_edge(from_idx, to_idx).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(from_idx, to_idx, ());
        Ok(true)
    }

    /// Remove every edge, keeping the nodes
    pub fn clear_edges(&mut self) {
        self.graph.clear_edges();
    }

    /// All node names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.node_indices.contains_key(name)
    }

    /// Number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.node_indices.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        names.sort();
        names
    }

    /// Packages `name` requires, sorted
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Packages that require `name`, sorted
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// All edges, sorted
    #[must_use]
    pub fn edges(&self) -> Vec<EdgeRecord> {
        let mut edges: Vec<EdgeRecord> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| EdgeRecord {
                from: self.graph[from].clone(),
                to: self.graph[to].clone(),
            })
            .collect();
        edges.sort();
        edges
    }

    /// Output name to owning feedstock
    #[must_use]
    pub fn outputs_lut(&self) -> &BTreeMap<String, String> {
        &self.outputs_lut
    }

    /// Replace the output lookup table
    pub fn set_outputs_lut(&mut self, lut: BTreeMap<String, String>) {
        self.outputs_lut = lut;
    }

    /// Dependencies-first order over `subset`.
    ///
    /// Kahn's algorithm over the edges between members of `subset`, always
    /// taking the lexicographically smallest ready node. Members of cycles
    /// are appended at the end in lexicographic order.
    #[must_use]
    pub fn topological_order(&self, subset: &BTreeSet<String>) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> =
            subset.iter().map(|name| (name.as_str(), 0)).collect();
        for edge in self.edges() {
            if subset.contains(&edge.from) {
                if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(subset.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            let Some(&idx) = self.node_indices.get(name) else {
                continue;
            };
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let next = self.graph[next].as_str();
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < subset.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let cyclic: Vec<String> = subset
                .iter()
                .filter(|name| !placed.contains(name.as_str()))
                .cloned()
                .collect();
            tracing::debug!("{} nodes are part of dependency cycles", cyclic.len());
            order.extend(cyclic);
        }
        order
    }
}

/// Write `bytes` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("No parent directory for {}", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
