// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Graph building
//!
//! Fetches attributes for every named feedstock through a bounded worker
//! pool, then derives the output lookup table, propagates strong run
//! exports, and rebuilds the edges from scratch. Per-feedstock failures are
//! recorded in the [`BuildReport`] and never abort the build.

use crate::fetcher::AttributeSource;
use crate::graph::DependencyGraph;
use crate::types::{NodeAttrs, Requirements};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default width of the fetch pool
pub const DEFAULT_MAX_WORKERS: usize = 20;

/// How to run the fetch phase
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Concurrent fetches; 0 means sequential
    pub max_workers: usize,
    /// Fetch in the calling thread
    pub sequential: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            sequential: false,
        }
    }
}

/// What a build did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Feedstocks whose attributes were fetched
    pub fetched: Vec<String>,
    /// Feedstocks whose fetch raised an error
    pub failed: Vec<String>,
    /// Feedstocks marked bad after fetching
    pub bad: Vec<String>,
    /// Stub nodes created for external dependencies
    pub stubs: Vec<String>,
    /// Nodes that have no attribute file
    pub without_payload: Vec<String>,
}

/// Fetch `names` into `graph` and rebuild its lookup table and edges
pub fn build_graph(
    names: &[String],
    organization: &str,
    graph: &mut DependencyGraph,
    source: Arc<dyn AttributeSource>,
    options: &BuildOptions,
) -> Result<BuildReport> {
    let mut report = BuildReport::default();
    let order = fetch_order(names, graph);
    let new_names: BTreeSet<String> = order
        .iter()
        .filter(|n| !graph.contains(n))
        .cloned()
        .collect();
    tracing::info!(
        "Fetching {} feedstocks ({} new)",
        order.len(),
        new_names.len()
    );

    let mut merge = |name: String, result: Result<NodeAttrs>| -> Result<()> {
        match result {
            Ok(attrs) => {
                if attrs.bad.is_bad() {
                    report.bad.push(name.clone());
                }
                if new_names.contains(&name) {
                    graph.add_node(attrs)?;
                } else {
                    graph.modify_node(&name, |existing| existing.absorb_fetch(attrs))?;
                }
                report.fetched.push(name);
            }
            Err(err) => {
                tracing::error!("Error adding {name} to the graph: {err:#}");
                if new_names.contains(&name) {
                    graph.add_node(NodeAttrs::bad(&name, format!("make_graph: {err}")))?;
                }
                report.failed.push(name);
            }
        }
        Ok(())
    };

    if options.sequential || options.max_workers == 0 {
        for name in order {
            let result = source.get_attrs(&name, organization);
            merge(name, result)?;
        }
    } else {
        fetch_concurrently(order, organization, source, options.max_workers, &mut merge)?;
    }
    tracing::info!("Feedstock fetch loop completed");

    tracing::info!("Inferring nodes and edges");
    let lut = outputs_lut(graph)?;
    propagate_strong_exports(graph, &lut)?;
    rebuild_edges(graph, &lut, &mut report)?;
    graph.set_outputs_lut(lut);

    for name in graph.names().map(String::from).collect::<Vec<_>>() {
        if graph.attrs(&name)?.is_none() {
            report.without_payload.push(name);
        }
    }
    report.fetched.sort();
    report.failed.sort();
    report.bad.sort();
    tracing::info!(
        "Graph has {} nodes and {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok(report)
}

/// New names first (sorted), then known names by staleness
fn fetch_order(names: &[String], graph: &DependencyGraph) -> Vec<String> {
    let unique: BTreeSet<&String> = names.iter().collect();
    let (new, old): (Vec<&String>, Vec<&String>) =
        unique.into_iter().partition(|n| !graph.contains(n));

    let mut old: Vec<_> = old
        .into_iter()
        .map(|name| {
            let fetched = graph.attrs(name).ok().flatten().and_then(|a| a.last_fetched);
            (fetched, name)
        })
        .collect();
    old.sort();

    new.into_iter()
        .cloned()
        .chain(old.into_iter().map(|(_, name)| name.clone()))
        .collect()
}

fn fetch_concurrently(
    names: Vec<String>,
    organization: &str,
    source: Arc<dyn AttributeSource>,
    max_workers: usize,
    on_result: &mut dyn FnMut(String, Result<NodeAttrs>) -> Result<()>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start fetch runtime")?;

    runtime.block_on(async {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut tasks = JoinSet::new();
        for name in names {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&source);
            let organization = organization.to_string();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let worker_name = name.clone();
                        tokio::task::spawn_blocking(move || source.get_attrs(&worker_name, &organization))
                            .await
                            .unwrap_or_else(|err| Err(anyhow::anyhow!("fetch worker failed: {err}")))
                    }
                    Err(err) => Err(anyhow::anyhow!("fetch pool closed: {err}")),
                };
                (name, result)
            });
        }
        tracing::info!("Submitted all nodes");

        let total = tasks.len();
        let start = Instant::now();
        let mut eta = None;
        while let Some(joined) = tasks.join_next().await {
            let left = tasks.len();
            let done = total - left;
            if left % 10 == 0 {
                eta = Some(start.elapsed().as_secs_f64() / done as f64 * left as f64);
            }
            match joined {
                Ok((name, result)) => {
                    let eta_secs = eta.map_or(-1, |e: f64| e.round() as i64);
                    tracing::info!("itr {left:>5} - eta {eta_secs:>5}s: finished {name}");
                    on_result(name, result)?;
                }
                Err(err) => tracing::error!("Fetch task failed: {err}"),
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Output name to owning feedstock; the smallest owner wins a collision
fn outputs_lut(graph: &DependencyGraph) -> Result<BTreeMap<String, String>> {
    let mut lut: BTreeMap<String, String> = BTreeMap::new();
    for name in graph.names() {
        let Some(attrs) = graph.attrs(name)? else {
            continue;
        };
        for output in &attrs.recipe.outputs_names {
            match lut.get(output) {
                Some(owner) if owner.as_str() <= name => {
                    tracing::warn!("Output {output} is claimed by {owner} and {name}; keeping {owner}");
                }
                Some(owner) => {
                    tracing::warn!("Output {output} is claimed by {owner} and {name}; keeping {name}");
                    lut.insert(output.clone(), name.to_string());
                }
                None => {
                    lut.insert(output.clone(), name.to_string());
                }
            }
        }
    }
    Ok(lut)
}

fn resolve<'a>(lut: &'a BTreeMap<String, String>, name: &'a str) -> &'a str {
    lut.get(name).map_or(name, String::as_str)
}

fn resolved_all(requirements: &Requirements, lut: &BTreeMap<String, String>) -> BTreeSet<String> {
    requirements
        .all()
        .into_iter()
        .map(|r| resolve(lut, r).to_string())
        .collect()
}

/// Add strong exporters to host and run of everything that (transitively,
/// through run requirements) pulls them in, until nothing changes.
fn propagate_strong_exports(graph: &mut DependencyGraph, lut: &BTreeMap<String, String>) -> Result<()> {
    let mut requirements: BTreeMap<String, Requirements> = BTreeMap::new();
    let mut strong: BTreeSet<String> = BTreeSet::new();
    for name in graph.names() {
        if let Some(attrs) = graph.attrs(name)? {
            if attrs.recipe.strong_exports {
                strong.insert(name.to_string());
            }
            if !attrs.recipe.requirements.is_empty() {
                requirements.insert(name.to_string(), attrs.recipe.requirements.clone());
            }
        }
    }
    if strong.is_empty() {
        return Ok(());
    }

    let mut changed_nodes: BTreeSet<String> = BTreeSet::new();
    loop {
        let mut additions: Vec<(String, String)> = Vec::new();
        for (node, reqs) in &requirements {
            for dep in resolved_all(reqs, lut) {
                let dep_run: BTreeSet<&str> = requirements
                    .get(&dep)
                    .map(|r| r.run.iter().map(|x| resolve(lut, x)).collect())
                    .unwrap_or_default();
                for exporter in &strong {
                    if exporter == node {
                        continue;
                    }
                    let pulled = *exporter == dep || dep_run.contains(exporter.as_str());
                    if pulled && !(reqs.host.contains(exporter) && reqs.run.contains(exporter)) {
                        additions.push((node.clone(), exporter.clone()));
                    }
                }
            }
        }
        if additions.is_empty() {
            break;
        }
        for (node, exporter) in additions {
            if let Some(reqs) = requirements.get_mut(&node) {
                reqs.host.insert(exporter.clone());
                reqs.run.insert(exporter);
                changed_nodes.insert(node);
            }
        }
    }

    for name in changed_nodes {
        if let Some(reqs) = requirements.remove(&name) {
            graph.modify_node(&name, |attrs| attrs.recipe.requirements = reqs)?;
        }
    }
    Ok(())
}

fn rebuild_edges(
    graph: &mut DependencyGraph,
    lut: &BTreeMap<String, String>,
    report: &mut BuildReport,
) -> Result<()> {
    graph.clear_edges();
    let names: Vec<String> = graph.names().map(String::from).collect();
    for name in names {
        let deps = match graph.attrs(&name)? {
            Some(attrs) => resolved_all(&attrs.recipe.requirements, lut),
            None => continue,
        };
        for dep in deps {
            if !graph.contains(&dep) {
                graph.add_node(NodeAttrs::stub(&dep))?;
                report.stubs.push(dep.clone());
            }
            graph.add_edge(&dep, &name)?;
        }
    }
    report.stubs.sort();
    Ok(())
}

#[derive(Debug, Deserialize)]
struct VersionFile {
    #[serde(default)]
    new_version: serde_json::Value,
}

/// Ingest `versions/<name>.json` files into the matching nodes.
///
/// Each file holds `{"new_version": "<version>"}` or `{"new_version": false}`.
/// Returns how many nodes were updated.
pub fn update_nodes_with_new_versions(graph: &mut DependencyGraph, versions_dir: &Path) -> Result<usize> {
    if !versions_dir.is_dir() {
        tracing::debug!("No versions directory at {}", versions_dir.display());
        return Ok(0);
    }

    let mut entries: Vec<_> = fs::read_dir(versions_dir)
        .with_context(|| format!("Failed to read {}", versions_dir.display()))?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort();

    let mut updated = 0;
    for path in entries {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !graph.contains(name) {
            continue;
        }
        let parsed: VersionFile = match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!("Skipping {}: {err:#}", path.display());
                continue;
            }
        };
        let new_version = match parsed.new_version {
            serde_json::Value::String(v) if !v.is_empty() => Some(v),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        graph.modify_node(name, |attrs| attrs.new_version = new_version)?;
        updated += 1;
    }
    tracing::info!("Ingested {updated} upstream version files");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(name: &str, run: &[&str], strong: bool) -> NodeAttrs {
        let mut attrs = NodeAttrs::new(name);
        attrs.recipe.requirements.run = run.iter().map(|s| s.to_string()).collect();
        attrs.recipe.strong_exports = strong;
        attrs
    }

    #[test]
    fn test_fetch_order_new_first_then_stalest() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        let mut fresh = NodeAttrs::new("fresh");
        fresh.last_fetched = Some(chrono::Utc::now());
        let mut stale = NodeAttrs::new("stale");
        stale.last_fetched = Some(chrono::Utc::now() - chrono::Duration::days(3));
        graph.add_node(fresh).unwrap();
        graph.add_node(stale).unwrap();
        graph.add_node(NodeAttrs::new("never")).unwrap();

        let names: Vec<String> = ["fresh", "zeta", "stale", "never", "alpha", "zeta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            fetch_order(&names, &graph),
            vec!["alpha", "zeta", "never", "stale", "fresh"]
        );
    }

    #[test]
    fn test_lut_collision_smallest_owner_wins() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        for owner in ["zlib", "libz"] {
            let mut attrs = NodeAttrs::new(owner);
            attrs.recipe.outputs_names = vec!["zlib-shared".into()];
            graph.add_node(attrs).unwrap();
        }
        let lut = outputs_lut(&graph).unwrap();
        assert_eq!(lut["zlib-shared"], "libz");
    }

    #[test]
    fn test_strong_exports_are_transitive_and_host_run_only() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        graph.add_node(node("a", &[], true)).unwrap();
        graph.add_node(node("b", &["a"], false)).unwrap();
        let mut c = node("c", &["b"], false);
        c.recipe.requirements.build.insert("cmake".into());
        graph.add_node(c).unwrap();

        propagate_strong_exports(&mut graph, &BTreeMap::new()).unwrap();

        let c = graph.attrs("c").unwrap().unwrap();
        assert!(c.recipe.requirements.run.contains("a"));
        assert!(c.recipe.requirements.host.contains("a"));
        assert!(!c.recipe.requirements.build.contains("a"));
        assert!(!c.recipe.requirements.test.contains("a"));
        assert!(graph.attrs("b").unwrap().unwrap().recipe.requirements.host.contains("a"));
    }

    #[test]
    fn test_rebuild_edges_creates_stubs() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        graph.add_node(node("app", &["libcore", "python", "app"], false)).unwrap();
        graph.add_node(NodeAttrs::new("core")).unwrap();
        let lut = BTreeMap::from([("libcore".to_string(), "core".to_string())]);
        let mut report = BuildReport::default();

        rebuild_edges(&mut graph, &lut, &mut report).unwrap();

        assert_eq!(report.stubs, vec!["python"]);
        assert_eq!(graph.dependencies_of("app"), vec!["core", "python"]);
        let stub = graph.attrs("python").unwrap().unwrap();
        assert!(stub.archived);
        assert!(!stub.bad.is_bad());
    }

    #[test]
    fn test_ingest_new_versions() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        graph.add_node(NodeAttrs::new("a")).unwrap();
        graph.add_node(NodeAttrs::new("b")).unwrap();
        let versions = dir.path().join("versions");
        fs::create_dir_all(&versions).unwrap();
        fs::write(versions.join("a.json"), r#"{"new_version": "1.2"}"#).unwrap();
        fs::write(versions.join("b.json"), r#"{"new_version": false}"#).unwrap();
        fs::write(versions.join("unknown.json"), r#"{"new_version": "9"}"#).unwrap();

        assert_eq!(update_nodes_with_new_versions(&mut graph, &versions).unwrap(), 2);
        assert_eq!(graph.attrs("a").unwrap().unwrap().new_version.as_deref(), Some("1.2"));
        assert_eq!(graph.attrs("b").unwrap().unwrap().new_version, None);
    }
}
