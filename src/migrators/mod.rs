// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Migration definitions
//!
//! A [`Migrator`] describes one kind of automated change: which nodes it
//! applies to, the order it visits them in, how it edits a working copy, and
//! how its pull requests are named. [`MiniMigrator`]s are small cleanups that
//! ride along before or after the primary edit.

pub mod mini;
pub mod pinning;
pub mod version;

use crate::config::Config;
use crate::graph::DependencyGraph;
use crate::render::SourceHasher;
use crate::types::{MigrationUid, NodeAttrs};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub use mini::{default_piggy_backs, MiniMigrator, Phase};
pub use pinning::PinningMigrator;
pub use version::VersionMigrator;

/// Result of a migrator's primary edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// The working copy was changed
    Changed,
    /// Nothing to change; the reason is logged
    NoChange(String),
}

/// One kind of automated migration
pub trait Migrator {
    /// Stable name, used in fingerprints
    fn name(&self) -> &str;

    /// Revision of this migrator's behavior
    fn migrator_version(&self) -> u32 {
        0
    }

    /// Most pull requests to open per run
    fn pr_limit(&self) -> usize;

    /// Whether a clean, unarchived node should be migrated
    fn is_eligible(&self, attrs: &NodeAttrs) -> bool;

    /// Visit order over the effective subgraph
    fn order(&self, graph: &DependencyGraph, subgraph: &BTreeSet<String>) -> Vec<String> {
        graph.topological_order(subgraph)
    }

    /// Cleanups run alongside the primary edit
    fn piggy_backs(&self) -> &[Box<dyn MiniMigrator>] {
        &[]
    }

    /// Bookkeeping done on the node just before the pipeline runs
    fn prepare(&self, _attrs: &mut NodeAttrs) {}

    /// Apply the primary edit to the working copy at `feedstock_dir`
    fn migrate(&self, feedstock_dir: &Path, attrs: &NodeAttrs) -> Result<MigrateOutcome>;

    /// Commit message for the edit
    fn commit_message(&self, attrs: &NodeAttrs) -> String;

    /// Pull request title
    fn pr_title(&self, attrs: &NodeAttrs) -> String;

    /// Migrator-specific part of the pull request body
    fn pr_body(&self, attrs: &NodeAttrs) -> String;

    /// Stem of the branch pushed for this node
    fn remote_branch(&self, attrs: &NodeAttrs) -> String;

    /// Fingerprint identifying this migration on this node
    fn migrator_uid(&self, _attrs: &NodeAttrs) -> MigrationUid {
        MigrationUid {
            migrator_name: self.name().to_string(),
            migrator_version: self.migrator_version(),
            version: None,
            name: None,
            bot_rerun: None,
        }
    }

    /// Whether publishing needs a change outside the bookkeeping paths
    fn requires_real_diff(&self) -> bool {
        false
    }
}

/// Nodes a migrator would touch: attributes present, clean, unarchived, eligible
pub fn effective_subgraph(graph: &DependencyGraph, migrator: &dyn Migrator) -> Result<BTreeSet<String>> {
    let mut subgraph = BTreeSet::new();
    for name in graph.names() {
        let Some(attrs) = graph.attrs(name)? else {
            continue;
        };
        if attrs.is_migratable() && migrator.is_eligible(attrs) {
            subgraph.insert(name.to_string());
        }
    }
    Ok(subgraph)
}

/// Ordered migrators for one run
pub struct MigratorRegistry {
    migrators: Vec<Box<dyn Migrator>>,
}

impl MigratorRegistry {
    /// Registry over explicit migrators
    #[must_use]
    pub fn new(migrators: Vec<Box<dyn Migrator>>) -> Self {
        Self { migrators }
    }

    /// Version migrator first, then one pinning migrator per definition file
    pub fn default_for(config: &Config, hasher: Arc<dyn SourceHasher>) -> Result<Self> {
        let mut migrators: Vec<Box<dyn Migrator>> =
            vec![Box::new(VersionMigrator::new(config.pr_limit * 2, hasher))];

        let dir = config.migrations_dir();
        if dir.is_dir() {
            let mut files: Vec<_> = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read {}", dir.display()))?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext == "yaml" || ext == "yml")
                })
                .collect();
            files.sort();
            for path in files {
                migrators.push(Box::new(PinningMigrator::from_file(&path, config.pr_limit)?));
            }
        }

        tracing::info!(
            "Registered migrators: {}",
            migrators.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self::new(migrators))
    }

    /// Migrators in run order
    #[must_use]
    pub fn migrators(&self) -> &[Box<dyn Migrator>] {
        &self.migrators
    }

    /// Number of migrators
    #[must_use]
    pub fn len(&self) -> usize {
        self.migrators.len()
    }

    /// Whether there are no migrators
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrators.is_empty()
    }
}

/// Path of the recipe inside a working copy
#[must_use]
pub fn meta_yaml_path(feedstock_dir: &Path) -> std::path::PathBuf {
    feedstock_dir.join("recipe").join("meta.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BadMarker;
    use tempfile::TempDir;

    struct Everything;

    impl Migrator for Everything {
        fn name(&self) -> &str {
            "Everything"
        }
        fn pr_limit(&self) -> usize {
            1
        }
        fn is_eligible(&self, _attrs: &NodeAttrs) -> bool {
            true
        }
        fn migrate(&self, _dir: &Path, _attrs: &NodeAttrs) -> Result<MigrateOutcome> {
            Ok(MigrateOutcome::Changed)
        }
        fn commit_message(&self, _attrs: &NodeAttrs) -> String {
            String::new()
        }
        fn pr_title(&self, _attrs: &NodeAttrs) -> String {
            String::new()
        }
        fn pr_body(&self, _attrs: &NodeAttrs) -> String {
            String::new()
        }
        fn remote_branch(&self, _attrs: &NodeAttrs) -> String {
            String::new()
        }
    }

    #[test]
    fn test_effective_subgraph_skips_bad_and_archived() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        graph.add_node(NodeAttrs::new("good")).unwrap();
        graph.add_node(NodeAttrs::bad("broken", "make_graph: 404")).unwrap();
        graph.add_node(NodeAttrs::stub("external")).unwrap();
        let mut raised = NodeAttrs::new("raised");
        raised.bad = BadMarker::Exception(crate::types::ExceptionReport {
            exception: "boom".into(),
            code: None,
            url: None,
        });
        graph.add_node(raised).unwrap();

        let subgraph = effective_subgraph(&graph, &Everything).unwrap();
        assert_eq!(subgraph.into_iter().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn test_registry_loads_pinning_files() {
        let dir = TempDir::new().unwrap();
        let migrations = dir.path().join("migrations");
        fs::create_dir_all(&migrations).unwrap();
        fs::write(migrations.join("libfoo20.yaml"), "__migrator:\n  migration_number: 1\nlibfoo:\n  - '2.0'\n").unwrap();
        fs::write(migrations.join("notes.txt"), "ignored").unwrap();

        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let hasher: Arc<dyn SourceHasher> = Arc::new(crate::render::HttpSourceHasher::new().unwrap());
        let registry = MigratorRegistry::default_for(&config, hasher).unwrap();

        let names: Vec<&str> = registry.migrators().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Version", "libfoo20"]);
        assert_eq!(registry.migrators()[0].pr_limit(), 10);
        assert_eq!(registry.migrators()[1].pr_limit(), 5);
    }
}
