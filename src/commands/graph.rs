// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Graph command - fetches recipe attributes and rebuilds the dependency graph

use super::{load_graph, print_json};
use crate::builder::{build_graph, update_nodes_with_new_versions, BuildOptions};
use crate::config::Config;
use crate::discovery::{get_all_feedstocks, read_names, sync_archived};
use crate::fetcher::RecipeFetcher;
use crate::github::GitHubClient;
use crate::host::HostingService;
use crate::prs::{refresh_open_prs, update_nodes_with_bot_rerun};
use crate::recipe::MetaYamlParser;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Run the graph command
pub fn run(config: &Config, refresh_prs: bool, json: bool) -> Result<()> {
    let client = Arc::new(GitHubClient::from_config(config)?);

    let mut names = read_names(&config.data_dir)?;
    if names.is_empty() {
        info!("No cached names, listing {}", config.organization);
        names = get_all_feedstocks(client.as_ref(), &config.organization, &config.data_dir, false)?.names;
    }

    let mut graph = load_graph(config)?;
    let fetcher = Arc::new(RecipeFetcher::new(client.clone(), Arc::new(MetaYamlParser)));
    let options = BuildOptions {
        max_workers: config.max_workers,
        sequential: config.sequential,
    };
    let report = build_graph(&names, &config.organization, &mut graph, fetcher, &options)?;

    let archived = match client.list_repositories(&config.organization) {
        Ok(repos) => sync_archived(&mut graph, &repos)?,
        Err(err) => {
            warn!("Listing {} failed, keeping archive flags: {err}", config.organization);
            0
        }
    };

    let versions = update_nodes_with_new_versions(&mut graph, &config.versions_dir())?;
    let reruns = update_nodes_with_bot_rerun(&mut graph)?;
    let refreshed = if refresh_prs {
        refresh_open_prs(&mut graph, client.as_ref(), &config.organization)?
    } else {
        0
    };

    graph
        .save()
        .with_context(|| format!("Failed to save graph to {}", config.data_dir.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "nodes": graph.node_count(),
            "edges": graph.edge_count(),
            "fetched": report.fetched,
            "failed": report.failed,
            "bad": report.bad,
            "stubs": report.stubs,
            "archive_changes": archived,
            "new_versions": versions,
            "bot_reruns": reruns,
            "refreshed_prs": refreshed,
        }));
    }

    println!(
        "Graph: {} nodes, {} edges saved to {}",
        graph.node_count(),
        graph.edge_count(),
        config.data_dir.display()
    );
    println!(
        "  fetched {}, failed {}, bad {}, stubs {}",
        report.fetched.len(),
        report.failed.len(),
        report.bad.len(),
        report.stubs.len()
    );
    println!(
        "  new versions {versions}, bot reruns {reruns}, refreshed PRs {refreshed}, archive changes {archived}"
    );
    for name in &report.failed {
        eprintln!("  Warning: fetching {name} failed");
    }
    Ok(())
}
