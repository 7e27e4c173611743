// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Status command - summary of the persisted graph

use super::{load_graph, print_json};
use crate::config::Config;
use crate::discovery::{read_names, read_status};
use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
struct Summary {
    names: usize,
    names_current: Option<bool>,
    nodes: usize,
    edges: usize,
    bad: Vec<String>,
    archived: usize,
    open_prs: usize,
    pending_versions: usize,
}

/// Run the status command
pub fn run(config: &Config, json: bool) -> Result<()> {
    let graph = load_graph(config)?;
    let mut summary = Summary {
        names: read_names(&config.data_dir)?.len(),
        names_current: read_status(&config.data_dir)?,
        nodes: graph.node_count(),
        edges: graph.edge_count(),
        ..Summary::default()
    };

    for name in graph.names() {
        let Some(attrs) = graph.attrs(name)? else {
            continue;
        };
        if attrs.bad.is_bad() {
            summary.bad.push(name.to_string());
        }
        if attrs.archived {
            summary.archived += 1;
        }
        summary.open_prs += attrs.migration_history.iter().filter(|a| a.pr.is_open()).count();
        if attrs.new_version.is_some() && attrs.new_version != attrs.recipe.version {
            summary.pending_versions += 1;
        }
    }

    if json {
        return print_json(&summary);
    }

    println!("{}", "feedstock-tick status".bold());
    let freshness = match summary.names_current {
        Some(true) => "current".green().to_string(),
        Some(false) => "cached".yellow().to_string(),
        None => "never listed".dimmed().to_string(),
    };
    println!("  names:     {} ({freshness})", summary.names);
    println!("  nodes:     {}", summary.nodes);
    println!("  edges:     {}", summary.edges);
    println!("  archived:  {}", summary.archived);
    println!("  open PRs:  {}", summary.open_prs);
    println!("  pending:   {} version updates", summary.pending_versions);
    if summary.bad.is_empty() {
        println!("  bad:       {}", "0".green());
    } else {
        println!("  bad:       {}", summary.bad.len().red());
        for name in &summary.bad {
            println!("    {name}");
        }
    }
    Ok(())
}
