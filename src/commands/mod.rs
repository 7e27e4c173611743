// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//
//! Command implementations

pub mod attr;
pub mod clean;
pub mod clone;
pub mod completions;
pub mod config;
pub mod graph;
pub mod names;
pub mod query;
pub mod run;
pub mod status;

use crate::config::Config;
use crate::graph::DependencyGraph;
use anyhow::{Context, Result};

/// Load the persisted graph under the configured data directory
pub(crate) fn load_graph(config: &Config) -> Result<DependencyGraph> {
    DependencyGraph::load(&config.data_dir)
        .with_context(|| format!("Failed to load graph from {}", config.data_dir.display()))
}

/// Print `value` as pretty JSON on stdout
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}
