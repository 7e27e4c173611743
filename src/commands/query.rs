// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Query command - dependencies and dependents of one feedstock

use super::{load_graph, print_json};
use crate::config::Config;
use anyhow::{bail, Result};
use clap::ValueEnum;

/// Which side of the edge to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    /// What the package requires
    DependsOn,
    /// What requires the package
    DependsOf,
}

/// Run the query command
pub fn run(config: &Config, name: &str, direction: Direction, json: bool) -> Result<()> {
    let graph = load_graph(config)?;
    if !graph.contains(name) {
        bail!("No node named {name} in the graph");
    }

    let related = match direction {
        Direction::DependsOn => graph.dependencies_of(name),
        Direction::DependsOf => graph.dependents_of(name),
    };

    if json {
        return print_json(&related);
    }
    for entry in related {
        println!("{entry}");
    }
    Ok(())
}
