// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Attr command - reads one value out of a feedstock's parsed recipe

use super::{load_graph, print_json};
use crate::config::Config;
use crate::fetcher::{populate_attributes, recipe_attribute, FileFetch, RawFileSource, META_YAML_PATH};
use crate::github::GitHubClient;
use crate::host::feedstock_repo;
use crate::recipe::MetaYamlParser;
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use std::fs;

/// Where the recipe is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecipeSource {
    /// The attributes stored in the graph
    Graph,
    /// The feedstock's default branch on the host
    Host,
    /// The local copy made by `clone`
    Clone,
}

/// Parsed recipe of `name` from `text`
fn parse(name: &str, text: String) -> Result<Value> {
    let attrs = populate_attributes(name, FileFetch::Found(text), FileFetch::Found("{}".into()), &MetaYamlParser);
    if attrs.bad.is_bad() {
        bail!("Could not parse the recipe of {name}");
    }
    Ok(attrs.recipe.meta_yaml)
}

fn load_recipe(config: &Config, name: &str, source: RecipeSource) -> Result<Value> {
    match source {
        RecipeSource::Graph => {
            let graph = load_graph(config)?;
            let recipe = match graph.attrs(name)? {
                Some(attrs) => attrs.recipe.meta_yaml.clone(),
                None => bail!("No node named {name} in the graph"),
            };
            Ok(recipe)
        }
        RecipeSource::Host => {
            let client = GitHubClient::from_config(config)?;
            match client.fetch_raw(&config.organization, name, META_YAML_PATH)? {
                FileFetch::Found(text) => parse(name, text),
                FileFetch::Status(code) => bail!("Fetching the recipe of {name} returned {code}"),
            }
        }
        RecipeSource::Clone => {
            let path = config
                .feedstocks_dir()
                .join(feedstock_repo(name))
                .join(META_YAML_PATH);
            let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            parse(name, text)
        }
    }
}

/// Run the attr command
pub fn run(config: &Config, name: &str, attribute: &str, source: RecipeSource, json: bool) -> Result<()> {
    let recipe = load_recipe(config, name, source)?;
    let Some(value) = recipe_attribute(&recipe, attribute) else {
        bail!("{name} has no attribute `{attribute}`");
    };

    match value {
        Value::String(text) if !json => println!("{text}"),
        _ => print_json(value)?,
    }
    Ok(())
}
