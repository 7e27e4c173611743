// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Attribute fetching
//!
//! Pulls `recipe/meta.yaml` and `conda-forge.yml` for one feedstock and turns
//! them into a [`NodeAttrs`] bundle. Nothing here touches shared state, so
//! fetches run freely in parallel.

use crate::error::HostError;
use crate::recipe::{merge_platforms, Platform, RecipeParser};
use crate::types::{BadMarker, NodeAttrs, Requirements, Section};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Recipe path inside a feedstock
pub const META_YAML_PATH: &str = "recipe/meta.yaml";

/// Feedstock configuration path
pub const CONDA_FORGE_YML_PATH: &str = "conda-forge.yml";

/// `conda-forge.yml` keys kept on the node
pub const CONDA_FORGE_YML_KEYS: [&str; 7] = [
    "provider",
    "min_r_ver",
    "min_py_ver",
    "max_py_ver",
    "max_r_ver",
    "compiler_stack",
    "bot",
];

/// Source keys that name a checksum algorithm
pub const HASH_ALGORITHMS: [&str; 6] = ["md5", "sha1", "sha224", "sha256", "sha384", "sha512"];

/// Result of fetching one raw file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFetch {
    /// File contents
    Found(String),
    /// The server answered with a non-success status
    Status(u16),
}

/// Reads raw files from a feedstock's default branch
pub trait RawFileSource: Send + Sync {
    /// Fetch `path` from `<organization>/<feedstock>-feedstock`
    fn fetch_raw(&self, organization: &str, feedstock: &str, path: &str) -> Result<FileFetch, HostError>;
}

/// Produces the attribute bundle for one feedstock.
///
/// An `Err` is a worker failure (transport, bug); data problems are reported
/// through the returned bundle's `bad` marker instead.
pub trait AttributeSource: Send + Sync {
    /// Fetch and extract attributes for `name`
    fn get_attrs(&self, name: &str, organization: &str) -> Result<NodeAttrs>;
}

/// [`AttributeSource`] backed by raw file fetches and a recipe parser
pub struct RecipeFetcher {
    source: Arc<dyn RawFileSource>,
    parser: Arc<dyn RecipeParser>,
}

impl RecipeFetcher {
    /// Create a fetcher
    pub fn new(source: Arc<dyn RawFileSource>, parser: Arc<dyn RecipeParser>) -> Self {
        Self { source, parser }
    }
}

impl AttributeSource for RecipeFetcher {
    fn get_attrs(&self, name: &str, organization: &str) -> Result<NodeAttrs> {
        let meta_yaml = self.source.fetch_raw(organization, name, META_YAML_PATH)?;
        let conda_forge_yml = self.source.fetch_raw(organization, name, CONDA_FORGE_YML_PATH)?;
        Ok(populate_attributes(name, meta_yaml, conda_forge_yml, self.parser.as_ref()))
    }
}

/// Build the attribute bundle from fetched file contents
pub fn populate_attributes(
    name: &str,
    meta_yaml: FileFetch,
    conda_forge_yml: FileFetch,
    parser: &dyn RecipeParser,
) -> NodeAttrs {
    let mut attrs = NodeAttrs::new(name);
    attrs.last_fetched = Some(Utc::now());

    let (meta_yaml, conda_forge_yml) = match (meta_yaml, conda_forge_yml) {
        (FileFetch::Found(meta), FileFetch::Found(cfy)) => (meta, cfy),
        (FileFetch::Status(status), _) | (_, FileFetch::Status(status)) => {
            tracing::error!("Something odd happened when fetching recipe {name}: {status}");
            attrs.bad = BadMarker::Reason(format!("make_graph: {status}"));
            return attrs;
        }
    };

    attrs.recipe.conda_forge_yml = whitelisted_config(name, &conda_forge_yml);
    attrs.recipe.raw_meta_yaml = Some(meta_yaml.clone());

    let documents: Vec<Value> = Platform::ALL
        .iter()
        .filter_map(|&platform| match parser.parse(&meta_yaml, platform) {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::debug!("{name}: recipe does not render for {platform}: {err:#}");
                None
            }
        })
        .collect();
    let merged = merge_platforms(documents);
    if merged.as_object().map_or(true, serde_json::Map::is_empty) {
        tracing::error!("Something odd happened when parsing recipe {name}");
        attrs.bad = BadMarker::Reason("make_graph: Could not parse".into());
        return attrs;
    }

    let (total, strong_exports) = extract_requirements(&merged);
    attrs.recipe.requirements = normalize_requirements(&total);
    attrs.recipe.total_requirements = total;
    attrs.recipe.strong_exports = strong_exports;
    attrs.recipe.outputs_names = outputs_names(&merged);

    let package = merged.get("package");
    attrs.recipe.name = package.and_then(|p| p.get("name")).and_then(scalar_string);
    attrs.recipe.version = package.and_then(|p| p.get("version")).and_then(scalar_string);

    let sources = as_list(merged.get("source"));
    attrs.recipe.url = sources
        .iter()
        .filter_map(|s| s.get("url"))
        .find_map(|url| as_list(Some(url)).into_iter().find_map(scalar_string));
    attrs.recipe.hash_type = sources
        .iter()
        .filter_map(|s| s.as_object())
        .flat_map(|s| s.keys())
        .filter(|k| HASH_ALGORITHMS.contains(&k.as_str()))
        .max()
        .cloned();

    let mut missing: Vec<&str> = Vec::new();
    if attrs.recipe.name.is_none() {
        missing.push("name");
    }
    if attrs.recipe.version.is_none() {
        missing.push("version");
    }
    if attrs.recipe.url.is_none() {
        missing.push("url");
    }
    if !missing.is_empty() {
        tracing::error!("Recipe {name} doesn't have a {}", missing.join(", "));
    }

    attrs.recipe.meta_yaml = merged;
    attrs
}

/// Walk a parsed recipe by a space-separated key path such as `source url`.
///
/// A numeric key indexes into a list; any other key on a list reads the
/// first entry that has it.
#[must_use]
pub fn recipe_attribute<'a>(meta_yaml: &'a Value, path: &str) -> Option<&'a Value> {
    path.split_whitespace().try_fold(meta_yaml, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => match key.parse::<usize>() {
            Ok(index) => items.get(index),
            Err(_) => items.iter().find_map(|item| item.get(key)),
        },
        _ => None,
    })
}

fn whitelisted_config(name: &str, text: &str) -> serde_json::Map<String, Value> {
    let parsed: Value = match serde_yaml::from_str::<serde_yaml::Value>(text)
        .map_err(anyhow::Error::from)
        .and_then(|yaml| serde_json::to_value(yaml).map_err(anyhow::Error::from))
    {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("{name}: ignoring unreadable {CONDA_FORGE_YML_PATH}: {err:#}");
            return serde_json::Map::new();
        }
    };

    match parsed {
        Value::Object(map) => map
            .into_iter()
            .filter(|(k, _)| CONDA_FORGE_YML_KEYS.contains(&k.as_str()))
            .collect(),
        _ => serde_json::Map::new(),
    }
}

/// Collect raw requirement strings from the main block and every output.
///
/// Returns the requirements and whether any block declares strong run exports.
#[must_use]
pub fn extract_requirements(meta_yaml: &Value) -> (Requirements, bool) {
    let mut requirements = Requirements::default();
    let mut strong_exports = false;

    let blocks = std::iter::once(meta_yaml).chain(
        meta_yaml
            .get("outputs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten(),
    );

    for block in blocks {
        match block.get("requirements") {
            Some(Value::Array(list)) => {
                requirements.run.extend(list.iter().filter_map(scalar_string));
                continue;
            }
            Some(reqs @ Value::Object(_)) => {
                for section in [Section::Build, Section::Host, Section::Run] {
                    requirements
                        .section_mut(section)
                        .extend(as_list(reqs.get(section.key())).into_iter().filter_map(scalar_string));
                }
            }
            _ => {}
        }

        if let Some(test) = block.get("test") {
            for key in ["requirements", "requires"] {
                requirements
                    .test
                    .extend(as_list(test.get(key)).into_iter().filter_map(scalar_string));
            }
        }

        let strong = block
            .get("build")
            .and_then(|b| b.get("run_exports"))
            .and_then(|r| r.get("strong"));
        if strong.is_some_and(|s| !as_list(Some(s)).is_empty()) {
            strong_exports = true;
        }
    }

    (requirements, strong_exports)
}

/// Reduce a requirement string to its package name: truncate at the first
/// space, `>`, `<`, `=` or `[` and lower-case.
#[must_use]
pub fn normalize_requirement(requirement: &str) -> String {
    requirement
        .split([' ', '>', '<', '=', '['])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// Normalize every section, dropping names that normalize to nothing
#[must_use]
pub fn normalize_requirements(total: &Requirements) -> Requirements {
    let mut normalized = Requirements::default();
    for section in Section::ALL {
        *normalized.section_mut(section) = total
            .section(section)
            .iter()
            .map(|r| normalize_requirement(r))
            .filter(|r| !r.is_empty())
            .collect();
    }
    normalized
}

fn outputs_names(meta_yaml: &Value) -> Vec<String> {
    let names: BTreeSet<String> = meta_yaml
        .get("outputs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|o| o.get("name").and_then(scalar_string))
        .collect();
    names.into_iter().collect()
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(other) => vec![other],
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
