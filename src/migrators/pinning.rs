// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Rebuilds against new pinnings, one migrator per migration file

use super::version::set_build_number;
use super::{meta_yaml_path, MigrateOutcome, Migrator};
use crate::types::{MigrationUid, NodeAttrs};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Top-level keys of a migration file that are not package pins
const NON_PACKAGE_KEYS: [&str; 3] = ["migrator_ts", "zip_keys", "pin_run_as_build"];

/// Rebuilds every feedstock whose host or build requirements name a pinned package
#[derive(Debug, Clone)]
pub struct PinningMigrator {
    name: String,
    migration_number: u32,
    pinned: BTreeSet<String>,
    yaml: String,
    pr_limit: usize,
}

impl PinningMigrator {
    /// Load a migration definition from a YAML file named after the migration
    pub fn from_file(path: &Path, pr_limit: usize) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .with_context(|| format!("Migration file has no name: {}", path.display()))?;
        let yaml = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&name, &yaml, pr_limit).with_context(|| format!("Failed to load migration {}", path.display()))
    }

    /// Build from migration YAML text
    pub fn from_yaml(name: &str, yaml: &str, pr_limit: usize) -> Result<Self> {
        let doc: serde_yaml::Mapping = serde_yaml::from_str(yaml).context("Migration file is not a mapping")?;
        let migration_number = doc
            .get("__migrator")
            .and_then(|m| m.get("migration_number"))
            .and_then(serde_yaml::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let pinned = doc
            .keys()
            .filter_map(serde_yaml::Value::as_str)
            .filter(|k| !k.starts_with("__") && !NON_PACKAGE_KEYS.contains(k))
            .map(|k| k.replace('_', "-"))
            .collect();

        Ok(Self {
            name: name.to_string(),
            migration_number,
            pinned,
            yaml: yaml.to_string(),
            pr_limit,
        })
    }

    /// Package names this migration re-pins
    #[must_use]
    pub fn pinned(&self) -> &BTreeSet<String> {
        &self.pinned
    }
}

impl Migrator for PinningMigrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn migrator_version(&self) -> u32 {
        self.migration_number
    }

    fn pr_limit(&self) -> usize {
        self.pr_limit
    }

    fn is_eligible(&self, attrs: &NodeAttrs) -> bool {
        let reqs = &attrs.recipe.requirements;
        let uses_pin = reqs
            .host
            .iter()
            .chain(&reqs.build)
            .any(|r| self.pinned.contains(r));
        uses_pin && !attrs.has_attempt(&self.migrator_uid(attrs))
    }

    fn migrate(&self, feedstock_dir: &Path, _attrs: &NodeAttrs) -> Result<MigrateOutcome> {
        let dir = feedstock_dir.join(".ci_support").join("migrations");
        let target = dir.join(format!("{}.yaml", self.name));
        if target.exists() && fs::read_to_string(&target).is_ok_and(|t| t == self.yaml) {
            return Ok(MigrateOutcome::NoChange(format!("{} already applied", self.name)));
        }
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        fs::write(&target, &self.yaml).with_context(|| format!("Failed to write {}", target.display()))?;

        let meta = meta_yaml_path(feedstock_dir);
        if meta.exists() {
            let text = fs::read_to_string(&meta).with_context(|| format!("Failed to read {}", meta.display()))?;
            fs::write(&meta, set_build_number(&text, |n| n + 1))
                .with_context(|| format!("Failed to write {}", meta.display()))?;
        }
        Ok(MigrateOutcome::Changed)
    }

    fn commit_message(&self, _attrs: &NodeAttrs) -> String {
        format!("Rebuild for {}", self.name)
    }

    fn pr_title(&self, _attrs: &NodeAttrs) -> String {
        format!("Rebuild for {}", self.name)
    }

    fn pr_body(&self, _attrs: &NodeAttrs) -> String {
        let pins: Vec<&str> = self.pinned.iter().map(String::as_str).collect();
        format!(
            "This feedstock is being rebuilt as part of the `{}` migration.\n\n\
             Pinnings updated: {}\n",
            self.name,
            pins.join(", ")
        )
    }

    fn remote_branch(&self, _attrs: &NodeAttrs) -> String {
        format!("rebuild-{}-{}", self.name, self.migration_number)
    }

    fn migrator_uid(&self, _attrs: &NodeAttrs) -> MigrationUid {
        MigrationUid {
            migrator_name: self.name.clone(),
            migrator_version: self.migration_number,
            version: None,
            name: Some(self.name.clone()),
            bot_rerun: None,
        }
    }

    fn requires_real_diff(&self) -> bool {
        true
    }
}
