// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! `FEEDSTOCK_TICK_*` environment variables. CLI flags are applied on top by
//! the binary. Library code receives a finished [`Config`] and never reads
//! the environment itself.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FEEDSTOCK_TICK";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding graph.json, node_attrs/, names.txt, versions/
    pub data_dir: PathBuf,
    /// Scratch space for working copies
    pub work_dir: PathBuf,
    /// Migration definition directory (defaults to `<data_dir>/migrations`)
    pub migrations_dir: Option<PathBuf>,
    /// Local clones of every feedstock (defaults to `<data_dir>/feedstocks`)
    pub feedstocks_dir: Option<PathBuf>,
    /// Organization owning the feedstocks
    pub organization: String,
    /// Branch recipes are read from and PRs target
    pub default_branch: String,
    /// Hosting API root
    pub api_url: String,
    /// Raw file root
    pub raw_url: String,
    /// Account the bot acts as
    pub github_username: Option<String>,
    /// API token
    pub github_token: Option<String>,
    /// Push to a fork of each feedstock instead of the feedstock itself
    pub fork: bool,
    /// Run the pipeline without publishing or persisting
    pub dry_run: bool,
    /// Wall-clock budget for one run, in seconds
    pub timeout_secs: u64,
    /// Width of the fetch worker pool
    pub max_workers: usize,
    /// Fetch in the coordinator thread
    pub sequential: bool,
    /// Base PR limit per migrator per run
    pub pr_limit: usize,
    /// Shell command that re-renders a feedstock
    pub render_command: String,
    /// Re-render time bound, in seconds
    pub render_timeout_secs: u64,
    /// Shell command that checks a recipe is solvable; none means always solvable
    pub solvability_command: Option<String>,
    /// Solvability check time bound, in seconds
    pub solvability_timeout_secs: u64,
    /// Commit author name
    pub git_user_name: String,
    /// Commit author email
    pub git_user_email: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let dirs = directories::ProjectDirs::from("com", "hyperpolymath", "feedstock-tick");
        Self {
            data_dir: dirs
                .as_ref()
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("~/.local/share/feedstock-tick")),
            work_dir: dirs
                .as_ref()
                .map(|d| d.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("~/.cache/feedstock-tick")),
            migrations_dir: None,
            feedstocks_dir: None,
            organization: "conda-forge".to_string(),
            default_branch: "master".to_string(),
            api_url: "https://api.github.com".to_string(),
            raw_url: "https://raw.githubusercontent.com".to_string(),
            github_username: None,
            github_token: None,
            fork: true,
            dry_run: false,
            timeout_secs: 600,
            max_workers: crate::builder::DEFAULT_MAX_WORKERS,
            sequential: false,
            pr_limit: 5,
            render_command: "conda smithy rerender --no-check-uptodate --commit auto".to_string(),
            render_timeout_secs: 900,
            solvability_command: None,
            solvability_timeout_secs: 300,
            git_user_name: "feedstock-tick".to_string(),
            git_user_email: "feedstock-tick@users.noreply.github.com".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Directory of ingested upstream version candidates
    #[must_use]
    pub fn versions_dir(&self) -> PathBuf {
        self.data_dir.join("versions")
    }

    /// Directory of pinning migration definitions
    #[must_use]
    pub fn migrations_dir(&self) -> PathBuf {
        self.migrations_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("migrations"))
    }

    /// Directory `clone` fills with local feedstock copies
    #[must_use]
    pub fn feedstocks_dir(&self) -> PathBuf {
        self.feedstocks_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("feedstocks"))
    }

    /// Copy safe to print: the token is masked
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if shown.github_token.is_some() {
            shown.github_token = Some("********".to_string());
        }
        shown
    }

    /// Look up one key of the printable form
    pub fn get(&self, key: &str) -> Result<String> {
        let value = toml::Value::try_from(self.redacted()).context("Failed to serialize config")?;
        let entry = value
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Unknown config key: {key}"))?;
        Ok(match entry {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Load configuration: defaults, then `path` (if given), then environment
pub fn load(path: Option<&Path>) -> Result<Config> {
    let defaults = config::Config::try_from(&Config::default())
        .context("Failed to build default configuration")?;

    let mut builder = config::Config::builder().add_source(defaults);
    if let Some(path) = path {
        builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(true),
        );
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.max_workers, 20);
        assert_eq!(config.pr_limit, 5);
        assert_eq!(config.default_branch, "master");
        assert_eq!(config.migrations_dir(), config.data_dir.join("migrations"));
        assert_eq!(config.feedstocks_dir(), config.data_dir.join("feedstocks"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tick.toml");
        fs::write(&path, "organization = \"nsls-ii-forge\"\npr_limit = 2\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.organization, "nsls-ii-forge");
        assert_eq!(config.pr_limit, 2);
        assert_eq!(config.render_timeout_secs, 900);
    }

    #[test]
    fn test_redacted_hides_token() {
        let config = Config {
            github_token: Some("ghp_secret".into()),
            ..Config::default()
        };
        assert_eq!(config.get("github_token").unwrap(), "********");
        assert_eq!(config.get("pr_limit").unwrap(), "5");
        assert!(config.get("nope").is_err());
    }
}
