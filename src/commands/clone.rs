// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Clone command - local copies of every feedstock of the organization

use super::print_json;
use crate::config::Config;
use crate::discovery::{get_all_feedstocks, read_names};
use crate::git;
use crate::github::GitHubClient;
use crate::host::{feedstock_repo, HostingService};
use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// What a clone pass did
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CloneReport {
    /// Freshly cloned feedstocks
    pub cloned: Vec<String>,
    /// Feedstocks that already had a local copy
    pub skipped: Vec<String>,
    /// Feedstocks whose clone failed
    pub failed: Vec<String>,
}

/// Clone each of `names` from `host` into `feedstocks_dir`, skipping existing copies
pub fn clone_all(
    host: &dyn HostingService,
    organization: &str,
    branch: &str,
    names: &[String],
    feedstocks_dir: &Path,
) -> Result<CloneReport> {
    fs::create_dir_all(feedstocks_dir).with_context(|| format!("Failed to create {}", feedstocks_dir.display()))?;
    let mut report = CloneReport::default();
    for name in names {
        let repo = feedstock_repo(name);
        let dest = feedstocks_dir.join(&repo);
        if dest.exists() {
            report.skipped.push(name.clone());
            continue;
        }
        match git::clone(&host.clone_url(organization, &repo), branch, &dest) {
            Ok(()) => {
                info!("Cloned {repo}");
                report.cloned.push(name.clone());
            }
            Err(err) => {
                warn!("{name}: {err:#}");
                report.failed.push(name.clone());
            }
        }
    }
    Ok(report)
}

/// Run the clone command
pub fn run(config: &Config, json: bool) -> Result<()> {
    if !git::git_available() {
        bail!("git is required to clone feedstocks");
    }
    let client = GitHubClient::from_config(config)?;
    let mut names = read_names(&config.data_dir)?;
    if names.is_empty() {
        info!("No cached names, listing {}", config.organization);
        names = get_all_feedstocks(&client, &config.organization, &config.data_dir, false)?.names;
    }

    let target = config.feedstocks_dir();
    info!("Cloning {} feedstocks from {} into {}", names.len(), config.organization, target.display());
    let report = clone_all(&client, &config.organization, &config.default_branch, &names, &target)?;

    if json {
        return print_json(&report);
    }
    println!(
        "Cloned {}, skipped {}, failed {} into {}",
        report.cloned.len().green(),
        report.skipped.len(),
        report.failed.len().red(),
        target.display()
    );
    for name in &report.failed {
        eprintln!("  Warning: cloning {name} failed");
    }
    Ok(())
}
