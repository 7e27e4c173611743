// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Names command - lists the organization's feedstocks into names.txt

use super::print_json;
use crate::config::Config;
use crate::discovery::{get_all_feedstocks, NameSource};
use crate::github::GitHubClient;
use anyhow::Result;

/// Run the names command
pub fn run(config: &Config, include_archived: bool, json: bool) -> Result<()> {
    let client = GitHubClient::from_config(config)?;
    let discovery = get_all_feedstocks(&client, &config.organization, &config.data_dir, include_archived)?;
    let current = discovery.source == NameSource::Live;

    if json {
        return print_json(&serde_json::json!({
            "names": discovery.names,
            "current": current,
        }));
    }

    println!(
        "{} feedstocks in {}{}",
        discovery.names.len(),
        config.organization,
        if current { "" } else { " (cached, listing failed)" }
    );
    Ok(())
}
