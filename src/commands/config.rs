// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Config command - prints the effective configuration

use crate::config::Config;
use anyhow::{Context, Result};

/// Print the effective configuration, or one key of it
pub fn run(config: &Config, key: Option<&str>) -> Result<()> {
    match key {
        Some(key) => println!("{}", config.get(key)?),
        None => print!(
            "{}",
            toml::to_string_pretty(&config.redacted()).context("Failed to serialize config")?
        ),
    }
    Ok(())
}
