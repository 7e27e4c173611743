// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Clean command - removes scratch working copies left in the work directory

use crate::config::Config;
use anyhow::{Context, Result};
use std::fs;
use walkdir::WalkDir;

/// Run the clean command
pub fn run(config: &Config, dry_run: bool) -> Result<()> {
    let work_dir = &config.work_dir;
    if !work_dir.exists() {
        println!("Nothing to clean in {}", work_dir.display());
        return Ok(());
    }

    let mut removed = 0;
    for entry in WalkDir::new(work_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read {}", work_dir.display()))?;
        let path = entry.path();
        if dry_run {
            println!("Would remove {}", path.display());
        } else if entry.file_type().is_dir() {
            fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        removed += 1;
    }

    println!(
        "{} {removed} entries in {}",
        if dry_run { "Would remove" } else { "Removed" },
        work_dir.display()
    );
    Ok(())
}
