// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Run command - drives the registered migrations over the graph

use super::{load_graph, print_json};
use crate::config::Config;
use crate::github::GitHubClient;
use crate::host::HostingService;
use crate::migrators::MigratorRegistry;
use crate::pipeline::{DefaultBodyGenerator, Pipeline, PipelineOptions};
use crate::render::{HttpSourceHasher, ShellRenderer, ShellSolvabilityChecker};
use crate::scheduler::{Scheduler, SchedulerOptions};
use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Run the migration driver
pub fn run(config: &Config, json: bool) -> Result<()> {
    if !crate::git::git_available() {
        bail!("git is required to run migrations");
    }
    if !config.dry_run && config.github_token.is_none() {
        bail!("A GitHub token is needed to publish; set GITHUB_TOKEN or use --dry-run");
    }

    let mut graph = load_graph(config)?;
    if graph.is_empty() {
        bail!("The graph is empty; run `feedstock-tick graph` first");
    }

    let client = GitHubClient::from_config(config)?;
    let registry = MigratorRegistry::default_for(config, Arc::new(HttpSourceHasher::new()?))?;

    let mut renderer = ShellRenderer::new(&config.render_command, Duration::from_secs(config.render_timeout_secs));
    if config.render_command.starts_with("conda smithy") {
        renderer = renderer
            .with_version_command("conda smithy --version")
            .with_pinning_command("conda list conda-forge-pinning --json");
    }
    let checker = ShellSolvabilityChecker::new(
        config.solvability_command.clone(),
        Duration::from_secs(config.solvability_timeout_secs),
    );
    let pipeline = Pipeline::new(
        &client,
        &renderer,
        &checker,
        &DefaultBodyGenerator,
        PipelineOptions {
            work_dir: config.work_dir.clone(),
            organization: config.organization.clone(),
            default_branch: config.default_branch.clone(),
            fork: config.fork,
            dry_run: config.dry_run,
            git_user_name: config.git_user_name.clone(),
            git_user_email: config.git_user_email.clone(),
        },
    );

    info!(
        "Running {} migrators over {} nodes{}",
        registry.len(),
        graph.node_count(),
        if config.dry_run { " (dry run)" } else { "" }
    );
    let scheduler = Scheduler::new(SchedulerOptions {
        timeout: Duration::from_secs(config.timeout_secs),
        dry_run: config.dry_run,
    });
    let host: Option<&dyn HostingService> = if config.github_token.is_some() {
        Some(&client)
    } else {
        None
    };
    let report = scheduler.run(&mut graph, &registry, &pipeline, host)?;

    if json {
        return print_json(&report);
    }

    for m in &report.migrators {
        println!(
            "{}: {} eligible, {} attempted, {} succeeded, {} duplicate, {} failed, {} errored, {} archived ({})",
            m.name.bold(),
            m.eligible,
            m.attempted,
            m.succeeded.green(),
            m.duplicate,
            m.failed.yellow(),
            m.errored.red(),
            m.archived,
            m.stop.map(|s| s.to_string()).unwrap_or_default()
        );
    }
    if let Some(reason) = report.aborted {
        println!("{} {reason}", "Run stopped early:".red());
    }
    Ok(())
}
