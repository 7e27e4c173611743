// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//
//! feedstock-tick CLI - dependency graph and migration driver for feedstocks

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use feedstock_tick::commands;
use feedstock_tick::config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feedstock-tick")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, env = "FEEDSTOCK_TICK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, env = "FEEDSTOCK_TICK_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// GitHub API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    github_token: Option<String>,

    /// GitHub account the bot acts as
    #[arg(long, env = "GITHUB_USERNAME", global = true)]
    github_username: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the organization's feedstocks into names.txt
    Names {
        /// Keep archived repositories
        #[arg(long)]
        include_archived: bool,
    },

    /// Fetch recipe attributes and rebuild the dependency graph
    Graph {
        /// Also refresh the state of open pull requests
        #[arg(long)]
        refresh_prs: bool,
    },

    /// Show dependencies or dependents of a feedstock
    Query {
        /// Feedstock name
        name: String,

        /// Which side to follow
        #[arg(long, value_enum, default_value = "depends-on")]
        direction: commands::query::Direction,
    },

    /// Print one attribute of a feedstock's recipe, e.g. "source url"
    Attr {
        /// Feedstock name
        name: String,

        /// Space-separated key path into the recipe
        attribute: String,

        /// Where to read the recipe from
        #[arg(long, value_enum, default_value = "graph")]
        source: commands::attr::RecipeSource,
    },

    /// Clone every feedstock into the feedstocks directory
    Clone {
        /// Target directory (defaults to <data_dir>/feedstocks)
        #[arg(short, long)]
        feedstocks_dir: Option<PathBuf>,
    },

    /// Run the migrations
    Run {
        /// Do everything except publish and persist
        #[arg(long)]
        dry_run: bool,

        /// Push to a fork of each feedstock
        #[arg(long, overrides_with = "no_fork")]
        fork: bool,

        /// Push to the feedstock itself
        #[arg(long, overrides_with = "fork")]
        no_fork: bool,

        /// Wall-clock budget in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Organization owning the feedstocks
        #[arg(long)]
        organization: Option<String>,
    },

    /// Summarize the persisted graph
    Status,

    /// Remove scratch working copies
    Clean {
        /// Only list what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the effective configuration
    Config {
        /// Single key to print
        key: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: clap_complete::Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 if cli.quiet => tracing::Level::ERROR,
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(token) = cli.github_token {
        config.github_token = Some(token);
    }
    if let Some(username) = cli.github_username {
        config.github_username = Some(username);
    }

    // Execute command
    match cli.command {
        Commands::Names { include_archived } => commands::names::run(&config, include_archived, cli.json),
        Commands::Graph { refresh_prs } => commands::graph::run(&config, refresh_prs, cli.json),
        Commands::Query { name, direction } => commands::query::run(&config, &name, direction, cli.json),
        Commands::Attr { name, attribute, source } => {
            commands::attr::run(&config, &name, &attribute, source, cli.json)
        }
        Commands::Clone { feedstocks_dir } => {
            if let Some(dir) = feedstocks_dir {
                config.feedstocks_dir = Some(dir);
            }
            commands::clone::run(&config, cli.json)
        }
        Commands::Run {
            dry_run,
            fork,
            no_fork,
            timeout,
            organization,
        } => {
            config.dry_run |= dry_run;
            if fork {
                config.fork = true;
            } else if no_fork {
                config.fork = false;
            }
            if let Some(timeout) = timeout {
                config.timeout_secs = timeout;
            }
            if let Some(organization) = organization {
                config.organization = organization;
            }
            commands::run::run(&config, cli.json)
        }
        Commands::Status => commands::status::run(&config, cli.json),
        Commands::Clean { dry_run } => commands::clean::run(&config, dry_run),
        Commands::Config { key } => commands::config::run(&config, key.as_deref()),
        Commands::Completions { shell } => commands::completions::run(shell, &mut Cli::command()),
    }
}
