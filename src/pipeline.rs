// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Per-package migration pipeline
//!
//! Clone → piggy-backs and primary edit → commit → re-render → classify the
//! diff → solvability gate → publish. The working copy lives in a `TempDir`
//! under the work directory and is removed on every exit path.

use crate::error::{HostError, PipelineError};
use crate::git;
use crate::host::{feedstock_repo, HostingService, PullRequestSpec};
use crate::migrators::{MigrateOutcome, Migrator, Phase};
use crate::render::{Renderer, SolvabilityChecker};
use crate::types::{MigrationUid, NodeAttrs, PrRecord};
use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Paths whose changes alone do not count as a real diff
pub const BOOKKEEPING_PATTERNS: [&str; 4] = ["recipe/**", ".ci_support/migrations/**", "migrators/**", "README*"];

/// Settings the pipeline needs from configuration
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Scratch working copies go under here
    pub work_dir: PathBuf,
    /// Organization owning the feedstocks
    pub organization: String,
    /// Branch pull requests target
    pub default_branch: String,
    /// Push to a fork instead of the organization repository
    pub fork: bool,
    /// Stop before publishing
    pub dry_run: bool,
    /// Commit author name
    pub git_user_name: String,
    /// Commit author email
    pub git_user_email: String,
}

/// Why an attempt ended without a pull request or record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The feedstock could not be cloned
    CheckoutFailed,
    /// The migrator found nothing to change
    NoChange,
    /// The re-render tool failed or timed out
    RenderFailed,
    /// The migrated recipe cannot be solved
    Unsolvable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CheckoutFailed => "checkout failed",
            Self::NoChange => "no change",
            Self::RenderFailed => "render failed",
            Self::Unsolvable => "not solvable",
        };
        f.write_str(text)
    }
}

/// Terminal state of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A pull request was opened
    Published {
        /// Fingerprint of the migration
        uid: MigrationUid,
        /// The opened pull request
        pr: PrRecord,
    },
    /// Work done but no pull request opened (dry-run or an existing one)
    NoPullRequest {
        /// Fingerprint of the migration
        uid: MigrationUid,
    },
    /// Only bookkeeping files changed; recorded as closed
    SpoofedClosed {
        /// Fingerprint of the migration
        uid: MigrationUid,
    },
    /// Nothing to record
    Failed(FailureReason),
}

impl PipelineOutcome {
    /// Fingerprint to record, absent for failures
    #[must_use]
    pub fn uid(&self) -> Option<&MigrationUid> {
        match self {
            Self::Published { uid, .. } | Self::NoPullRequest { uid } | Self::SpoofedClosed { uid } => Some(uid),
            Self::Failed(_) => None,
        }
    }
}

/// Runs one migration on one package
pub trait MigrationRunner {
    /// Run `migrator` against the package described by `attrs`
    fn run(&self, migrator: &dyn Migrator, attrs: &NodeAttrs) -> Result<PipelineOutcome, PipelineError>;

    /// Version of the render tool, recorded on success
    fn tool_version(&self) -> Option<String> {
        None
    }

    /// Version of the pinning set renders resolve against, recorded on success
    fn pinning_version(&self) -> Option<String> {
        None
    }
}

/// Produces pull request body text
pub trait BodyGenerator {
    /// Full body for a pull request opened by `migrator` on `attrs`
    fn body(&self, migrator: &dyn Migrator, attrs: &NodeAttrs) -> String;
}

/// Migrator text, a footer, and the fingerprint in a hidden comment
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBodyGenerator;

impl BodyGenerator for DefaultBodyGenerator {
    fn body(&self, migrator: &dyn Migrator, attrs: &NodeAttrs) -> String {
        let uid = serde_json::to_string(&migrator.migrator_uid(attrs)).unwrap_or_default();
        format!(
            "{}\n\n---\n\nThis pull request was opened automatically by feedstock-tick. \
             Close it or leave a comment if something looks wrong.\n\n<!-- {uid} -->\n",
            migrator.pr_body(attrs).trim_end()
        )
    }
}

/// Whether any of `paths` lies outside the bookkeeping patterns
pub fn has_real_diff(paths: &[String]) -> anyhow::Result<bool> {
    let bookkeeping = bookkeeping_set()?;
    Ok(paths.iter().any(|p| !bookkeeping.is_match(p)))
}

fn bookkeeping_set() -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in BOOKKEEPING_PATTERNS {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?);
    }
    builder.build().context("Failed to build bookkeeping globs")
}

/// Production [`MigrationRunner`]
pub struct Pipeline<'a> {
    host: &'a dyn HostingService,
    renderer: &'a dyn Renderer,
    checker: &'a dyn SolvabilityChecker,
    bodies: &'a dyn BodyGenerator,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    /// Wire the pipeline to its collaborators
    #[must_use]
    pub fn new(
        host: &'a dyn HostingService,
        renderer: &'a dyn Renderer,
        checker: &'a dyn SolvabilityChecker,
        bodies: &'a dyn BodyGenerator,
        options: PipelineOptions,
    ) -> Self {
        Self {
            host,
            renderer,
            checker,
            bodies,
            options,
        }
    }

    fn run_piggy_backs(&self, migrator: &dyn Migrator, phase: Phase, dir: &Path) -> anyhow::Result<()> {
        for mini in migrator.piggy_backs().iter().filter(|m| m.phase() == phase) {
            if mini.migrate(dir).with_context(|| format!("{} failed", mini.name()))? {
                tracing::debug!("{} changed the recipe", mini.name());
            }
        }
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str) -> anyhow::Result<bool> {
        git::commit_all(dir, message, &self.options.git_user_name, &self.options.git_user_email)
    }

    fn publish(
        &self,
        migrator: &dyn Migrator,
        attrs: &NodeAttrs,
        dir: &Path,
        branch: &str,
        uid: MigrationUid,
    ) -> Result<PipelineOutcome, PipelineError> {
        let org = &self.options.organization;
        let repo = feedstock_repo(&attrs.feedstock_name);
        let owner = if self.options.fork {
            self.host.ensure_fork(org, &repo)?
        } else {
            org.clone()
        };
        self.host.push_branch(dir, &owner, &repo, branch)?;

        let spec = PullRequestSpec {
            organization: org.clone(),
            repo,
            head: format!("{owner}:{branch}"),
            base: self.options.default_branch.clone(),
            title: migrator.pr_title(attrs),
            body: self.bodies.body(migrator, attrs),
        };
        match self.host.create_pull_request(&spec) {
            Ok(pr) => Ok(PipelineOutcome::Published { uid, pr }),
            Err(HostError::ValidationConflict(message)) => {
                tracing::warn!("{}: pull request not opened: {message}", attrs.feedstock_name);
                Ok(PipelineOutcome::NoPullRequest { uid })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl MigrationRunner for Pipeline<'_> {
    fn run(&self, migrator: &dyn Migrator, attrs: &NodeAttrs) -> Result<PipelineOutcome, PipelineError> {
        let name = &attrs.feedstock_name;
        let repo = feedstock_repo(name);

        fs::create_dir_all(&self.options.work_dir)?;
        let scratch = TempDir::new_in(&self.options.work_dir)?;
        let dir = scratch.path().join(&repo);

        let url = self.host.clone_url(&self.options.organization, &repo);
        if let Err(err) = git::clone(&url, &self.options.default_branch, &dir) {
            tracing::warn!("{name}: {err:#}");
            return Ok(PipelineOutcome::Failed(FailureReason::CheckoutFailed));
        }
        let base = git::head_commit(&dir)?;
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
        let branch = format!("{}_h{suffix}", migrator.remote_branch(attrs));
        git::checkout_new_branch(&dir, &branch)?;

        self.run_piggy_backs(migrator, Phase::Pre, &dir)?;
        if let MigrateOutcome::NoChange(reason) = migrator.migrate(&dir, attrs)? {
            tracing::info!("{name}: {} made no change: {reason}", migrator.name());
            return Ok(PipelineOutcome::Failed(FailureReason::NoChange));
        }
        self.run_piggy_backs(migrator, Phase::Post, &dir)?;
        self.commit(&dir, &migrator.commit_message(attrs))?;

        let rendered = match self.renderer.render(&dir) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::warn!("{name}: could not run the re-render tool: {err:#}");
                return Ok(PipelineOutcome::Failed(FailureReason::RenderFailed));
            }
        };
        if !rendered.success {
            tracing::warn!(
                "{name}: re-render failed{}: {}",
                if rendered.timed_out { " (timed out)" } else { "" },
                rendered.stderr.trim()
            );
            return Ok(PipelineOutcome::Failed(FailureReason::RenderFailed));
        }
        self.commit(&dir, "MNT: Re-rendered")?;

        let uid = migrator.migrator_uid(attrs);
        let changed = git::changed_files(&dir, &base)?;
        if migrator.requires_real_diff() && !has_real_diff(&changed)? {
            tracing::info!("{name}: only bookkeeping files changed");
            return Ok(PipelineOutcome::SpoofedClosed { uid });
        }

        if attrs.recipe.check_solvable() && !self.checker.is_solvable(&dir)? {
            return Ok(PipelineOutcome::Failed(FailureReason::Unsolvable));
        }

        if self.options.dry_run {
            tracing::info!("{name}: dry run, would push {branch}");
            return Ok(PipelineOutcome::NoPullRequest { uid });
        }
        self.publish(migrator, attrs, &dir, &branch, uid)
    }

    fn tool_version(&self) -> Option<String> {
        self.renderer.tool_version()
    }

    fn pinning_version(&self) -> Option<String> {
        self.renderer.pinning_version()
    }
}
