// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! The hosting service seam
//!
//! Everything the migration driver needs from the code host, as one trait.
//! [`crate::github::GitHubClient`] is the production implementation; tests
//! substitute in-memory fakes.

use crate::error::HostError;
use crate::fetcher::RawFileSource;
use crate::types::PrRecord;
use chrono::{DateTime, Utc};
use std::path::Path;

/// One repository of an organization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    /// Repository name
    pub name: String,
    /// Whether the repository is archived
    pub archived: bool,
}

/// Remaining API budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests left in the current window
    pub remaining: u64,
    /// When the window resets
    pub reset: Option<DateTime<Utc>>,
}

/// A pull request to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    /// Owner of the target repository
    pub organization: String,
    /// Target repository
    pub repo: String,
    /// Head in `owner:branch` form
    pub head: String,
    /// Base branch
    pub base: String,
    /// Title
    pub title: String,
    /// Body
    pub body: String,
}

/// Operations against the code host
pub trait HostingService: RawFileSource {
    /// Repositories of `organization`
    fn list_repositories(&self, organization: &str) -> Result<Vec<RepoSummary>, HostError>;

    /// Make sure the bot has a fork of `organization/repo`; returns the fork owner
    fn ensure_fork(&self, organization: &str, repo: &str) -> Result<String, HostError>;

    /// Push the current HEAD of `workdir` to `owner/repo` as `branch`
    fn push_branch(&self, workdir: &Path, owner: &str, repo: &str, branch: &str) -> Result<(), HostError>;

    /// Open a pull request
    fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<PrRecord, HostError>;

    /// Current state of a pull request
    fn pull_request(&self, organization: &str, repo: &str, number: u64) -> Result<PrRecord, HostError>;

    /// Remaining API budget
    fn rate_limit(&self) -> Result<RateLimit, HostError>;

    /// URL a working copy of `owner/repo` is cloned from
    fn clone_url(&self, owner: &str, repo: &str) -> String;
}

/// Repository name of a feedstock
#[must_use]
pub fn feedstock_repo(name: &str) -> String {
    format!("{name}-feedstock")
}
