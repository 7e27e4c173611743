// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! GitHub implementation of the hosting service
//!
//! REST calls go through a blocking `reqwest` client with bounded timeouts.
//! Pushes shell out to `git`; the token reaches it through a credential
//! helper configured in the child's environment, never on its command line.

use crate::config::Config;
use crate::error::HostError;
use crate::fetcher::{FileFetch, RawFileSource};
use crate::git;
use crate::host::{feedstock_repo, HostingService, PullRequestSpec, RateLimit, RepoSummary};
use crate::types::{PrRecord, PrState};
use anyhow::{Context, Result};
use chrono::DateTime;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// TCP connect bound
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Whole-request bound
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 120;

const PAGE_SIZE: usize = 100;

const GIT_USER_VAR: &str = "FEEDSTOCK_TICK_GIT_USER";
const GIT_TOKEN_VAR: &str = "FEEDSTOCK_TICK_GIT_TOKEN";

/// Answers git's credential query from the two variables above
const CREDENTIAL_HELPER: &str =
    "!f() { echo \"username=${FEEDSTOCK_TICK_GIT_USER}\"; echo \"password=${FEEDSTOCK_TICK_GIT_TOKEN}\"; }; f";

/// GitHub REST and raw-content client
pub struct GitHubClient {
    client: Client,
    api_url: String,
    raw_url: String,
    git_url: String,
    default_branch: String,
    username: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    name: String,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhHead {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    id: u64,
    number: u64,
    html_url: String,
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    head: GhHead,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

impl From<GhPull> for PrRecord {
    fn from(pull: GhPull) -> Self {
        let state = match (pull.state.as_str(), pull.merged_at) {
            (_, Some(_)) => PrState::Merged,
            ("open", None) => PrState::Open,
            _ => PrState::Closed,
        };
        Self {
            id: Some(pull.id),
            number: Some(pull.number),
            html_url: Some(pull.html_url),
            state,
            head_ref: pull.head.branch,
            labels: pull.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhFork {
    owner: GhOwner,
}

#[derive(Debug, Deserialize)]
struct GhRateResource {
    remaining: u64,
    reset: i64,
}

#[derive(Debug, Deserialize)]
struct GhRateResources {
    core: GhRateResource,
}

#[derive(Debug, Deserialize)]
struct GhRateLimit {
    resources: GhRateResources,
}

#[derive(Debug, Deserialize)]
struct GhMessage {
    #[serde(default)]
    message: String,
}

impl GitHubClient {
    /// Build a client from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.api_url,
            &config.raw_url,
            &config.default_branch,
            config.github_username.clone(),
            config.github_token.clone(),
        )
    }

    /// Build a client against explicit endpoints
    pub fn new(
        api_url: &str,
        raw_url: &str,
        default_branch: &str,
        username: Option<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("feedstock-tick/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            raw_url: raw_url.trim_end_matches('/').to_string(),
            git_url: "https://github.com".to_string(),
            default_branch: default_branch.to_string(),
            username,
            token,
        })
    }

    /// Override the root git remotes are built from
    #[must_use]
    pub fn with_git_url(mut self, git_url: &str) -> Self {
        self.git_url = git_url.trim_end_matches('/').to_string();
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("token {token}")),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, HostError> {
        let response = self.authorized(request).send()?;
        check_status(response)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, HostError> {
        let url = format!("{}{path}", self.api_url);
        let response = self.send(self.client.get(&url))?;
        Ok(response.json()?)
    }

    /// Environment for a pushing `git`: an empty helper resets any
    /// configured ones, then ours reads the credentials from the environment
    fn push_env(&self) -> Vec<(String, String)> {
        let (Some(user), Some(token)) = (&self.username, &self.token) else {
            return Vec::new();
        };
        [
            ("GIT_CONFIG_COUNT", "2"),
            ("GIT_CONFIG_KEY_0", "credential.helper"),
            ("GIT_CONFIG_VALUE_0", ""),
            ("GIT_CONFIG_KEY_1", "credential.helper"),
            ("GIT_CONFIG_VALUE_1", CREDENTIAL_HELPER),
            (GIT_USER_VAR, user.as_str()),
            (GIT_TOKEN_VAR, token.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "********"),
            _ => text.to_string(),
        }
    }
}

/// Map a non-success response onto the hosting error taxonomy
fn check_status(response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let remaining = header("x-ratelimit-remaining").and_then(|v| v.parse::<u64>().ok());
    let reset = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    let url = response.url().to_string();
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<GhMessage>(&text)
        .map(|m| m.message)
        .unwrap_or(text);

    Err(match status {
        StatusCode::NOT_FOUND => HostError::NotFound(url),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS if remaining == Some(0) => {
            HostError::RateLimited { reset }
        }
        _ if message.to_lowercase().contains("archived") => HostError::Archived(message),
        StatusCode::UNPROCESSABLE_ENTITY => HostError::ValidationConflict(message),
        other => HostError::Status {
            code: other.as_u16(),
            message,
        },
    })
}

impl RawFileSource for GitHubClient {
    fn fetch_raw(&self, organization: &str, feedstock: &str, path: &str) -> Result<FileFetch, HostError> {
        let url = format!(
            "{}/{organization}/{}/{}/{path}",
            self.raw_url,
            feedstock_repo(feedstock),
            self.default_branch
        );
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Ok(FileFetch::Status(status.as_u16()));
        }
        Ok(FileFetch::Found(response.text()?))
    }
}

impl HostingService for GitHubClient {
    fn list_repositories(&self, organization: &str) -> Result<Vec<RepoSummary>, HostError> {
        let mut repos = Vec::new();
        for page in 1.. {
            let batch: Vec<GhRepo> = self.get_json(&format!(
                "/orgs/{organization}/repos?per_page={PAGE_SIZE}&page={page}"
            ))?;
            let done = batch.len() < PAGE_SIZE;
            repos.extend(batch.into_iter().map(|r| RepoSummary {
                name: r.name,
                archived: r.archived,
            }));
            if done {
                break;
            }
        }
        tracing::debug!("Listed {} repositories of {organization}", repos.len());
        Ok(repos)
    }

    fn ensure_fork(&self, organization: &str, repo: &str) -> Result<String, HostError> {
        let url = format!("{}/repos/{organization}/{repo}/forks", self.api_url);
        let fork: GhFork = self.send(self.client.post(&url))?.json()?;
        Ok(fork.owner.login)
    }

    fn push_branch(&self, workdir: &Path, owner: &str, repo: &str, branch: &str) -> Result<(), HostError> {
        let remote = self.clone_url(owner, repo);
        let refspec = format!("HEAD:refs/heads/{branch}");
        git::run_git_checked_with_env(&["push", "--quiet", "--force", &remote, &refspec], workdir, &self.push_env())
            .map_err(|err| {
                let message = self.redact(&format!("{err:#}"));
                if message.contains("archived") {
                    HostError::Archived(format!("{owner}/{repo}"))
                } else {
                    HostError::Git(message)
                }
            })?;
        Ok(())
    }

    fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<PrRecord, HostError> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_url, spec.organization, spec.repo);
        let body = serde_json::json!({
            "title": spec.title,
            "body": spec.body,
            "head": spec.head,
            "base": spec.base,
        });
        let pull: GhPull = self.send(self.client.post(&url).json(&body))?.json()?;
        tracing::info!("Opened {}", pull.html_url);
        Ok(pull.into())
    }

    fn pull_request(&self, organization: &str, repo: &str, number: u64) -> Result<PrRecord, HostError> {
        let pull: GhPull = self.get_json(&format!("/repos/{organization}/{repo}/pulls/{number}"))?;
        Ok(pull.into())
    }

    fn rate_limit(&self) -> Result<RateLimit, HostError> {
        let limit: GhRateLimit = self.get_json("/rate_limit")?;
        Ok(RateLimit {
            remaining: limit.resources.core.remaining,
            reset: DateTime::from_timestamp(limit.resources.core.reset, 0),
        })
    }

    fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/{owner}/{repo}.git", self.git_url)
    }
}
