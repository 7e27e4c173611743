// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Typed errors for the boundaries the scheduler has to classify
//!
//! Commands and most internals use `anyhow`. The types here exist where a
//! caller branches on the kind of failure: hosting errors decide whether a
//! run stops, a node is archived, or a node is marked bad.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures reported by the hosting service
#[derive(Debug, Error)]
pub enum HostError {
    /// Repository, file, or pull request does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// API budget is exhausted
    #[error("rate limit exhausted{}", reset.map(|r| format!(" until {r}")).unwrap_or_default())]
    RateLimited {
        /// When the budget resets, if the service said
        reset: Option<DateTime<Utc>>,
    },

    /// Repository is archived and read-only
    #[error("repository {0} is archived")]
    Archived(String),

    /// The request conflicts with existing state (e.g. a duplicate PR)
    #[error("validation failed: {0}")]
    ValidationConflict(String),

    /// Any other non-success status
    #[error("HTTP {code}: {message}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Response message
        message: String,
    },

    /// Connection or protocol failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A git operation against the remote failed
    #[error("git error: {0}")]
    Git(String),
}

impl HostError {
    /// HTTP status associated with this error, if any
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::RateLimited { .. } => Some(403),
            Self::ValidationConflict(_) => Some(422),
            Self::Status { code, .. } => Some(*code),
            Self::Archived(_) | Self::Transport(_) | Self::Git(_) => None,
        }
    }
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                code: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

/// Errors raised while running one migration on one package
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Hosting service failure
    #[error(transparent)]
    Host(#[from] HostError),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else (git, render, migrator)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// The hosting error at the root of this failure, if there is one
    #[must_use]
    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            Self::Host(err) => Some(err),
            Self::Other(err) => err.downcast_ref::<HostError>(),
            Self::Io(_) => None,
        }
    }
}

/// Failure to persist a node's attribute file
#[derive(Debug, Error)]
pub enum PersistError {
    /// Attribute file could not be read or parsed
    #[error("failed to load attributes of {name}: {cause:#}")]
    Load {
        /// Node name
        name: String,
        /// Underlying error
        cause: anyhow::Error,
    },

    /// Attribute file could not be written
    #[error("failed to write attributes of {name}: {cause:#}")]
    Write {
        /// Node name
        name: String,
        /// Underlying error
        cause: anyhow::Error,
    },

    /// No node with this name exists
    #[error("unknown node: {0}")]
    UnknownNode(String),
}
