// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//
//! feedstock-tick library - dependency graph and migration driver for a
//! feedstock organization
//!
//! This crate discovers the feedstocks of an organization, builds a
//! dependency graph from their recipes, and drives bounded waves of
//! automated migrations (version bumps, pinning rebuilds) across them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod github;
pub mod graph;
pub mod host;
pub mod migrators;
pub mod pipeline;
pub mod prs;
pub mod recipe;
pub mod render;
pub mod scheduler;

/// Core data types persisted in the node attribute files
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, BTreeSet};

    // =========================================================================
    // Requirements
    // =========================================================================

    /// Recipe requirement sections
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Section {
        /// Build-machine tooling
        Build,
        /// Target-prefix libraries linked at build time
        Host,
        /// Runtime dependencies
        Run,
        /// Test-time dependencies
        Test,
    }

    impl Section {
        /// All sections in recipe order
        pub const ALL: [Self; 4] = [Self::Build, Self::Host, Self::Run, Self::Test];

        /// The recipe key for this section
        #[must_use]
        pub fn key(self) -> &'static str {
            match self {
                Self::Build => "build",
                Self::Host => "host",
                Self::Run => "run",
                Self::Test => "test",
            }
        }
    }

    /// Requirement names grouped by section
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Requirements {
        /// Build requirements
        #[serde(default)]
        pub build: BTreeSet<String>,
        /// Host requirements
        #[serde(default)]
        pub host: BTreeSet<String>,
        /// Run requirements
        #[serde(default)]
        pub run: BTreeSet<String>,
        /// Test requirements
        #[serde(default)]
        pub test: BTreeSet<String>,
    }

    impl Requirements {
        /// Borrow one section
        #[must_use]
        pub fn section(&self, section: Section) -> &BTreeSet<String> {
            match section {
                Section::Build => &self.build,
                Section::Host => &self.host,
                Section::Run => &self.run,
                Section::Test => &self.test,
            }
        }

        /// Mutably borrow one section
        pub fn section_mut(&mut self, section: Section) -> &mut BTreeSet<String> {
            match section {
                Section::Build => &mut self.build,
                Section::Host => &mut self.host,
                Section::Run => &mut self.run,
                Section::Test => &mut self.test,
            }
        }

        /// Union of every section
        #[must_use]
        pub fn all(&self) -> BTreeSet<&str> {
            Section::ALL
                .iter()
                .flat_map(|s| self.section(*s).iter().map(String::as_str))
                .collect()
        }

        /// True when no section has any entry
        #[must_use]
        pub fn is_empty(&self) -> bool {
            Section::ALL.iter().all(|s| self.section(*s).is_empty())
        }
    }

    // =========================================================================
    // Bad marker
    // =========================================================================

    /// Structured description of an exception raised while migrating a node
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExceptionReport {
        /// Error summary, including its cause chain
        pub exception: String,
        /// HTTP status code, when the failure came from a remote call
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub code: Option<u16>,
        /// Remote URL involved in the failure
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
    }

    /// Why a node's metadata is unusable.
    ///
    /// Persisted as `false`, a reason string, or an exception object.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub enum BadMarker {
        /// Metadata is usable
        #[default]
        Clean,
        /// Metadata could not be fetched or parsed
        Reason(String),
        /// A migration attempt raised an error
        Exception(ExceptionReport),
    }

    impl BadMarker {
        /// True for any marker other than [`BadMarker::Clean`]
        #[must_use]
        pub fn is_bad(&self) -> bool {
            !matches!(self, Self::Clean)
        }
    }

    impl Serialize for BadMarker {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Self::Clean => serializer.serialize_bool(false),
                Self::Reason(reason) => serializer.serialize_str(reason),
                Self::Exception(report) => report.serialize(serializer),
            }
        }
    }

    impl<'de> Deserialize<'de> for BadMarker {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Repr {
                Flag(bool),
                Reason(String),
                Exception(ExceptionReport),
            }

            Ok(match Repr::deserialize(deserializer)? {
                Repr::Flag(false) => Self::Clean,
                Repr::Flag(true) => Self::Reason("bad".into()),
                Repr::Reason(reason) => Self::Reason(reason),
                Repr::Exception(report) => Self::Exception(report),
            })
        }
    }

    // =========================================================================
    // Pull requests and migration attempts
    // =========================================================================

    /// Pull request lifecycle state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PrState {
        /// Open for review
        Open,
        /// Closed without merge
        Closed,
        /// Merged
        Merged,
    }

    /// Head ref recorded when no real pull request exists
    pub const SYNTHETIC_HEAD_REF: &str = "<this_is_not_a_branch>";

    /// Reference to a pull request on the hosting service
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PrRecord {
        /// Hosting-service identifier
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub id: Option<u64>,
        /// Pull request number within the repository
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub number: Option<u64>,
        /// Web URL
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub html_url: Option<String>,
        /// Current state
        pub state: PrState,
        /// Head branch
        pub head_ref: String,
        /// Label names
        #[serde(default)]
        pub labels: Vec<String>,
    }

    impl PrRecord {
        /// Closed record for attempts that needed no real pull request
        #[must_use]
        pub fn synthetic_closed() -> Self {
            Self {
                id: None,
                number: None,
                html_url: None,
                state: PrState::Closed,
                head_ref: SYNTHETIC_HEAD_REF.into(),
                labels: Vec::new(),
            }
        }

        /// True while the pull request is open
        #[must_use]
        pub fn is_open(&self) -> bool {
            self.state == PrState::Open
        }
    }

    /// Fingerprint of one migration applied to one node.
    ///
    /// Two attempts are the same work exactly when their fingerprints are equal.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MigrationUid {
        /// Migrator name
        pub migrator_name: String,
        /// Migrator revision
        #[serde(default)]
        pub migrator_version: u32,
        /// Target version for version migrations
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,
        /// Migration name for pinning migrations
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        /// Unix timestamp set when a `bot-rerun` label was processed
        #[serde(default)]
        pub bot_rerun: Option<i64>,
    }

    /// One recorded migration attempt
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MigrationAttempt {
        /// Mutation fingerprint
        pub data: MigrationUid,
        /// Resulting pull request (or a synthetic closed record)
        #[serde(rename = "PR")]
        pub pr: PrRecord,
        /// When the attempt was recorded
        pub recorded_at: DateTime<Utc>,
    }

    // =========================================================================
    // Node attributes
    // =========================================================================

    /// Attributes extracted from a feedstock's recipe files
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct RecipeAttrs {
        /// Unrendered recipe text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub raw_meta_yaml: Option<String>,
        /// Recipe merged across platforms
        #[serde(default)]
        pub meta_yaml: serde_json::Value,
        /// Whitelisted subset of the feedstock configuration file
        #[serde(default)]
        pub conda_forge_yml: serde_json::Map<String, serde_json::Value>,
        /// Whether any block declares strong run exports
        #[serde(default)]
        pub strong_exports: bool,
        /// Requirement strings as written in the recipe
        #[serde(default)]
        pub total_requirements: Requirements,
        /// Normalized requirement names
        #[serde(default)]
        pub requirements: Requirements,
        /// Names of the recipe's outputs
        #[serde(default)]
        pub outputs_names: Vec<String>,
        /// Package name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        /// Package version
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,
        /// First source URL
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub url: Option<String>,
        /// Source checksum algorithm
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub hash_type: Option<String>,
    }

    impl RecipeAttrs {
        /// Whether the feedstock's bot policy asks for a solvability check
        #[must_use]
        pub fn check_solvable(&self) -> bool {
            self.conda_forge_yml
                .get("bot")
                .and_then(|bot| bot.get("check_solvable"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        }
    }

    /// Everything persisted for one graph node
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct NodeAttrs {
        /// Feedstock name without the `-feedstock` suffix
        pub feedstock_name: String,
        /// Unusable-metadata marker
        #[serde(default)]
        pub bad: BadMarker,
        /// Repository is archived, or the node is an external stub
        #[serde(default)]
        pub archived: bool,
        /// Recipe attributes
        #[serde(default)]
        pub recipe: RecipeAttrs,
        /// When recipe attributes were last fetched
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub last_fetched: Option<DateTime<Utc>>,
        /// Newest upstream version known for the package
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub new_version: Option<String>,
        /// Version migration attempts per target version
        #[serde(default)]
        pub new_version_attempts: BTreeMap<String, u32>,
        /// Recorded migration attempts, oldest first
        #[serde(default, rename = "PRed")]
        pub migration_history: Vec<MigrationAttempt>,
        /// Render tool version used by the last successful attempt
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tool_version: Option<String>,
        /// Pinning set version used by the last successful attempt
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub pinning_version: Option<String>,
    }

    impl NodeAttrs {
        /// Fresh attributes for a named node
        #[must_use]
        pub fn new(feedstock_name: &str) -> Self {
            Self {
                feedstock_name: feedstock_name.into(),
                bad: BadMarker::Clean,
                archived: false,
                recipe: RecipeAttrs::default(),
                last_fetched: None,
                new_version: None,
                new_version_attempts: BTreeMap::new(),
                migration_history: Vec::new(),
                tool_version: None,
                pinning_version: None,
            }
        }

        /// Placeholder for a dependency that is not a feedstock
        #[must_use]
        pub fn stub(name: &str) -> Self {
            Self {
                archived: true,
                ..Self::new(name)
            }
        }

        /// Node whose metadata could not be obtained
        #[must_use]
        pub fn bad(name: &str, reason: impl Into<String>) -> Self {
            Self {
                bad: BadMarker::Reason(reason.into()),
                ..Self::new(name)
            }
        }

        /// True when the node may take part in migrations at all
        #[must_use]
        pub fn is_migratable(&self) -> bool {
            !self.bad.is_bad() && !self.archived
        }

        /// True when an attempt with this fingerprint was already recorded
        #[must_use]
        pub fn has_attempt(&self, uid: &MigrationUid) -> bool {
            self.migration_history.iter().any(|a| &a.data == uid)
        }

        /// Record a migration attempt.
        ///
        /// Returns `false` without recording when the fingerprint is already
        /// present. A new open pull request supersedes older open ones of the
        /// same migrator, which are marked closed.
        pub fn record_attempt(&mut self, uid: MigrationUid, pr: PrRecord) -> bool {
            if self.has_attempt(&uid) {
                return false;
            }
            if pr.is_open() {
                for older in &mut self.migration_history {
                    if older.data.migrator_name == uid.migrator_name && older.pr.is_open() {
                        older.pr.state = PrState::Closed;
                    }
                }
            }
            self.migration_history.push(MigrationAttempt {
                data: uid,
                pr,
                recorded_at: Utc::now(),
            });
            true
        }

        /// Take freshly fetched recipe attributes, keeping migration state.
        ///
        /// A bad fetch only records the marker; the previous recipe stays so
        /// edges and outputs survive a transient host failure. `archived` is
        /// owned by the host listing and left alone.
        pub fn absorb_fetch(&mut self, fetched: NodeAttrs) {
            self.bad = fetched.bad;
            self.last_fetched = fetched.last_fetched;
            if !self.bad.is_bad() {
                self.recipe = fetched.recipe;
            }
        }
    }
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::types::*;
    pub use anyhow::{Context, Result};
}
