// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Migration scheduler
//!
//! Walks each migrator's effective subgraph in its chosen order, enforcing
//! the global timeout, the migrator's time share, its pull request cap and
//! the hosting rate limit. Every processed node is persisted and the graph
//! checkpointed before moving on.

use crate::error::{HostError, PipelineError};
use crate::graph::DependencyGraph;
use crate::host::HostingService;
use crate::migrators::{effective_subgraph, Migrator, MigratorRegistry};
use crate::pipeline::{FailureReason, MigrationRunner, PipelineOutcome};
use crate::types::{BadMarker, ExceptionReport, NodeAttrs, PrRecord};
use anyhow::Result;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::time::{Duration, Instant};

/// Smallest time share handed to a migrator with eligible nodes
const MIN_MIGRATOR_SHARE: Duration = Duration::from_secs(1);

/// Scheduler settings
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Wall-clock bound for the whole run
    pub timeout: Duration,
    /// Run pipelines without persisting anything
    pub dry_run: bool,
}

/// Why a migrator's turn, or the whole run, ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every node was visited
    Exhausted,
    /// The migrator opened its maximum number of pull requests
    PrLimit,
    /// The migrator used up its time share
    MigratorBudget,
    /// The run's wall-clock bound was reached
    GlobalTimeout,
    /// The hosting API has no requests left
    RateLimited,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Exhausted => "exhausted",
            Self::PrLimit => "pr limit reached",
            Self::MigratorBudget => "time share used",
            Self::GlobalTimeout => "global timeout",
            Self::RateLimited => "rate limited",
        };
        f.write_str(text)
    }
}

/// Counters for one migrator's turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigratorReport {
    /// Migrator name
    pub name: String,
    /// Size of the effective subgraph at the start of the run
    pub eligible: usize,
    /// Nodes the pipeline ran on
    pub attempted: usize,
    /// New fingerprints recorded
    pub succeeded: usize,
    /// Fingerprints that were already recorded
    pub duplicate: usize,
    /// Pipeline failures, nothing recorded
    pub failed: usize,
    /// Errors recorded on the node as bad
    pub errored: usize,
    /// Nodes found archived
    pub archived: usize,
    /// Why the turn ended
    pub stop: Option<StopReason>,
}

impl MigratorReport {
    fn new(name: &str, eligible: usize) -> Self {
        Self {
            name: name.to_string(),
            eligible,
            attempted: 0,
            succeeded: 0,
            duplicate: 0,
            failed: 0,
            errored: 0,
            archived: 0,
            stop: None,
        }
    }
}

/// Result of a scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// One entry per migrator that got a turn
    pub migrators: Vec<MigratorReport>,
    /// Set when the whole run stopped early
    pub aborted: Option<StopReason>,
}

/// Split `total` across migrators in proportion to their subgraph sizes.
///
/// Every migrator with at least one node gets a nonzero share.
#[must_use]
pub fn compute_time_per_migrator(sizes: &[usize], total: Duration) -> Vec<Duration> {
    let sum: u128 = sizes.iter().map(|&s| s as u128).sum();
    sizes
        .iter()
        .map(|&size| {
            if size == 0 || sum == 0 {
                return Duration::ZERO;
            }
            let nanos = total.as_nanos() * size as u128 / sum;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)).max(MIN_MIGRATOR_SHARE)
        })
        .collect()
}

/// Tool versions stamped on nodes that record a new attempt
#[derive(Debug, Clone, Default)]
struct Stamp {
    tool_version: Option<String>,
    pinning_version: Option<String>,
}

/// Classified result of one node
enum NodeStep {
    Succeeded,
    Duplicate,
    Failed(FailureReason),
    Archived,
    Errored,
    RateLimited,
}

/// Drives the registry's migrators over the graph
pub struct Scheduler {
    options: SchedulerOptions,
}

impl Scheduler {
    /// Scheduler with the given bounds
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    /// Run every migrator in registry order.
    ///
    /// `host` is consulted for the rate limit before each node when given.
    pub fn run(
        &self,
        graph: &mut DependencyGraph,
        registry: &MigratorRegistry,
        runner: &dyn MigrationRunner,
        host: Option<&dyn HostingService>,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let mut subgraphs = Vec::with_capacity(registry.len());
        for migrator in registry.migrators() {
            let subgraph = effective_subgraph(graph, migrator.as_ref())?;
            tracing::info!("{}: {} eligible nodes", migrator.name(), subgraph.len());
            subgraphs.push(subgraph);
        }
        let sizes: Vec<usize> = subgraphs.iter().map(std::collections::BTreeSet::len).collect();
        let budgets = compute_time_per_migrator(&sizes, self.options.timeout);
        let stamp = Stamp {
            tool_version: runner.tool_version(),
            pinning_version: runner.pinning_version(),
        };

        let mut report = RunReport::default();
        for ((migrator, subgraph), budget) in registry.migrators().iter().zip(&subgraphs).zip(budgets) {
            let mut counts = MigratorReport::new(migrator.name(), subgraph.len());
            let turn_start = Instant::now();
            let order = migrator.order(graph, subgraph);

            for name in &order {
                if let Some(stop) = self.stop_condition(start, turn_start, budget, &counts, migrator.as_ref(), host) {
                    counts.stop = Some(stop);
                    if matches!(stop, StopReason::GlobalTimeout | StopReason::RateLimited) {
                        report.aborted = Some(stop);
                    }
                    break;
                }

                let still_eligible = graph
                    .attrs(name)?
                    .is_some_and(|attrs| attrs.is_migratable() && migrator.is_eligible(attrs));
                if !still_eligible {
                    tracing::debug!("{name}: no longer eligible for {}", migrator.name());
                    continue;
                }

                counts.attempted += 1;
                let step = self.process_node(graph, name, migrator.as_ref(), runner, &stamp)?;
                match step {
                    NodeStep::Succeeded => counts.succeeded += 1,
                    NodeStep::Duplicate => counts.duplicate += 1,
                    NodeStep::Failed(reason) => {
                        tracing::info!("{name}: {} attempt failed: {reason}", migrator.name());
                        counts.failed += 1;
                    }
                    NodeStep::Archived => counts.archived += 1,
                    NodeStep::Errored => counts.errored += 1,
                    NodeStep::RateLimited => {
                        counts.stop = Some(StopReason::RateLimited);
                        report.aborted = Some(StopReason::RateLimited);
                    }
                }

                if !self.options.dry_run {
                    graph.save()?;
                }
                if report.aborted.is_some() {
                    break;
                }
            }

            counts.stop.get_or_insert(StopReason::Exhausted);
            tracing::info!(
                "{}: {} attempted, {} succeeded, {} failed, {} errored ({})",
                counts.name,
                counts.attempted,
                counts.succeeded,
                counts.failed,
                counts.errored,
                counts.stop.unwrap_or(StopReason::Exhausted)
            );
            report.migrators.push(counts);
            if let Some(reason) = report.aborted {
                tracing::warn!("Run stopped: {reason}");
                break;
            }
        }
        Ok(report)
    }

    fn stop_condition(
        &self,
        start: Instant,
        turn_start: Instant,
        budget: Duration,
        counts: &MigratorReport,
        migrator: &dyn Migrator,
        host: Option<&dyn HostingService>,
    ) -> Option<StopReason> {
        if start.elapsed() >= self.options.timeout {
            return Some(StopReason::GlobalTimeout);
        }
        if turn_start.elapsed() >= budget {
            return Some(StopReason::MigratorBudget);
        }
        if counts.succeeded >= migrator.pr_limit() {
            return Some(StopReason::PrLimit);
        }
        if let Some(host) = host {
            match host.rate_limit() {
                Ok(limit) if limit.remaining == 0 => {
                    tracing::warn!("API rate limit exhausted, resets at {:?}", limit.reset);
                    return Some(StopReason::RateLimited);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Could not read rate limit: {err}"),
            }
        }
        None
    }

    fn process_node(
        &self,
        graph: &mut DependencyGraph,
        name: &str,
        migrator: &dyn Migrator,
        runner: &dyn MigrationRunner,
        stamp: &Stamp,
    ) -> Result<NodeStep> {
        let step = |attrs: &mut NodeAttrs| -> Result<NodeStep, Infallible> {
            migrator.prepare(attrs);
            let result = runner.run(migrator, attrs);
            Ok(classify(attrs, migrator, result, stamp))
        };
        let outcome = if self.options.dry_run {
            graph.preview_node(name, step)?
        } else {
            graph.update_node(name, step)?
        };
        match outcome {
            Ok(step) => Ok(step),
            Err(never) => match never {},
        }
    }
}

fn classify(
    attrs: &mut NodeAttrs,
    migrator: &dyn Migrator,
    result: Result<PipelineOutcome, PipelineError>,
    stamp: &Stamp,
) -> NodeStep {
    let name = attrs.feedstock_name.clone();
    match result {
        Ok(PipelineOutcome::Failed(reason)) => NodeStep::Failed(reason),
        Ok(outcome) => {
            let pr = match &outcome {
                PipelineOutcome::Published { pr, .. } => pr.clone(),
                _ => PrRecord::synthetic_closed(),
            };
            let Some(uid) = outcome.uid().cloned() else {
                return NodeStep::Failed(FailureReason::NoChange);
            };
            if attrs.record_attempt(uid, pr) {
                if let Some(version) = &stamp.tool_version {
                    attrs.tool_version = Some(version.clone());
                }
                if let Some(version) = &stamp.pinning_version {
                    attrs.pinning_version = Some(version.clone());
                }
                tracing::info!("{name}: {} recorded", migrator.name());
                NodeStep::Succeeded
            } else {
                tracing::info!("{name}: {} already recorded", migrator.name());
                NodeStep::Duplicate
            }
        }
        Err(err) => match err.host_error() {
            Some(HostError::Archived(_)) => {
                tracing::warn!("{name}: repository is archived");
                attrs.archived = true;
                NodeStep::Archived
            }
            Some(HostError::RateLimited { .. }) => {
                tracing::warn!("{name}: rate limited during {}", migrator.name());
                NodeStep::RateLimited
            }
            other => {
                let code = other.and_then(HostError::status_code);
                let url = match other {
                    Some(HostError::NotFound(url)) => Some(url.clone()),
                    _ => None,
                };
                tracing::error!("{name}: {} raised: {err:#}", migrator.name());
                attrs.bad = BadMarker::Exception(ExceptionReport {
                    exception: format!("{err:#}"),
                    code,
                    url,
                });
                NodeStep::Errored
            }
        },
    }
}
