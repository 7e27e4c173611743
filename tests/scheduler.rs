// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Integration tests for scheduling and outcome classification

use feedstock_tick::error::{HostError, PipelineError};
use feedstock_tick::fetcher::{FileFetch, RawFileSource};
use feedstock_tick::graph::DependencyGraph;
use feedstock_tick::host::{HostingService, PullRequestSpec, RateLimit, RepoSummary};
use feedstock_tick::migrators::{MigrateOutcome, Migrator, MigratorRegistry};
use feedstock_tick::pipeline::{FailureReason, MigrationRunner, PipelineOutcome};
use feedstock_tick::scheduler::{Scheduler, SchedulerOptions, StopReason};
use feedstock_tick::types::{BadMarker, NodeAttrs, PrRecord, PrState};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

struct Rebuild {
    name: &'static str,
    pr_limit: usize,
}

impl Migrator for Rebuild {
    fn name(&self) -> &str {
        self.name
    }
    fn pr_limit(&self) -> usize {
        self.pr_limit
    }
    fn is_eligible(&self, attrs: &NodeAttrs) -> bool {
        !attrs.has_attempt(&self.migrator_uid(attrs))
    }
    fn migrate(&self, _dir: &Path, _attrs: &NodeAttrs) -> anyhow::Result<MigrateOutcome> {
        Ok(MigrateOutcome::Changed)
    }
    fn commit_message(&self, _attrs: &NodeAttrs) -> String {
        "rebuild".into()
    }
    fn pr_title(&self, attrs: &NodeAttrs) -> String {
        format!("Rebuild {}", attrs.feedstock_name)
    }
    fn pr_body(&self, _attrs: &NodeAttrs) -> String {
        String::new()
    }
    fn remote_branch(&self, _attrs: &NodeAttrs) -> String {
        "rebuild".into()
    }
}

/// Scripted runner: publishes unless a node has a scripted error or failure
#[derive(Default)]
struct ScriptedRunner {
    errors: HashMap<String, fn() -> PipelineError>,
    failures: HashMap<String, FailureReason>,
    delay: Option<Duration>,
    visited: RefCell<Vec<String>>,
}

impl MigrationRunner for ScriptedRunner {
    fn run(&self, migrator: &dyn Migrator, attrs: &NodeAttrs) -> Result<PipelineOutcome, PipelineError> {
        let name = attrs.feedstock_name.clone();
        self.visited.borrow_mut().push(name.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(make) = self.errors.get(&name) {
            return Err(make());
        }
        if let Some(reason) = self.failures.get(&name) {
            return Ok(PipelineOutcome::Failed(*reason));
        }
        let number = self.visited.borrow().len() as u64;
        Ok(PipelineOutcome::Published {
            uid: migrator.migrator_uid(attrs),
            pr: PrRecord {
                id: Some(number),
                number: Some(number),
                html_url: None,
                state: PrState::Open,
                head_ref: format!("rebuild_h{number}"),
                labels: vec![],
            },
        })
    }

    fn tool_version(&self) -> Option<String> {
        Some("3.1.0".into())
    }

    fn pinning_version(&self) -> Option<String> {
        Some("2024.03.05".into())
    }
}

fn graph_with(dir: &TempDir, names: &[&str]) -> DependencyGraph {
    let mut graph = DependencyGraph::new(dir.path());
    for name in names {
        graph.add_node(NodeAttrs::new(name)).unwrap();
    }
    graph.save().unwrap();
    graph
}

fn scheduler(dry_run: bool) -> Scheduler {
    Scheduler::new(SchedulerOptions {
        timeout: Duration::from_secs(600),
        dry_run,
    })
}

fn registry(pr_limit: usize) -> MigratorRegistry {
    MigratorRegistry::new(vec![Box::new(Rebuild {
        name: "Rebuild",
        pr_limit,
    })])
}

/// Host whose remaining API budget counts down through `remaining`, then 0
struct MeteredHost {
    remaining: Mutex<Vec<u64>>,
}

impl MeteredHost {
    fn new(remaining: &[u64]) -> Self {
        Self {
            remaining: Mutex::new(remaining.iter().rev().copied().collect()),
        }
    }
}

impl RawFileSource for MeteredHost {
    fn fetch_raw(&self, _organization: &str, _feedstock: &str, _path: &str) -> Result<FileFetch, HostError> {
        Ok(FileFetch::Status(404))
    }
}

impl HostingService for MeteredHost {
    fn list_repositories(&self, _organization: &str) -> Result<Vec<RepoSummary>, HostError> {
        Ok(Vec::new())
    }
    fn ensure_fork(&self, _organization: &str, _repo: &str) -> Result<String, HostError> {
        Ok("bot".into())
    }
    fn push_branch(&self, _workdir: &Path, _owner: &str, _repo: &str, _branch: &str) -> Result<(), HostError> {
        Ok(())
    }
    fn create_pull_request(&self, _spec: &PullRequestSpec) -> Result<PrRecord, HostError> {
        Err(HostError::NotFound("pulls".into()))
    }
    fn pull_request(&self, _organization: &str, _repo: &str, _number: u64) -> Result<PrRecord, HostError> {
        Err(HostError::NotFound("pull".into()))
    }
    fn rate_limit(&self) -> Result<RateLimit, HostError> {
        let remaining = self.remaining.lock().unwrap().pop().unwrap_or(0);
        Ok(RateLimit { remaining, reset: None })
    }
    fn clone_url(&self, owner: &str, repo: &str) -> String {
        format!("file:///{owner}/{repo}")
    }
}

#[test]
fn test_pr_limit_stops_migrator() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b", "c", "d", "e"]);
    let runner = ScriptedRunner::default();

    let report = scheduler(false).run(&mut graph, &registry(2), &runner, None).unwrap();

    let counts = &report.migrators[0];
    assert_eq!(counts.eligible, 5);
    assert_eq!(counts.succeeded, 2);
    assert_eq!(counts.stop, Some(StopReason::PrLimit));
    assert_eq!(report.aborted, None);

    let reloaded = DependencyGraph::load(dir.path()).unwrap();
    let touched: Vec<&str> = reloaded
        .names()
        .filter(|n| !reloaded.attrs(n).unwrap().unwrap().migration_history.is_empty())
        .collect();
    assert_eq!(touched, vec!["a", "b"]);
    let a = reloaded.attrs("a").unwrap().unwrap();
    assert_eq!(a.tool_version.as_deref(), Some("3.1.0"));
    assert_eq!(a.pinning_version.as_deref(), Some("2024.03.05"));
    assert_eq!(reloaded.attrs("c").unwrap().unwrap().pinning_version, None);
}

#[test]
fn test_second_run_skips_recorded_nodes() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b"]);
    let runner = ScriptedRunner::default();
    scheduler(false).run(&mut graph, &registry(10), &runner, None).unwrap();

    let again = ScriptedRunner::default();
    let report = scheduler(false).run(&mut graph, &registry(10), &again, None).unwrap();
    assert_eq!(report.migrators[0].eligible, 0);
    assert!(again.visited.borrow().is_empty());
}

#[test]
fn test_error_classification() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["archived", "broken", "failing", "fine"]);
    let mut runner = ScriptedRunner::default();
    runner.errors.insert("archived".into(), || {
        PipelineError::Host(HostError::Archived("org/archived-feedstock".into()))
    });
    runner.errors.insert("broken".into(), || {
        PipelineError::Host(HostError::Status {
            code: 500,
            message: "server error".into(),
        })
    });
    runner.failures.insert("failing".into(), FailureReason::RenderFailed);

    let report = scheduler(false).run(&mut graph, &registry(10), &runner, None).unwrap();
    let counts = &report.migrators[0];
    assert_eq!(
        (counts.archived, counts.errored, counts.failed, counts.succeeded),
        (1, 1, 1, 1)
    );

    let reloaded = DependencyGraph::load(dir.path()).unwrap();
    assert!(reloaded.attrs("archived").unwrap().unwrap().archived);
    match &reloaded.attrs("broken").unwrap().unwrap().bad {
        BadMarker::Exception(report) => assert_eq!(report.code, Some(500)),
        other => panic!("unexpected marker: {other:?}"),
    }
    let failing = reloaded.attrs("failing").unwrap().unwrap();
    assert!(failing.migration_history.is_empty());
    assert!(!failing.bad.is_bad());
}

#[test]
fn test_rate_limit_aborts_run() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b", "c"]);
    let mut runner = ScriptedRunner::default();
    runner
        .errors
        .insert("b".into(), || PipelineError::Host(HostError::RateLimited { reset: None }));

    let report = scheduler(false).run(&mut graph, &registry(10), &runner, None).unwrap();
    assert_eq!(report.aborted, Some(StopReason::RateLimited));
    assert_eq!(*runner.visited.borrow(), vec!["a", "b"]);
}

#[test]
fn test_dry_run_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b"]);
    let runner = ScriptedRunner::default();

    let report = scheduler(true).run(&mut graph, &registry(10), &runner, None).unwrap();
    assert_eq!(report.migrators[0].succeeded, 2);

    let reloaded = DependencyGraph::load(dir.path()).unwrap();
    assert!(reloaded.attrs("a").unwrap().unwrap().migration_history.is_empty());
}

#[test]
fn test_dependencies_visited_first() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b", "c"]);
    graph.add_edge("c", "a").unwrap();
    graph.add_edge("b", "c").unwrap();

    let runner = ScriptedRunner::default();
    scheduler(false).run(&mut graph, &registry(10), &runner, None).unwrap();
    assert_eq!(*runner.visited.borrow(), vec!["b", "c", "a"]);
}

#[test]
fn test_global_timeout_aborts_before_any_node() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b"]);
    let runner = ScriptedRunner::default();
    let scheduler = Scheduler::new(SchedulerOptions {
        timeout: Duration::ZERO,
        dry_run: false,
    });

    let report = scheduler.run(&mut graph, &registry(10), &runner, None).unwrap();
    assert_eq!(report.aborted, Some(StopReason::GlobalTimeout));
    assert_eq!(report.migrators.len(), 1);
    assert_eq!(report.migrators[0].stop, Some(StopReason::GlobalTimeout));
    assert_eq!(report.migrators[0].attempted, 0);
    assert!(runner.visited.borrow().is_empty());
}

#[test]
fn test_time_share_ends_turn_and_next_migrator_runs() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b", "c", "d"]);
    let runner = ScriptedRunner {
        delay: Some(Duration::from_secs(1)),
        ..ScriptedRunner::default()
    };
    let registry = MigratorRegistry::new(vec![
        Box::new(Rebuild {
            name: "First",
            pr_limit: 10,
        }),
        Box::new(Rebuild {
            name: "Second",
            pr_limit: 10,
        }),
    ]);
    let scheduler = Scheduler::new(SchedulerOptions {
        timeout: Duration::from_secs(5),
        dry_run: true,
    });

    let report = scheduler.run(&mut graph, &registry, &runner, None).unwrap();
    let first = &report.migrators[0];
    assert_eq!(first.stop, Some(StopReason::MigratorBudget));
    assert_eq!(first.attempted, 3);
    assert_eq!(report.migrators.len(), 2);
    assert!(report.migrators[1].attempted >= 1);
}

#[test]
fn test_exhausted_rate_limit_stops_before_next_node() {
    let dir = TempDir::new().unwrap();
    let mut graph = graph_with(&dir, &["a", "b", "c"]);
    let runner = ScriptedRunner::default();
    let host = MeteredHost::new(&[5]);

    let report = scheduler(false).run(&mut graph, &registry(10), &runner, Some(&host)).unwrap();
    assert_eq!(report.aborted, Some(StopReason::RateLimited));
    assert_eq!(report.migrators[0].stop, Some(StopReason::RateLimited));
    assert_eq!(*runner.visited.borrow(), vec!["a"]);

    let reloaded = DependencyGraph::load(dir.path()).unwrap();
    assert_eq!(reloaded.attrs("a").unwrap().unwrap().migration_history.len(), 1);
    assert!(reloaded.attrs("b").unwrap().unwrap().migration_history.is_empty());
}
