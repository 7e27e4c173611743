// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Tracked pull request maintenance
//!
//! Refreshes the state of open pull requests from the host and turns a
//! `bot-rerun` label into a fresh fingerprint, so the migration counts as not
//! yet done on the next run.

use crate::graph::DependencyGraph;
use crate::host::{feedstock_repo, HostingService};
use crate::types::PrState;
use anyhow::Result;
use chrono::Utc;

/// Label asking for a migration to be attempted again
pub const BOT_RERUN_LABEL: &str = "bot-rerun";

/// Stamp `bot_rerun` on every labelled attempt that has no stamp yet.
///
/// Returns the number of attempts stamped.
pub fn update_nodes_with_bot_rerun(graph: &mut DependencyGraph) -> Result<usize> {
    let now = Utc::now().timestamp();
    let mut stamped = 0;
    let names: Vec<String> = graph.names().map(String::from).collect();

    for name in names {
        let needs_stamp = graph.attrs(&name)?.is_some_and(|attrs| {
            attrs
                .migration_history
                .iter()
                .any(|a| a.data.bot_rerun.is_none() && a.pr.labels.iter().any(|l| l == BOT_RERUN_LABEL))
        });
        if !needs_stamp {
            continue;
        }
        graph.modify_node(&name, |attrs| {
            for attempt in &mut attrs.migration_history {
                if attempt.data.bot_rerun.is_none() && attempt.pr.labels.iter().any(|l| l == BOT_RERUN_LABEL) {
                    attempt.data.bot_rerun = Some(now);
                    stamped += 1;
                }
            }
        })?;
        tracing::info!("{name}: {BOT_RERUN_LABEL} label processed");
    }
    Ok(stamped)
}

/// Re-read every open tracked pull request from the host.
///
/// Returns the number of records whose state or labels changed.
pub fn refresh_open_prs(graph: &mut DependencyGraph, host: &dyn HostingService, organization: &str) -> Result<usize> {
    let mut changed = 0;
    let names: Vec<String> = graph.names().map(String::from).collect();

    for name in names {
        let open: Vec<(usize, u64)> = match graph.attrs(&name)? {
            Some(attrs) => attrs
                .migration_history
                .iter()
                .enumerate()
                .filter(|(_, a)| a.pr.state == PrState::Open)
                .filter_map(|(i, a)| a.pr.number.map(|n| (i, n)))
                .collect(),
            None => continue,
        };
        if open.is_empty() {
            continue;
        }

        let repo = feedstock_repo(&name);
        let mut fresh = Vec::with_capacity(open.len());
        for (index, number) in open {
            match host.pull_request(organization, &repo, number) {
                Ok(pr) => fresh.push((index, pr)),
                Err(err) => tracing::warn!("{name}: could not refresh PR #{number}: {err}"),
            }
        }

        graph.modify_node(&name, |attrs| {
            for (index, pr) in fresh {
                if let Some(attempt) = attrs.migration_history.get_mut(index) {
                    if attempt.pr.state != pr.state || attempt.pr.labels != pr.labels {
                        changed += 1;
                    }
                    attempt.pr = pr;
                }
            }
        })?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MigrationUid, NodeAttrs, PrRecord};
    use tempfile::TempDir;

    #[test]
    fn test_bot_rerun_stamps_once() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        let mut attrs = NodeAttrs::new("numpy");
        let mut pr = PrRecord::synthetic_closed();
        pr.labels.push(BOT_RERUN_LABEL.into());
        attrs.record_attempt(
            MigrationUid {
                migrator_name: "Version".into(),
                migrator_version: 0,
                version: Some("2.0".into()),
                name: None,
                bot_rerun: None,
            },
            pr,
        );
        graph.add_node(attrs).unwrap();
        graph.add_node(NodeAttrs::new("scipy")).unwrap();

        assert_eq!(update_nodes_with_bot_rerun(&mut graph).unwrap(), 1);
        assert_eq!(update_nodes_with_bot_rerun(&mut graph).unwrap(), 0);

        let stamped = graph.attrs("numpy").unwrap().unwrap();
        assert!(stamped.migration_history[0].data.bot_rerun.is_some());
    }
}
