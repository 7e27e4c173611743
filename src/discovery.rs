// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Feedstock discovery
//!
//! Lists the organization's repositories, keeps the `-feedstock` ones, and
//! caches the result in `names.txt`. When the live listing fails the cached
//! list is used and `names_are_current.txt` says so.

use crate::graph::{write_atomic, DependencyGraph};
use crate::host::{HostingService, RepoSummary};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Cached feedstock names, one per line
pub const NAMES_FILE: &str = "names.txt";

/// `yes` when `names.txt` came from a live listing, `no` otherwise
pub const NAMES_STATUS_FILE: &str = "names_are_current.txt";

const FEEDSTOCK_SUFFIX: &str = "-feedstock";

/// Where a name list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    /// Listed from the host just now
    Live,
    /// Read back from `names.txt`
    Cached,
}

/// Discovered feedstock names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Sorted, deduplicated names without the suffix
    pub names: Vec<String>,
    /// Origin of the list
    pub source: NameSource,
}

/// Feedstock names among `repos`: suffix stripped, sorted, deduplicated
#[must_use]
pub fn feedstock_names(repos: &[RepoSummary], include_archived: bool) -> Vec<String> {
    let mut names: Vec<String> = repos
        .iter()
        .filter(|r| include_archived || !r.archived)
        .filter_map(|r| r.name.strip_suffix(FEEDSTOCK_SUFFIX))
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect();
    names.sort();
    names.dedup();
    names
}

/// List the organization's feedstocks, falling back to the cache in `data_dir`
pub fn get_all_feedstocks(
    host: &dyn HostingService,
    organization: &str,
    data_dir: &Path,
    include_archived: bool,
) -> Result<Discovery> {
    match host.list_repositories(organization) {
        Ok(repos) => {
            let names = feedstock_names(&repos, include_archived);
            tracing::info!("Found {} feedstocks in {organization}", names.len());
            write_names(data_dir, &names)?;
            write_status(data_dir, true)?;
            Ok(Discovery {
                names,
                source: NameSource::Live,
            })
        }
        Err(err) => {
            tracing::warn!("Listing {organization} failed, using cached names: {err}");
            let names = read_names(data_dir)?;
            write_status(data_dir, false)?;
            Ok(Discovery {
                names,
                source: NameSource::Cached,
            })
        }
    }
}

/// Copy the host's archive flags onto matching graph nodes.
///
/// Only repositories the host listed are touched, so stub nodes for
/// external dependencies stay archived. Returns how many nodes changed.
pub fn sync_archived(graph: &mut DependencyGraph, repos: &[RepoSummary]) -> Result<usize> {
    let mut changed = 0;
    for repo in repos {
        let Some(name) = repo.name.strip_suffix(FEEDSTOCK_SUFFIX) else {
            continue;
        };
        let differs = match graph.attrs(name)? {
            Some(attrs) => attrs.archived != repo.archived,
            None => false,
        };
        if differs {
            tracing::info!("{name}: host reports archived={}", repo.archived);
            graph.modify_node(name, |attrs| attrs.archived = repo.archived)?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Write `names.txt`, sorted and deduplicated
pub fn write_names(data_dir: &Path, names: &[String]) -> Result<()> {
    let mut sorted = names.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut text = sorted.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::create_dir_all(data_dir).with_context(|| format!("Failed to create {}", data_dir.display()))?;
    write_atomic(&data_dir.join(NAMES_FILE), text.as_bytes())
}

/// Read `names.txt`; a missing file is an empty list
pub fn read_names(data_dir: &Path) -> Result<Vec<String>> {
    let path = data_dir.join(NAMES_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut names: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Record whether the name list is current
pub fn write_status(data_dir: &Path, current: bool) -> Result<()> {
    fs::create_dir_all(data_dir).with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let path = data_dir.join(NAMES_STATUS_FILE);
    fs::write(&path, if current { "yes" } else { "no" })
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Whether the last listing was live; `None` before any listing
pub fn read_status(data_dir: &Path) -> Result<Option<bool>> {
    let path = data_dir.join(NAMES_STATUS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(text.trim() == "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn repo(name: &str, archived: bool) -> RepoSummary {
        RepoSummary {
            name: name.into(),
            archived,
        }
    }

    #[test]
    fn test_feedstock_names_filters_and_sorts() {
        let repos = vec![
            repo("zlib-feedstock", false),
            repo("numpy-feedstock", false),
            repo("old-feedstock", true),
            repo("conda-smithy", false),
            repo("numpy-feedstock", false),
        ];
        assert_eq!(feedstock_names(&repos, false), vec!["numpy", "zlib"]);
        assert_eq!(feedstock_names(&repos, true), vec!["numpy", "old", "zlib"]);
    }

    #[test]
    fn test_names_file_roundtrip_and_status() {
        let dir = TempDir::new().unwrap();
        assert!(read_names(dir.path()).unwrap().is_empty());
        assert_eq!(read_status(dir.path()).unwrap(), None);

        write_names(dir.path(), &["b".into(), "a".into(), "b".into()]).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join(NAMES_FILE)).unwrap(), "a\nb\n");
        write_status(dir.path(), false).unwrap();
        assert_eq!(read_status(dir.path()).unwrap(), Some(false));
    }

    #[test]
    fn test_sync_archived_follows_host_listing() {
        let dir = TempDir::new().unwrap();
        let mut graph = DependencyGraph::new(dir.path());
        graph.add_node(crate::types::NodeAttrs::stub("numpy")).unwrap();
        graph.add_node(crate::types::NodeAttrs::new("old")).unwrap();
        graph.add_node(crate::types::NodeAttrs::stub("python")).unwrap();

        let repos = vec![repo("numpy-feedstock", false), repo("old-feedstock", true), repo("conda-smithy", false)];
        assert_eq!(sync_archived(&mut graph, &repos).unwrap(), 2);
        assert!(!graph.attrs("numpy").unwrap().unwrap().archived);
        assert!(graph.attrs("old").unwrap().unwrap().archived);
        assert!(graph.attrs("python").unwrap().unwrap().archived);
        assert_eq!(sync_archived(&mut graph, &repos).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_names_sorted_and_unique(raw in proptest::collection::vec("[a-z]{1,8}", 0..30)) {
            let repos: Vec<RepoSummary> = raw.iter().map(|n| repo(&format!("{n}-feedstock"), false)).collect();
            let names = feedstock_names(&repos, false);
            prop_assert!(names.windows(2).all(|w| w[0] < w[1]));
            for n in &raw {
                prop_assert!(names.contains(n));
            }
        }
    }
}
