// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Upstream version bumps
//!
//! Targets the `new_version` ingested from `versions/<name>.json`. The edit
//! sets the recipe version, resets the build number and refreshes the source
//! checksum.

use super::{default_piggy_backs, meta_yaml_path, MigrateOutcome, MiniMigrator, Migrator};
use crate::recipe::{self, Platform};
use crate::render::SourceHasher;
use crate::types::{MigrationUid, NodeAttrs};
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Attempts per target version before a node stops being eligible
pub const MAX_VERSION_ATTEMPTS: u32 = 3;

static SET_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(\s*\{%-?\s*set\s+version\s*=\s*["'])([^"']*)(["'])"#).expect("Invalid version regex")
});

static VERSION_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(\s*version:\s*["']?)([^"'\s{}]+)(["']?\s*)$"#).expect("Invalid version regex")
});

static SET_BUILD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(\s*\{%-?\s*set\s+build(?:_number)?\s*=\s*)(\d+)").expect("Invalid build regex")
});

static BUILD_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*number:\s*)(\d+)").expect("Invalid build number regex"));

/// Bumps a recipe to its newest upstream version
pub struct VersionMigrator {
    pr_limit: usize,
    hasher: Arc<dyn SourceHasher>,
    piggy_backs: Vec<Box<dyn MiniMigrator>>,
}

impl VersionMigrator {
    /// Migrator opening at most `pr_limit` pull requests per run
    #[must_use]
    pub fn new(pr_limit: usize, hasher: Arc<dyn SourceHasher>) -> Self {
        Self {
            pr_limit,
            hasher,
            piggy_backs: default_piggy_backs(),
        }
    }

    fn target<'a>(&self, attrs: &'a NodeAttrs) -> Option<&'a str> {
        attrs.new_version.as_deref().filter(|v| !v.is_empty())
    }
}

/// One comparable piece of a version string
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Part {
    /// Pre-release tag: dev < alpha < beta < rc
    Pre(u8),
    Num(u64),
    /// Trailing letters such as the `k` in `1.1.1k`
    Word(String),
}

fn pre_release_rank(tag: &str, followed_by_number: bool) -> Option<u8> {
    match tag {
        "dev" => Some(0),
        "alpha" => Some(1),
        "beta" => Some(2),
        "rc" | "pre" | "preview" => Some(3),
        "a" if followed_by_number => Some(1),
        "b" if followed_by_number => Some(2),
        "c" if followed_by_number => Some(3),
        _ => None,
    }
}

fn version_parts(version: &str) -> Vec<Part> {
    let lowered = version.trim().to_lowercase();
    let mut tokens: Vec<&str> = Vec::new();
    for chunk in lowered.split(['.', '-', '_', '+']).filter(|c| !c.is_empty()) {
        let mut start = 0;
        let bytes = chunk.as_bytes();
        for i in 1..bytes.len() {
            if bytes[i].is_ascii_digit() != bytes[i - 1].is_ascii_digit() {
                tokens.push(&chunk[start..i]);
                start = i;
            }
        }
        tokens.push(&chunk[start..]);
    }

    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            if let Ok(n) = token.parse::<u64>() {
                return Part::Num(n);
            }
            let followed_by_number = tokens.get(i + 1).is_some_and(|next| next.parse::<u64>().is_ok());
            match pre_release_rank(token, followed_by_number) {
                Some(rank) => Part::Pre(rank),
                None => Part::Word((*token).to_string()),
            }
        })
        .collect()
}

/// Compare versions piece by piece.
///
/// Missing trailing pieces count as zero, so `1.0` equals `1.0.0`, and a
/// pre-release sorts below its release (`2.0rc1` < `2.0`).
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (left, right) = (version_parts(a), version_parts(b));
    let zero = Part::Num(0);
    for i in 0..left.len().max(right.len()) {
        let ord = left.get(i).unwrap_or(&zero).cmp(right.get(i).unwrap_or(&zero));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Replace the recipe version, trying the `set` variable first
fn set_version(text: &str, version: &str) -> Option<String> {
    let re = if SET_VERSION.is_match(text) {
        &*SET_VERSION
    } else if VERSION_KEY.is_match(text) {
        &*VERSION_KEY
    } else {
        return None;
    };
    let replacement = format!("${{1}}{version}${{3}}");
    Some(re.replacen(text, 1, replacement.as_str()).into_owned())
}

/// Set every build number to `number`
pub(crate) fn set_build_number(text: &str, number: impl Fn(u64) -> u64) -> String {
    let bump = |caps: &regex::Captures<'_>| {
        let current = caps[2].parse::<u64>().unwrap_or(0);
        format!("{}{}", &caps[1], number(current))
    };
    let text = SET_BUILD.replace_all(text, bump);
    if SET_BUILD.is_match(&text) {
        return text.into_owned();
    }
    BUILD_NUMBER.replace_all(&text, bump).into_owned()
}

impl Migrator for VersionMigrator {
    fn name(&self) -> &str {
        "Version"
    }

    fn pr_limit(&self) -> usize {
        self.pr_limit
    }

    fn is_eligible(&self, attrs: &NodeAttrs) -> bool {
        let Some(target) = self.target(attrs) else {
            return false;
        };
        let newer = attrs
            .recipe
            .version
            .as_deref()
            .map_or(true, |current| compare_versions(target, current) == Ordering::Greater);
        let attempts = attrs.new_version_attempts.get(target).copied().unwrap_or(0);
        newer && attempts < MAX_VERSION_ATTEMPTS && !attrs.has_attempt(&self.migrator_uid(attrs))
    }

    fn piggy_backs(&self) -> &[Box<dyn MiniMigrator>] {
        &self.piggy_backs
    }

    fn prepare(&self, attrs: &mut NodeAttrs) {
        if let Some(target) = attrs.new_version.clone() {
            *attrs.new_version_attempts.entry(target).or_insert(0) += 1;
        }
    }

    fn migrate(&self, feedstock_dir: &Path, attrs: &NodeAttrs) -> Result<MigrateOutcome> {
        let Some(target) = self.target(attrs) else {
            return Ok(MigrateOutcome::NoChange("no new version".into()));
        };
        let path = meta_yaml_path(feedstock_dir);
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;

        let Some(updated) = set_version(&text, target) else {
            return Ok(MigrateOutcome::NoChange("no version field in recipe".into()));
        };
        if updated == text {
            return Ok(MigrateOutcome::NoChange(format!("recipe already at {target}")));
        }
        let mut updated = set_build_number(&updated, |_| 0);

        let rendered = recipe::render(&updated, Platform::Linux);
        let meta: serde_json::Value =
            serde_yaml::from_str(&rendered).with_context(|| format!("Failed to parse updated recipe for {target}"))?;
        let source = meta.get("source").map(|s| match s {
            serde_json::Value::Array(items) => items.first().cloned().unwrap_or_default(),
            other => other.clone(),
        });
        let hash_type = attrs.recipe.hash_type.as_deref().unwrap_or("sha256");
        let url = source
            .as_ref()
            .and_then(|s| s.get("url"))
            .and_then(|u| match u {
                serde_json::Value::Array(urls) => urls.first().and_then(|v| v.as_str()).map(String::from),
                other => other.as_str().map(String::from),
            });

        if let Some(url) = url {
            let digest = self.hasher.hash(&url, hash_type)?;
            let old = source
                .as_ref()
                .and_then(|s| s.get(hash_type))
                .and_then(|v| v.as_str())
                .map(String::from);
            match old {
                Some(old) if !old.is_empty() && updated.contains(&old) => {
                    updated = updated.replace(&old, &digest);
                }
                _ => {
                    let key = Regex::new(&format!(r"(?m)^(\s*{hash_type}:\s*)\S+"))
                        .context("Failed to build hash pattern")?;
                    updated = key
                        .replacen(&updated, 1, |caps: &regex::Captures<'_>| format!("{}{digest}", &caps[1]))
                        .into_owned();
                }
            }
        } else {
            tracing::warn!("{}: no source url after update, checksum left as is", attrs.feedstock_name);
        }

        fs::write(&path, updated).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(MigrateOutcome::Changed)
    }

    fn commit_message(&self, attrs: &NodeAttrs) -> String {
        format!("updated v{}", self.target(attrs).unwrap_or_default())
    }

    fn pr_title(&self, attrs: &NodeAttrs) -> String {
        format!("{} v{}", attrs.feedstock_name, self.target(attrs).unwrap_or_default())
    }

    fn pr_body(&self, attrs: &NodeAttrs) -> String {
        let target = self.target(attrs).unwrap_or_default();
        let mut body = format!(
            "It is very likely that the current package version for this feedstock is out of date.\n\n\
             Information about this PR:\n\
             1. Feel free to push to the bot's branch to update this PR if needed.\n\
             2. The bot will almost always only open one PR per version.\n\n\
             Pending Dependency Version Updates\n--------------------\n\n\
             New version: {target}\n"
        );
        if let Some(current) = &attrs.recipe.version {
            body.push_str(&format!("Current version: {current}\n"));
        }
        body
    }

    fn remote_branch(&self, attrs: &NodeAttrs) -> String {
        self.target(attrs).unwrap_or_default().to_string()
    }

    fn migrator_uid(&self, attrs: &NodeAttrs) -> MigrationUid {
        MigrationUid {
            migrator_name: self.name().to_string(),
            migrator_version: self.migrator_version(),
            version: self.target(attrs).map(String::from),
            name: None,
            bot_rerun: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrRecord;
    use tempfile::TempDir;

    struct FixedHasher;

    impl SourceHasher for FixedHasher {
        fn hash(&self, url: &str, _hash_type: &str) -> Result<String> {
            Ok(format!("hash-of-{}", url.rsplit('/').next().unwrap_or_default()))
        }
    }

    const META: &str = "{% set version = \"1.0\" %}\n\
        package:\n  name: foo\n  version: {{ version }}\n\
        source:\n  url: https://example.org/foo-{{ version }}.tar.gz\n  sha256: oldhash\n\
        build:\n  number: 3\n";

    fn migrator() -> VersionMigrator {
        VersionMigrator::new(10, Arc::new(FixedHasher))
    }

    fn node(current: &str, new: &str) -> NodeAttrs {
        let mut attrs = NodeAttrs::new("foo");
        attrs.recipe.version = Some(current.into());
        attrs.recipe.hash_type = Some("sha256".into());
        attrs.new_version = Some(new.into());
        attrs
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0", "2.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0rc1", "2.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0rc2", "2.0.0rc10"), Ordering::Less);
        assert_eq!(compare_versions("1.0a1", "1.0b1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.dev0", "2.0a1"), Ordering::Less);
        assert_eq!(compare_versions("1.1.1k", "1.1.1j"), Ordering::Greater);
        assert_eq!(compare_versions("1.1.1a", "1.1.1"), Ordering::Greater);
    }

    #[test]
    fn test_release_candidate_is_not_newer_than_release() {
        let m = migrator();
        assert!(!m.is_eligible(&node("2.0", "2.0rc1")));
        assert!(!m.is_eligible(&node("1.0", "1.0.0")));
        assert!(m.is_eligible(&node("2.0rc1", "2.0")));
    }

    #[test]
    fn test_eligibility() {
        let m = migrator();
        assert!(m.is_eligible(&node("1.0", "1.1")));
        assert!(!m.is_eligible(&node("1.1", "1.1")));
        assert!(!m.is_eligible(&NodeAttrs::new("foo")));

        let mut exhausted = node("1.0", "1.1");
        exhausted.new_version_attempts.insert("1.1".into(), MAX_VERSION_ATTEMPTS);
        assert!(!m.is_eligible(&exhausted));

        let mut done = node("1.0", "1.1");
        let uid = m.migrator_uid(&done);
        done.record_attempt(uid, PrRecord::synthetic_closed());
        assert!(!m.is_eligible(&done));
    }

    #[test]
    fn test_prepare_counts_attempts() {
        let mut attrs = node("1.0", "1.1");
        migrator().prepare(&mut attrs);
        migrator().prepare(&mut attrs);
        assert_eq!(attrs.new_version_attempts.get("1.1"), Some(&2));
    }

    #[test]
    fn test_migrate_updates_version_build_and_hash() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("recipe")).unwrap();
        fs::write(meta_yaml_path(dir.path()), META).unwrap();

        let outcome = migrator().migrate(dir.path(), &node("1.0", "1.1")).unwrap();
        assert_eq!(outcome, MigrateOutcome::Changed);

        let text = fs::read_to_string(meta_yaml_path(dir.path())).unwrap();
        assert!(text.contains("{% set version = \"1.1\" %}"));
        assert!(text.contains("number: 0"));
        assert!(text.contains("sha256: hash-of-foo-1.1.tar.gz"));

        let again = migrator().migrate(dir.path(), &node("1.0", "1.1")).unwrap();
        assert!(matches!(again, MigrateOutcome::NoChange(_)));
    }

    #[test]
    fn test_build_number_in_set_variable() {
        let text = "{% set build = 4 %}\nbuild:\n  number: {{ build }}\n";
        assert_eq!(set_build_number(text, |_| 0), "{% set build = 0 %}\nbuild:\n  number: {{ build }}\n");
        assert_eq!(set_build_number("build:\n  number: 2\n", |n| n + 1), "build:\n  number: 3\n");
    }
}
