// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Shared fakes for integration tests

#![allow(dead_code)]

use feedstock_tick::error::HostError;
use feedstock_tick::fetcher::{FileFetch, RawFileSource, CONDA_FORGE_YML_PATH, META_YAML_PATH};
use std::collections::HashMap;

/// In-memory raw file host keyed by (feedstock, path)
#[derive(Default)]
pub struct FakeFiles {
    files: HashMap<(String, String), FileFetch>,
}

impl FakeFiles {
    pub fn recipe(mut self, name: &str, meta: &str) -> Self {
        self.files
            .insert((name.into(), META_YAML_PATH.into()), FileFetch::Found(meta.into()));
        self.files
            .insert((name.into(), CONDA_FORGE_YML_PATH.into()), FileFetch::Found("{}\n".into()));
        self
    }

    pub fn status(mut self, name: &str, path: &str, code: u16) -> Self {
        self.files.insert((name.into(), path.into()), FileFetch::Status(code));
        self
    }
}

impl RawFileSource for FakeFiles {
    fn fetch_raw(&self, _organization: &str, feedstock: &str, path: &str) -> Result<FileFetch, HostError> {
        Ok(self
            .files
            .get(&(feedstock.to_string(), path.to_string()))
            .cloned()
            .unwrap_or(FileFetch::Status(404)))
    }
}

/// Minimal recipe with run requirements and optional strong run exports
pub fn meta(name: &str, version: &str, run: &[&str], strong: bool) -> String {
    let mut text = format!(
        "{{% set version = \"{version}\" %}}\n\
         package:\n  name: {name}\n  version: {{{{ version }}}}\n\
         source:\n  url: https://example.org/{name}-{{{{ version }}}}.tar.gz\n  sha256: 0000\n\
         build:\n  number: 0\n"
    );
    if strong {
        text.push_str(&format!("  run_exports:\n    strong:\n      - {name}\n"));
    }
    text.push_str("requirements:\n  host:\n    - python\n");
    if !run.is_empty() {
        text.push_str("  run:\n");
        for r in run {
            text.push_str(&format!("    - {r}\n"));
        }
    }
    text
}
