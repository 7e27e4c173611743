// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Piggy-back cleanups
//!
//! Each one is idempotent and reports whether it changed anything.

use super::meta_yaml_path;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

/// When a piggy-back runs relative to the primary edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the primary edit
    Pre,
    /// After the primary edit
    Post,
}

/// A small cleanup applied alongside a migration
pub trait MiniMigrator {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// When to run
    fn phase(&self) -> Phase;

    /// Apply to the working copy; returns whether anything changed
    fn migrate(&self, feedstock_dir: &Path) -> Result<bool>;
}

/// Piggy-backs the version migrator carries
#[must_use]
pub fn default_piggy_backs() -> Vec<Box<dyn MiniMigrator>> {
    vec![
        Box::new(Jinja2VarsCleanup),
        Box::new(PipMigrator),
        Box::new(LicenseMigrator),
        Box::new(CondaForgeYamlCleanup),
        Box::new(ExtraJinja2KeysCleanup),
    ]
}

fn rewrite(path: &Path, edit: impl FnOnce(&str) -> String) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let before = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let after = edit(&before);
    if after == before {
        return Ok(false);
    }
    fs::write(path, after).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// `{{name}}` becomes `{{ name }}`
pub struct Jinja2VarsCleanup;

static TIGHT_JINJA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^\s{}][^{}]*?[^\s{}]|[^\s{}])\}\}").expect("Invalid jinja regex"));

impl MiniMigrator for Jinja2VarsCleanup {
    fn name(&self) -> &'static str {
        "Jinja2VarsCleanup"
    }

    fn phase(&self) -> Phase {
        Phase::Pre
    }

    fn migrate(&self, feedstock_dir: &Path) -> Result<bool> {
        rewrite(&meta_yaml_path(feedstock_dir), |text| {
            TIGHT_JINJA.replace_all(text, "{{ $1 }}").into_owned()
        })
    }
}

/// `python setup.py install` build scripts become pip installs
pub struct PipMigrator;

static SETUP_PY_INSTALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:\{\{\s*PYTHON\s*\}\}|\$PYTHON|python)\s+setup\.py\s+install[^\n"']*"#)
        .expect("Invalid setup.py regex")
});

const PIP_INSTALL: &str = "{{ PYTHON }} -m pip install . --no-deps -vv";

impl MiniMigrator for PipMigrator {
    fn name(&self) -> &'static str {
        "PipMigrator"
    }

    fn phase(&self) -> Phase {
        Phase::Pre
    }

    fn migrate(&self, feedstock_dir: &Path) -> Result<bool> {
        rewrite(&meta_yaml_path(feedstock_dir), |text| {
            SETUP_PY_INSTALL.replace_all(text, PIP_INSTALL).into_owned()
        })
    }
}

/// Rewrites `about.license` to its SPDX identifier and, when the recipe
/// directory ships a license file, points a missing `license_file` at it
pub struct LicenseMigrator;

static LICENSE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^([ \t]+license:[ \t]*)(["']?)([^"'\n#]*?)(["']?)([ \t]*(?:#[^\n]*)?)$"#)
        .expect("Invalid license regex")
});

static LICENSE_FILE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]+license_file:").expect("Invalid license_file regex"));

/// SPDX identifier for a free-form license name, if it is a known spelling
#[must_use]
pub fn spdx_license(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_lowercase().replace(['_', ','], " ");
    let mut key = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(rest) = key.strip_prefix("the ") {
        key = rest.to_string();
    }
    if let Some(rest) = key.strip_suffix(" license") {
        key = rest.to_string();
    }
    let id = match key.as_str() {
        "mit" => "MIT",
        "bsd" | "new bsd" | "3-clause bsd" | "bsd 3-clause" | "bsd 3 clause" | "bsd-3" | "bsd3" | "bsd-3-clause" => {
            "BSD-3-Clause"
        }
        "simplified bsd" | "2-clause bsd" | "bsd 2-clause" | "bsd 2 clause" | "bsd-2" | "bsd2" | "bsd-2-clause" => {
            "BSD-2-Clause"
        }
        "apache" | "apache 2" | "apache 2.0" | "apache-2" | "apache-2.0" | "apache2" | "apache v2" | "apache version 2.0"
        | "asl 2.0" => "Apache-2.0",
        "gpl-2" | "gplv2" | "gpl2" | "gpl 2" | "gpl-2.0" => "GPL-2.0-only",
        "gplv2+" | "gpl-2+" | "gpl2+" | "gpl-2.0+" => "GPL-2.0-or-later",
        "gpl-3" | "gplv3" | "gpl3" | "gpl 3" | "gpl-3.0" => "GPL-3.0-only",
        "gplv3+" | "gpl-3+" | "gpl3+" | "gpl-3.0+" => "GPL-3.0-or-later",
        "lgpl-2.1" | "lgplv2.1" | "lgpl 2.1" => "LGPL-2.1-only",
        "lgpl-3" | "lgplv3" | "lgpl3" | "lgpl 3" | "lgpl-3.0" => "LGPL-3.0-only",
        "mpl 2.0" | "mpl-2" | "mpl2" | "mpl-2.0" | "mozilla public 2.0" => "MPL-2.0",
        "psf" | "python software foundation" | "psf-2.0" => "PSF-2.0",
        "isc" => "ISC",
        "zlib" => "Zlib",
        "unlicense" => "Unlicense",
        _ => return None,
    };
    Some(id)
}

/// First `LICENSE*` or `COPYING*` file directly inside `recipe_dir`
fn shipped_license_file(recipe_dir: &Path) -> Result<Option<String>> {
    if !recipe_dir.is_dir() {
        return Ok(None);
    }
    let mut names: Vec<String> = fs::read_dir(recipe_dir)
        .with_context(|| format!("Failed to read {}", recipe_dir.display()))?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| {
            let upper = n.to_uppercase();
            upper.starts_with("LICENSE") || upper.starts_with("COPYING")
        })
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

impl MiniMigrator for LicenseMigrator {
    fn name(&self) -> &'static str {
        "LicenseMigrator"
    }

    fn phase(&self) -> Phase {
        Phase::Post
    }

    fn migrate(&self, feedstock_dir: &Path) -> Result<bool> {
        let meta = meta_yaml_path(feedstock_dir);
        let shipped = match meta.parent() {
            Some(recipe_dir) => shipped_license_file(recipe_dir)?,
            None => None,
        };
        rewrite(&meta, |text| {
            let mut out = LICENSE_LINE
                .replace(text, |caps: &regex::Captures<'_>| match spdx_license(&caps[3]) {
                    Some(id) if !caps[3].contains("{{") => format!("{}{id}{}", &caps[1], &caps[5]),
                    _ => caps[0].to_string(),
                })
                .into_owned();
            if let Some(file) = shipped.as_deref() {
                let insertion = LICENSE_LINE.captures(&out).map(|caps| {
                    let indent: String = caps[1].chars().take_while(|c| c.is_whitespace()).collect();
                    (caps.get(0).map_or(0, |m| m.end()), indent)
                });
                if let (false, Some((at, indent))) = (LICENSE_FILE_KEY.is_match(&out), insertion) {
                    out.insert_str(at, &format!("\n{indent}license_file: {file}"));
                }
            }
            out
        })
    }
}

/// Drops `conda-forge.yml` keys that are no longer honored
pub struct CondaForgeYamlCleanup;

/// Keys removed from `conda-forge.yml`
pub const DEPRECATED_CONDA_FORGE_YML_KEYS: [&str; 5] =
    ["compiler_stack", "max_py_ver", "max_r_ver", "min_py_ver", "min_r_ver"];

impl MiniMigrator for CondaForgeYamlCleanup {
    fn name(&self) -> &'static str {
        "CondaForgeYamlCleanup"
    }

    fn phase(&self) -> Phase {
        Phase::Post
    }

    fn migrate(&self, feedstock_dir: &Path) -> Result<bool> {
        let path = feedstock_dir.join("conda-forge.yml");
        if !path.exists() {
            return Ok(false);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let Ok(serde_yaml::Value::Mapping(mut config)) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
            return Ok(false);
        };

        let before = config.len();
        config.retain(|key, _| {
            key.as_str()
                .map_or(true, |k| !DEPRECATED_CONDA_FORGE_YML_KEYS.contains(&k))
        });
        if config.len() == before {
            return Ok(false);
        }

        let out = if config.is_empty() {
            "{}\n".to_string()
        } else {
            serde_yaml::to_string(&config).context("Failed to serialize conda-forge.yml")?
        };
        fs::write(&path, out).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(true)
    }
}

/// Inlines and removes `hash_type`, `hash_value` and `file_ext` set-variables
pub struct ExtraJinja2KeysCleanup;

static EXTRA_SET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*\{%-?\s*set\s+(hash_type|hash_value|file_ext)\s*=\s*["']([^"']*)["']\s*-?%\}[ \t]*\r?\n?"#)
        .expect("Invalid set regex")
});

impl MiniMigrator for ExtraJinja2KeysCleanup {
    fn name(&self) -> &'static str {
        "ExtraJinja2KeysCleanup"
    }

    fn phase(&self) -> Phase {
        Phase::Post
    }

    fn migrate(&self, feedstock_dir: &Path) -> Result<bool> {
        rewrite(&meta_yaml_path(feedstock_dir), |text| {
            let values: Vec<(String, String)> = EXTRA_SET
                .captures_iter(text)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect();
            let mut out = EXTRA_SET.replace_all(text, "").into_owned();
            for (var, value) in values {
                let reference = Regex::new(&format!(r"\{{\{{\s*{var}\s*\}}\}}"));
                if let Ok(reference) = reference {
                    out = reference.replace_all(&out, regex::NoExpand(&value)).into_owned();
                }
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn feedstock(meta: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("recipe")).unwrap();
        fs::write(meta_yaml_path(dir.path()), meta).unwrap();
        dir
    }

    fn meta(dir: &TempDir) -> String {
        fs::read_to_string(meta_yaml_path(dir.path())).unwrap()
    }

    #[test]
    fn test_jinja_vars_cleanup() {
        let dir = feedstock("name: {{name}}\nv: {{ version }}\nx: {{a|lower}}\n");
        assert!(Jinja2VarsCleanup.migrate(dir.path()).unwrap());
        assert_eq!(meta(&dir), "name: {{ name }}\nv: {{ version }}\nx: {{ a|lower }}\n");
        assert!(!Jinja2VarsCleanup.migrate(dir.path()).unwrap());
    }

    #[test]
    fn test_pip_migrator() {
        let dir = feedstock("build:\n  script: python setup.py install --single-version-externally-managed\n");
        assert!(PipMigrator.migrate(dir.path()).unwrap());
        assert_eq!(meta(&dir), format!("build:\n  script: {PIP_INSTALL}\n"));
        assert!(!PipMigrator.migrate(dir.path()).unwrap());
    }

    #[test]
    fn test_spdx_license_spellings() {
        assert_eq!(spdx_license("BSD 3-Clause"), Some("BSD-3-Clause"));
        assert_eq!(spdx_license("MIT License"), Some("MIT"));
        assert_eq!(spdx_license("Apache 2.0"), Some("Apache-2.0"));
        assert_eq!(spdx_license("GPLv3+"), Some("GPL-3.0-or-later"));
        assert_eq!(spdx_license("Proprietary"), None);
    }

    #[test]
    fn test_license_migrator() {
        let dir = feedstock("about:\n  home: https://example.org\n  license: 'BSD 3-Clause'  # upstream\n  summary: x\n");
        fs::write(dir.path().join("recipe/LICENSE.txt"), "BSD\n").unwrap();
        assert!(LicenseMigrator.migrate(dir.path()).unwrap());
        assert_eq!(
            meta(&dir),
            "about:\n  home: https://example.org\n  license: BSD-3-Clause  # upstream\n  license_file: LICENSE.txt\n  summary: x\n"
        );
        assert!(!LicenseMigrator.migrate(dir.path()).unwrap());

        let unknown = feedstock("about:\n  license: Proprietary\n  license_family: OTHER\n");
        assert!(!LicenseMigrator.migrate(unknown.path()).unwrap());
    }

    #[test]
    fn test_conda_forge_yml_cleanup() {
        let dir = feedstock("");
        let path = dir.path().join("conda-forge.yml");
        fs::write(&path, "compiler_stack: comp7\nmax_py_ver: '37'\n").unwrap();
        assert!(CondaForgeYamlCleanup.migrate(dir.path()).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");

        fs::write(&path, "provider:\n  win: azure\n").unwrap();
        assert!(!CondaForgeYamlCleanup.migrate(dir.path()).unwrap());
    }

    #[test]
    fn test_extra_jinja_keys_cleanup() {
        let dir = feedstock(
            "{% set version = \"1.0\" %}\n{% set hash_type = \"sha256\" %}\n{% set hash_value = \"abc\" %}\nsource:\n  {{ hash_type }}: {{ hash_value }}\n",
        );
        assert!(ExtraJinja2KeysCleanup.migrate(dir.path()).unwrap());
        assert_eq!(meta(&dir), "{% set version = \"1.0\" %}\nsource:\n  sha256: abc\n");
    }

    #[test]
    fn test_phases() {
        let phases: Vec<Phase> = default_piggy_backs().iter().map(|m| m.phase()).collect();
        assert_eq!(phases, vec![Phase::Pre, Phase::Pre, Phase::Post, Phase::Post, Phase::Post]);
    }
}
