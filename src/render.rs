// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! External tools the pipeline calls: the re-render tool, the solvability
//! checker, and the upstream source hasher
//!
//! Shell commands run with a hard time bound; output pipes are drained on
//! their own threads so a chatty tool cannot block on a full pipe.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// How long to wait for pipe readers after the child exits
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one bounded shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit status was zero
    pub success: bool,
    /// Exit code, absent when killed
    pub exit_code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Killed for exceeding the time bound
    pub timed_out: bool,
    /// Wall-clock time taken
    pub duration: Duration,
}

/// Run `command` through the shell in `working_dir`, killing it after `timeout`
pub fn run_shell_with_timeout(command: &str, working_dir: &Path, timeout: Duration) -> Result<CommandOutcome> {
    let start = Instant::now();
    let mut child = spawn_shell(command, working_dir)?;

    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    match child.stdout.take() {
        Some(stdout) => {
            thread::spawn(move || stdout_tx.send(read_stream(stdout)));
        }
        None => {
            let _ = stdout_tx.send(String::new());
        }
    }
    match child.stderr.take() {
        Some(stderr) => {
            thread::spawn(move || stderr_tx.send(read_stream(stderr)));
        }
        None => {
            let _ = stderr_tx.send(String::new());
        }
    }

    let status = child
        .wait_timeout(timeout)
        .with_context(|| format!("Failed to wait for command: {command}"))?;
    let timed_out = status.is_none();
    if timed_out {
        kill(&mut child);
    }

    let stdout = stdout_rx.recv_timeout(OUTPUT_COLLECTION_TIMEOUT).unwrap_or_default();
    let mut stderr = stderr_rx.recv_timeout(OUTPUT_COLLECTION_TIMEOUT).unwrap_or_default();
    if timed_out {
        stderr.push_str(&format!("\n[killed after {}s]", timeout.as_secs()));
    }

    Ok(CommandOutcome {
        success: status.is_some_and(|s| s.success()),
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn spawn_shell(command: &str, working_dir: &Path) -> Result<Child> {
    let mut cmd = if cfg!(target_family = "unix") {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    } else {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    };
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn command: {command}"))
}

fn read_stream<R: Read>(mut stream: R) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

// =============================================================================
// Re-render
// =============================================================================

/// Regenerates a feedstock's derived files after a recipe change
pub trait Renderer {
    /// Re-render the working copy at `workdir`
    fn render(&self, workdir: &Path) -> Result<CommandOutcome>;

    /// Version of the render tool, recorded on successful attempts
    fn tool_version(&self) -> Option<String> {
        None
    }

    /// Version of the pinning set the tool renders against
    fn pinning_version(&self) -> Option<String> {
        None
    }
}

/// [`Renderer`] that runs a configured shell command
#[derive(Debug, Clone)]
pub struct ShellRenderer {
    command: String,
    timeout: Duration,
    version_command: Option<String>,
    pinning_command: Option<String>,
}

impl ShellRenderer {
    /// Run `command` with a `timeout` bound
    #[must_use]
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
            version_command: None,
            pinning_command: None,
        }
    }

    /// Also report the tool version via `command`
    #[must_use]
    pub fn with_version_command(mut self, command: &str) -> Self {
        self.version_command = Some(command.to_string());
        self
    }

    /// Also report the pinning set version via `command`
    #[must_use]
    pub fn with_pinning_command(mut self, command: &str) -> Self {
        self.pinning_command = Some(command.to_string());
        self
    }
}

/// Trimmed stdout of a short informational command, `None` on any failure
fn probe_version(command: &str) -> Option<String> {
    let dir = std::env::temp_dir();
    match run_shell_with_timeout(command, &dir, Duration::from_secs(60)) {
        Ok(outcome) if outcome.success => Some(outcome.stdout.trim().to_string()),
        Ok(outcome) => {
            tracing::debug!("`{command}` failed: {}", outcome.stderr.trim());
            None
        }
        Err(err) => {
            tracing::debug!("`{command}` failed: {err:#}");
            None
        }
    }
}

/// Version out of a package listing: the first entry's `version` of a JSON
/// array, or the plain text when the output is not such a listing
#[must_use]
pub fn parse_pinning_version(output: &str) -> Option<String> {
    let text = output.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(entries)) => entries
            .first()
            .and_then(|e| e.get("version"))
            .and_then(serde_json::Value::as_str)
            .map(String::from),
        Ok(_) | Err(_) => Some(text.to_string()),
    }
}

impl Renderer for ShellRenderer {
    fn render(&self, workdir: &Path) -> Result<CommandOutcome> {
        tracing::info!("Re-rendering with `{}`", self.command);
        run_shell_with_timeout(&self.command, workdir, self.timeout)
    }

    fn tool_version(&self) -> Option<String> {
        probe_version(self.version_command.as_deref()?)
    }

    fn pinning_version(&self) -> Option<String> {
        parse_pinning_version(&probe_version(self.pinning_command.as_deref()?)?)
    }
}

// =============================================================================
// Solvability
// =============================================================================

/// Decides whether a rendered recipe's requirements can be satisfied
pub trait SolvabilityChecker {
    /// Check the working copy at `workdir`
    fn is_solvable(&self, workdir: &Path) -> Result<bool>;
}

/// [`SolvabilityChecker`] that runs a shell command; exit status zero means solvable
#[derive(Debug, Clone)]
pub struct ShellSolvabilityChecker {
    command: Option<String>,
    timeout: Duration,
}

impl ShellSolvabilityChecker {
    /// Without a command every recipe counts as solvable
    #[must_use]
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl SolvabilityChecker for ShellSolvabilityChecker {
    fn is_solvable(&self, workdir: &Path) -> Result<bool> {
        let Some(command) = &self.command else {
            tracing::debug!("No solvability command configured");
            return Ok(true);
        };
        let outcome = run_shell_with_timeout(command, workdir, self.timeout)?;
        if !outcome.success {
            tracing::warn!("Solvability check failed: {}", outcome.stderr.trim());
        }
        Ok(outcome.success)
    }
}

// =============================================================================
// Source hashing
// =============================================================================

/// Computes the checksum of an upstream source archive
pub trait SourceHasher {
    /// Hex digest of the content at `url` with algorithm `hash_type`
    fn hash(&self, url: &str, hash_type: &str) -> Result<String>;
}

/// [`SourceHasher`] that downloads the archive over HTTP
pub struct HttpSourceHasher {
    client: reqwest::blocking::Client,
}

impl HttpSourceHasher {
    /// Create a hasher with the standard HTTP time bounds
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(crate::github::HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(crate::github::HTTP_REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("feedstock-tick/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl SourceHasher for HttpSourceHasher {
    fn hash(&self, url: &str, hash_type: &str) -> Result<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Failed to download {url}"))?;
        if !response.status().is_success() {
            bail!("Failed to download {url}: HTTP {}", response.status().as_u16());
        }
        hash_reader(&mut response, hash_type).with_context(|| format!("Failed to hash {url}"))
    }
}

/// Hex digest of everything `reader` yields
pub fn hash_reader(reader: &mut impl Read, hash_type: &str) -> Result<String> {
    fn digest<D: Digest + std::io::Write>(reader: &mut impl Read) -> Result<String> {
        let mut hasher = D::new();
        std::io::copy(reader, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    match hash_type {
        "sha256" => digest::<Sha256>(reader),
        "sha512" => digest::<Sha512>(reader),
        "sha384" => digest::<Sha384>(reader),
        "sha224" => digest::<Sha224>(reader),
        other => bail!("Unsupported hash type: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shell_success_and_output() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell_with_timeout("echo hello", dir.path(), Duration::from_secs(10)).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_timeout_kills() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell_with_timeout("sleep 5", dir.path(), Duration::from_millis(200)).unwrap();
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_pinning_version() {
        let listing = r#"[{"name": "conda-forge-pinning", "version": "2024.03.05.09.12.47"}]"#;
        assert_eq!(parse_pinning_version(listing).as_deref(), Some("2024.03.05.09.12.47"));
        assert_eq!(parse_pinning_version("[]"), None);
        assert_eq!(parse_pinning_version("2024.03.05\n").as_deref(), Some("2024.03.05"));
        assert_eq!(parse_pinning_version("  "), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_renderer_reports_versions() {
        let renderer = ShellRenderer::new("true", Duration::from_secs(5))
            .with_version_command("echo 3.34.1")
            .with_pinning_command(r#"echo '[{"version": "2024.03.05"}]'"#);
        assert_eq!(renderer.tool_version().as_deref(), Some("3.34.1"));
        assert_eq!(renderer.pinning_version().as_deref(), Some("2024.03.05"));
        assert_eq!(ShellRenderer::new("true", Duration::from_secs(5)).pinning_version(), None);
    }

    #[test]
    fn test_unconfigured_checker_is_solvable() {
        let dir = TempDir::new().unwrap();
        let checker = ShellSolvabilityChecker::new(None, Duration::from_secs(1));
        assert!(checker.is_solvable(dir.path()).unwrap());
    }

    #[test]
    fn test_hash_reader() {
        let mut input: &[u8] = b"abc";
        assert_eq!(
            hash_reader(&mut input, "sha256").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(hash_reader(&mut input, "md5").is_err());
    }
}
