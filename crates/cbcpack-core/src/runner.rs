//! External process execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::error::RunnerError;

/// Number of trailing output lines kept as diagnostics.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// A fully specified external command.
///
/// Working directory and environment are explicit; nothing is inherited from
/// ambient process state beyond the parent's environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    pub args: Vec<String>,

    /// Working directory (inherits the parent's when unset).
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Timeout in seconds (0 = no timeout).
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout_secs: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Whether any argument contains `fragment`.
    pub fn has_arg_containing(&self, fragment: &str) -> bool {
        self.args.iter().any(|a| a.contains(fragment))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={} ", shell_quote(value))?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("'{value}'")
    } else {
        value.to_string()
    }
}

/// Captured result of a finished (or timed out) command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal or timed out).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the wall-clock timeout expired.
    pub timed_out: bool,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0,
            timed_out: false,
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0,
            timed_out: false,
        }
    }

    /// Whether the command exited 0 within its timeout.
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// stdout and stderr, joined.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }

    /// Trailing lines of the combined output, for error reports.
    pub fn diagnostics(&self) -> String {
        if self.timed_out {
            return format!("timed out after {} ms", self.duration_ms);
        }
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
        let tail = lines[start..].join("\n");
        if tail.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            tail
        }
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// Returns `Err` only when the process could not be started or awaited.
    /// Non-zero exits and timeouts are reported through [`CommandOutput`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;
}

/// Runner backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if spec.program.is_empty() {
            return Err(RunnerError::EmptyProgram);
        }

        let start = Instant::now();
        debug!(command = %spec, "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let waited = if spec.timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    // Dropping the future kills the child (kill_on_drop).
                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: String::new(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        timed_out: true,
                    });
                }
            }
        } else {
            child.wait_with_output().await
        };

        let output = waited.map_err(|source| RunnerError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_passed() {
        assert!(CommandOutput::ok("").passed());
        assert!(!CommandOutput::failed(1, "error").passed());

        let timed_out = CommandOutput {
            timed_out: true,
            ..CommandOutput::ok("")
        };
        assert!(!timed_out.passed());
    }

    #[test]
    fn test_diagnostics_keeps_tail() {
        let stderr: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let output = CommandOutput::failed(2, stderr);
        let diagnostics = output.diagnostics();
        assert!(diagnostics.contains("line 99"));
        assert!(!diagnostics.contains("line 10\n"));
        assert_eq!(diagnostics.lines().count(), DIAGNOSTIC_TAIL_LINES);
    }

    #[test]
    fn test_diagnostics_falls_back_to_exit_code() {
        assert_eq!(CommandOutput::failed(77, "").diagnostics(), "exited with code 77");
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::new("./configure")
            .arg("--prefix=/opt/cbc")
            .arg("LDFLAGS=-static -static-libgcc")
            .env("PKG_CONFIG_PATH", "/opt/cbc/lib/pkgconfig");
        assert_eq!(
            spec.to_string(),
            "PKG_CONFIG_PATH=/opt/cbc/lib/pkgconfig ./configure --prefix=/opt/cbc 'LDFLAGS=-static -static-libgcc'"
        );
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let spec = CommandSpec::new("echo").arg("hello");
        let output = SystemRunner.run(&spec).await.expect("execute failed");
        assert!(output.passed());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let output = SystemRunner
            .run(&CommandSpec::new("false"))
            .await
            .expect("execute failed");
        assert!(!output.passed());
        assert_ne!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_not_raised() {
        let spec = CommandSpec::new("sleep").arg("5").timeout_secs(1);
        let output = SystemRunner.run(&spec).await.expect("execute failed");
        assert!(output.timed_out);
        assert!(!output.passed());
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh")
            .args(["-c", "pwd; echo $CBCPACK_PROBE"])
            .current_dir(dir.path())
            .env("CBCPACK_PROBE", "probe-value");
        let output = SystemRunner.run(&spec).await.expect("execute failed");
        assert!(output.stdout.contains("probe-value"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.stdout.contains(canonical.to_string_lossy().as_ref()));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec::new("cbcpack-definitely-not-installed");
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
