//! Scripted command runner (testing only)
//!
//! `FakeRunner` satisfies the [`CommandRunner`] contract without starting
//! processes. Rules are matched in insertion order; unmatched commands succeed
//! with empty output. Every invocation is recorded.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

/// Side effect applied when a rule matches, e.g. creating installed files.
pub type Effect = Box<dyn Fn(&CommandSpec) + Send + Sync>;

enum Response {
    Output(CommandOutput),
    SpawnError,
}

struct Rule {
    program: String,
    fragments: Vec<String>,
    response: Response,
    effect: Option<Effect>,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        program_matches(&self.program, &spec.program)
            && self.fragments.iter().all(|f| spec.has_arg_containing(f))
    }
}

/// `program` matches by exact name or by final path component, so a rule
/// for `configure` matches `/work/src/Cbc/configure`.
fn program_matches(rule: &str, program: &str) -> bool {
    program == rule || program.ends_with(&format!("/{rule}"))
}

/// In-memory command runner.
#[derive(Default)]
pub struct FakeRunner {
    rules: Vec<Rule>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `program` (with every fragment present in some argument).
    pub fn on(self, program: &str, fragments: &[&str], output: CommandOutput) -> Self {
        self.push(program, fragments, Response::Output(output), None)
    }

    /// Like [`FakeRunner::on`], also running `effect` on each match.
    pub fn on_with<F>(
        self,
        program: &str,
        fragments: &[&str],
        output: CommandOutput,
        effect: F,
    ) -> Self
    where
        F: Fn(&CommandSpec) + Send + Sync + 'static,
    {
        self.push(
            program,
            fragments,
            Response::Output(output),
            Some(Box::new(effect)),
        )
    }

    /// Fail to spawn `program`, as if it were not installed.
    pub fn spawn_error(self, program: &str, fragments: &[&str]) -> Self {
        self.push(program, fragments, Response::SpawnError, None)
    }

    fn push(
        mut self,
        program: &str,
        fragments: &[&str],
        response: Response,
        effect: Option<Effect>,
    ) -> Self {
        self.rules.push(Rule {
            program: program.to_string(),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            response,
            effect,
        });
        self
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded invocations of `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| program_matches(program, &c.program))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        if spec.program.is_empty() {
            return Err(RunnerError::EmptyProgram);
        }
        self.calls.lock().unwrap().push(spec.clone());

        let Some(rule) = self.rules.iter().find(|r| r.matches(spec)) else {
            return Ok(CommandOutput::ok(""));
        };
        if let Some(effect) = &rule.effect {
            effect(spec);
        }
        match &rule.response {
            Response::Output(output) => Ok(output.clone()),
            Response::SpawnError => Err(RunnerError::Spawn {
                program: spec.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let runner = FakeRunner::new()
            .on("make", &["install"], CommandOutput::failed(2, "install failed"))
            .on("make", &[], CommandOutput::ok("built"));

        let install = runner
            .run(&CommandSpec::new("make").arg("install"))
            .await
            .unwrap();
        assert_eq!(install.exit_code, 2);

        let build = runner
            .run(&CommandSpec::new("make").arg("-j4"))
            .await
            .unwrap();
        assert_eq!(build.stdout, "built");
        assert_eq!(runner.calls_to("make").len(), 2);
    }

    #[tokio::test]
    async fn test_program_matches_path_suffix() {
        let runner = FakeRunner::new().on("configure", &[], CommandOutput::failed(77, "unsupported"));
        let output = runner
            .run(&CommandSpec::new("/work/src/Cbc/configure"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 77);
    }

    #[tokio::test]
    async fn test_unmatched_command_succeeds() {
        let runner = FakeRunner::new();
        let output = runner.run(&CommandSpec::new("strip")).await.unwrap();
        assert!(output.passed());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_error_and_effect() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let runner = FakeRunner::new()
            .spawn_error("ldd", &[])
            .on_with("git", &["clone"], CommandOutput::ok(""), move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });

        assert!(runner.run(&CommandSpec::new("ldd")).await.is_err());
        runner
            .run(&CommandSpec::new("git").arg("clone"))
            .await
            .unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
