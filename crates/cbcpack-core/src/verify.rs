//! Verifier: existence, linkage, execution, functional and portability checks.
//!
//! Only a missing primary executable raises. Every other outcome, including
//! timeouts and tool failures, is recorded in the report as a soft result.

use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::artifact::ArtifactSet;
use crate::config::BuildConfiguration;
use crate::error::VerificationError;
use crate::linkage::{LinkageInfo, LinkageInspector};
use crate::lp::{parse_solution, LpProblem, SolutionStatus, SAMPLE_OPTIMUM, TOLERANCE};
use crate::obs;
use crate::report::{CheckKind, CheckResult, VerificationReport};
use crate::runner::{CommandRunner, CommandSpec};

const SAMPLE_LP_FILE: &str = "sample.lp";
const SAMPLE_SOLUTION_FILE: &str = "sample.sol";

/// Mount point of the binary directory inside portability containers.
const CONTAINER_MOUNT: &str = "/opt/cbcpack";

/// Verifies an installed artifact set.
pub struct Verifier<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BuildConfiguration,
}

impl<'a> Verifier<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BuildConfiguration) -> Self {
        Self { runner, config }
    }

    /// Run every check in order and produce a report.
    pub async fn verify(
        &self,
        artifacts: &ArtifactSet,
    ) -> Result<VerificationReport, VerificationError> {
        let binary = self.primary_binary(artifacts);
        let mut report = VerificationReport::new(
            Uuid::new_v4().to_string(),
            self.config.digest(),
            binary.clone(),
        );

        // Structural check: short-circuits before any soft check.
        let exists = self.check_existence(&binary)?;
        self.record(&mut report, exists);

        let (linkage_check, info) = self.check_linkage(&binary).await;
        report.linkage = Some(info.linkage);
        report.dependencies = info.dependencies.clone();
        let accepted = linkage_check.passed();
        self.record(&mut report, linkage_check);

        let execution = self.check_execution(&binary).await;
        self.record(&mut report, execution);

        let (functional, objective) = self.check_functional(&binary).await?;
        report.objective = objective;
        self.record(&mut report, functional);

        for check in self.check_portability(&binary, accepted).await {
            self.record(&mut report, check);
        }

        info!(
            run_id = %report.run_id,
            all_passed = report.all_passed(),
            "Verification finished"
        );
        Ok(report)
    }

    fn record(&self, report: &mut VerificationReport, check: CheckResult) {
        obs::emit_check_recorded(check.kind.name(), check.status, &check.detail);
        report.record(check);
    }

    /// The primary executable: from the artifact set when present, else the
    /// path it is expected at under the prefix.
    fn primary_binary(&self, artifacts: &ArtifactSet) -> PathBuf {
        artifacts
            .executable(crate::artifact::PRIMARY_EXECUTABLE)
            .map(|a| a.path.clone())
            .unwrap_or_else(|| self.config.primary_executable())
    }

    /// Does the primary executable exist under the install path?
    pub fn check_existence(&self, binary: &Path) -> Result<CheckResult, VerificationError> {
        if binary.is_file() {
            Ok(CheckResult::pass(
                CheckKind::BinaryExists,
                format!("found {}", binary.display()),
            ))
        } else {
            Err(VerificationError::MissingBinary {
                path: binary.to_path_buf(),
            })
        }
    }

    /// Classify the binary and judge it against the configured strictness.
    pub async fn check_linkage(&self, binary: &Path) -> (CheckResult, LinkageInfo) {
        let info = LinkageInspector::new(self.runner).inspect(binary).await;
        let strictness = self.config.effective_strictness();
        let detail = if info.dependencies.is_empty() {
            format!("{} (strictness {strictness})", info.linkage)
        } else {
            format!(
                "{} (strictness {strictness}): {}",
                info.linkage,
                info.dependencies.join(", ")
            )
        };
        let check = if strictness.accepts(info.linkage) {
            CheckResult::pass(CheckKind::IsStatic, detail)
        } else {
            CheckResult::fail(CheckKind::IsStatic, detail)
        };
        (check, info)
    }

    /// Invoke the binary with the configured arguments under a timeout.
    pub async fn check_execution(&self, binary: &Path) -> CheckResult {
        let spec = CommandSpec::new(binary.to_string_lossy())
            .args(self.config.exec_args.iter().cloned())
            .timeout_secs(self.config.exec_timeout_secs);
        match self.runner.run(&spec).await {
            Ok(output) if output.timed_out => CheckResult::fail(
                CheckKind::RunsWithoutError,
                format!("timed out after {}s", self.config.exec_timeout_secs),
            ),
            Ok(output) if output.passed() => CheckResult::pass(
                CheckKind::RunsWithoutError,
                first_line(&output.stdout)
                    .map(|l| format!("exit 0: {l}"))
                    .unwrap_or_else(|| "exit 0".to_string()),
            ),
            Ok(output) => CheckResult::fail(
                CheckKind::RunsWithoutError,
                format!("exit {}: {}", output.exit_code, output.diagnostics()),
            ),
            Err(err) => CheckResult::fail(CheckKind::RunsWithoutError, err.to_string()),
        }
    }

    /// Solve the sample LP and check the objective.
    ///
    /// The objective is recomputed from the parsed assignment so the result
    /// does not depend on how the solver signs maximisation objectives.
    /// Stale solution files are removed first; repeated runs are independent.
    pub async fn check_functional(
        &self,
        binary: &Path,
    ) -> Result<(CheckResult, Option<f64>), VerificationError> {
        let dir = self.config.verify_dir();
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let problem = LpProblem::sample();
        let lp_path = dir.join(SAMPLE_LP_FILE);
        let sol_path = dir.join(SAMPLE_SOLUTION_FILE);
        tokio::fs::write(&lp_path, problem.to_lp_string())
            .await
            .map_err(io_err(&lp_path))?;
        if sol_path.exists() {
            tokio::fs::remove_file(&sol_path)
                .await
                .map_err(io_err(&sol_path))?;
        }

        let spec = CommandSpec::new(binary.to_string_lossy())
            .arg(lp_path.to_string_lossy())
            .arg("solve")
            .arg("solu")
            .arg(sol_path.to_string_lossy())
            .current_dir(&dir);
        let fail = |detail: String| -> Result<(CheckResult, Option<f64>), VerificationError> {
            Ok((
                CheckResult::fail(CheckKind::ProducesExpectedSolution, detail),
                None,
            ))
        };

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(err) => return fail(err.to_string()),
        };
        if !output.passed() {
            return fail(format!("solver exited {}: {}", output.exit_code, output.diagnostics()));
        }

        let text = match tokio::fs::read_to_string(&sol_path).await {
            Ok(text) => text,
            Err(err) => return fail(format!("no solution file {}: {err}", sol_path.display())),
        };
        let solution = match parse_solution(&text) {
            Ok(solution) => solution,
            Err(err) => return fail(format!("unparseable solution: {err}")),
        };

        let objective = problem.evaluate(&solution.values);
        let assignment = solution
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");

        if solution.status != SolutionStatus::Optimal {
            return Ok((
                CheckResult::fail(
                    CheckKind::ProducesExpectedSolution,
                    format!("status {:?} ({assignment})", solution.status),
                ),
                objective.is_finite().then_some(objective),
            ));
        }
        if !objective.is_finite() || !problem.is_feasible(&solution.values) {
            return fail(format!("infeasible or non-finite assignment ({assignment})"));
        }
        let check = if (objective - SAMPLE_OPTIMUM).abs() <= TOLERANCE {
            CheckResult::pass(
                CheckKind::ProducesExpectedSolution,
                format!("optimal objective {objective} ({assignment})"),
            )
        } else {
            CheckResult::fail(
                CheckKind::ProducesExpectedSolution,
                format!("objective {objective}, expected {SAMPLE_OPTIMUM} ({assignment})"),
            )
        };
        Ok((check, Some(objective)))
    }

    /// Run the binary inside each configured container image.
    ///
    /// Skipped unless the linkage check accepted the binary; a dynamic binary
    /// is not expected to run on a foreign distribution.
    pub async fn check_portability(&self, binary: &Path, linkage_accepted: bool) -> Vec<CheckResult> {
        if self.config.portability_images.is_empty() {
            return Vec::new();
        }
        if !linkage_accepted {
            return self
                .config
                .portability_images
                .iter()
                .map(|image| {
                    CheckResult::skipped(CheckKind::Portable, "binary is not static")
                        .with_target(image.as_str())
                })
                .collect();
        }

        let (Some(bin_dir), Some(exe)) = (binary.parent(), binary.file_name()) else {
            return vec![CheckResult::fail(
                CheckKind::Portable,
                format!("cannot mount {}", binary.display()),
            )];
        };
        let mount = format!("{}:{CONTAINER_MOUNT}:ro", bin_dir.display());
        let in_container = format!("{CONTAINER_MOUNT}/{}", exe.to_string_lossy());

        let mut checks = Vec::new();
        for image in &self.config.portability_images {
            let spec = CommandSpec::new(self.config.container_engine.as_str())
                .args(["run", "--rm", "-v", mount.as_str(), image.as_str(), in_container.as_str()])
                .args(self.config.exec_args.iter().cloned())
                .timeout_secs(self.config.portability_timeout_secs);
            let check = match self.runner.run(&spec).await {
                Ok(output) if output.passed() => {
                    CheckResult::pass(CheckKind::Portable, "runs")
                }
                Ok(output) => CheckResult::fail(CheckKind::Portable, output.diagnostics()),
                Err(err) => CheckResult::fail(CheckKind::Portable, err.to_string()),
            };
            checks.push(check.with_target(image.as_str()));
        }
        checks
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> VerificationError {
    let path = path.to_path_buf();
    move |source| VerificationError::Io { path, source }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;
    use crate::linkage::{Linkage, LinkageStrictness};
    use crate::report::CheckStatus;
    use crate::runner::CommandOutput;

    const OPTIMAL: &str = "Optimal - objective value 4.00000000\n      0 x   2   0\n      1 y   2   0\n";

    fn config_in(dir: &Path) -> BuildConfiguration {
        BuildConfiguration {
            prefix: dir.join("prefix"),
            work_dir: dir.join("work"),
            ..Default::default()
        }
    }

    fn install_binary(config: &BuildConfiguration) -> ArtifactSet {
        let bin = config.bin_dir();
        std::fs::create_dir_all(&bin).unwrap();
        let cbc = bin.join("cbc");
        std::fs::write(&cbc, b"\x7fELF").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cbc, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ArtifactSet::collect(&config.prefix).unwrap()
    }

    /// Writes `solution` to the file following `solu` in the arguments.
    fn write_solution(solution: &'static str) -> impl Fn(&CommandSpec) + Send + Sync + 'static {
        move |spec: &CommandSpec| {
            if let Some(pos) = spec.args.iter().position(|a| a == "solu") {
                std::fs::write(&spec.args[pos + 1], solution).unwrap();
            }
        }
    }

    fn solving_runner(solution: &'static str) -> FakeRunner {
        FakeRunner::new()
            .on("ldd", &[], CommandOutput::failed(1, "\tnot a dynamic executable"))
            .on_with("cbc", &["solve"], CommandOutput::ok(""), write_solution(solution))
            .on("cbc", &["-quit"], CommandOutput::ok("Welcome to the CBC MILP Solver\nVersion: 2.10.11\n"))
    }

    #[tokio::test]
    async fn test_missing_binary_is_structural_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = ArtifactSet::collect(&config.prefix).unwrap();
        let runner = FakeRunner::new();

        let err = Verifier::new(&runner, &config)
            .verify(&artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::MissingBinary { .. }));
        // No soft check ran.
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_checks_pass_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let runner = solving_runner(OPTIMAL);

        let report = Verifier::new(&runner, &config)
            .verify(&artifacts)
            .await
            .expect("verify failed");

        let kinds: Vec<CheckKind> = report.checks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CheckKind::BinaryExists,
                CheckKind::IsStatic,
                CheckKind::RunsWithoutError,
                CheckKind::ProducesExpectedSolution,
            ]
        );
        assert!(report.all_passed(), "report: {report}");
        assert_eq!(report.objective, Some(4.0));
        assert_eq!(report.linkage, Some(Linkage::Static));
        assert!(report
            .check(CheckKind::RunsWithoutError)
            .unwrap()
            .detail
            .contains("Welcome"));
    }

    #[tokio::test]
    async fn test_execution_timeout_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let timed_out = CommandOutput {
            timed_out: true,
            exit_code: -1,
            ..CommandOutput::ok("")
        };
        let runner = FakeRunner::new()
            .on_with("cbc", &["solve"], CommandOutput::ok(""), write_solution(OPTIMAL))
            .on("cbc", &["-quit"], timed_out);

        let report = Verifier::new(&runner, &config)
            .verify(&artifacts)
            .await
            .expect("verify failed");

        let exec = report.check(CheckKind::RunsWithoutError).unwrap();
        assert_eq!(exec.status, CheckStatus::Fail);
        assert!(exec.detail.contains("timed out"));
        assert!(report.structural_success());
        assert!(report.check(CheckKind::ProducesExpectedSolution).unwrap().passed());
        let exec_call = runner
            .calls_to("cbc")
            .into_iter()
            .find(|c| c.has_arg_containing("-quit"))
            .unwrap();
        assert_eq!(exec_call.timeout_secs, config.exec_timeout_secs);
    }

    #[tokio::test]
    async fn test_dynamic_binary_fails_linkage_softly() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let runner = FakeRunner::new()
            .on(
                "ldd",
                &[],
                CommandOutput::ok("\tlibstdc++.so.6 => /usr/lib/libstdc++.so.6 (0x1)\n\tlibc.so.6 => /lib/libc.so.6 (0x2)\n"),
            )
            .on_with("cbc", &["solve"], CommandOutput::ok(""), write_solution(OPTIMAL));

        let report = Verifier::new(&runner, &config)
            .verify(&artifacts)
            .await
            .expect("verify failed");

        let linkage = report.check(CheckKind::IsStatic).unwrap();
        assert_eq!(linkage.status, CheckStatus::Fail);
        assert!(linkage.detail.contains("libstdc++.so.6"));
        assert_eq!(report.linkage, Some(Linkage::Dynamic));
        assert!(report.structural_success());
    }

    #[tokio::test]
    async fn test_partially_static_depends_on_strictness() {
        let dir = tempfile::tempdir().unwrap();
        let partial = CommandOutput::ok("\tlibc.so.6 => /lib/libc.so.6 (0x2)\n\t/lib64/ld-linux-x86-64.so.2 (0x3)\n");

        let lenient = BuildConfiguration {
            strictness: Some(LinkageStrictness::AllowLibc),
            ..config_in(dir.path())
        };
        let runner = FakeRunner::new().on("ldd", &[], partial.clone());
        let (check, info) = Verifier::new(&runner, &lenient)
            .check_linkage(Path::new("/opt/cbc/bin/cbc"))
            .await;
        assert_eq!(info.linkage, Linkage::PartiallyStatic);
        assert!(check.passed());

        let strict = BuildConfiguration {
            strictness: Some(LinkageStrictness::Strict),
            ..config_in(dir.path())
        };
        let (check, _) = Verifier::new(&runner, &strict)
            .check_linkage(Path::new("/opt/cbc/bin/cbc"))
            .await;
        assert!(!check.passed());
    }

    #[tokio::test]
    async fn test_functional_check_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let binary = artifacts.executable("cbc").unwrap().path.clone();
        let runner = solving_runner(OPTIMAL);
        let verifier = Verifier::new(&runner, &config);

        let (first, first_obj) = verifier.check_functional(&binary).await.unwrap();
        let (second, second_obj) = verifier.check_functional(&binary).await.unwrap();
        assert!(first.passed() && second.passed());
        assert_eq!(first_obj, second_obj);
        assert_eq!(first_obj, Some(SAMPLE_OPTIMUM));
        let lp = std::fs::read_to_string(config.verify_dir().join(SAMPLE_LP_FILE)).unwrap();
        assert!(lp.contains("Maximize"));
    }

    #[tokio::test]
    async fn test_functional_check_rejects_wrong_objective() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let binary = artifacts.executable("cbc").unwrap().path.clone();
        let runner = solving_runner("Optimal - objective value 3\n 0 x 1 0\n 1 y 2 0\n");

        let (check, objective) = Verifier::new(&runner, &config)
            .check_functional(&binary)
            .await
            .unwrap();
        assert!(!check.passed());
        assert_eq!(objective, Some(3.0));
    }

    #[tokio::test]
    async fn test_functional_check_missing_solution_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let artifacts = install_binary(&config);
        let binary = artifacts.executable("cbc").unwrap().path.clone();
        let runner = FakeRunner::new();

        let (check, objective) = Verifier::new(&runner, &config)
            .check_functional(&binary)
            .await
            .unwrap();
        assert!(!check.passed());
        assert!(check.detail.contains("no solution file"));
        assert_eq!(objective, None);
    }

    #[tokio::test]
    async fn test_portability_runs_each_image() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfiguration {
            portability_images: vec!["alpine:3.19".to_string(), "debian:bookworm-slim".to_string()],
            container_engine: "podman".to_string(),
            ..config_in(dir.path())
        };
        let runner = FakeRunner::new().on(
            "podman",
            &["debian"],
            CommandOutput::failed(127, "exec /opt/cbcpack/cbc: no such file or directory"),
        );

        let checks = Verifier::new(&runner, &config)
            .check_portability(Path::new("/opt/cbc/bin/cbc"), true)
            .await;
        assert_eq!(checks.len(), 2);
        assert!(checks[0].passed());
        assert_eq!(checks[0].target.as_deref(), Some("alpine:3.19"));
        assert!(!checks[1].passed());

        let calls = runner.calls_to("podman");
        assert_eq!(
            calls[0].args[..5],
            ["run", "--rm", "-v", "/opt/cbc/bin:/opt/cbcpack:ro", "alpine:3.19"]
        );
        assert_eq!(calls[0].args[5], "/opt/cbcpack/cbc");
    }

    #[tokio::test]
    async fn test_portability_skipped_for_rejected_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfiguration {
            portability_images: vec!["alpine:3.19".to_string()],
            ..config_in(dir.path())
        };
        let runner = FakeRunner::new();
        let checks = Verifier::new(&runner, &config)
            .check_portability(Path::new("/opt/cbc/bin/cbc"), false)
            .await;
        assert_eq!(checks[0].status, CheckStatus::Skipped);
        assert!(runner.calls().is_empty());
    }
}
