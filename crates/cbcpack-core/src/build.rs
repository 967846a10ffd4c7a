//! Builder: configure, compile, install and strip with link-strategy fallback.
//!
//! The builder walks the ordered [`LinkStrategy`] sequence as a small retry
//! loop. Each attempt builds every package in its own out-of-tree build
//! directory; the first attempt that installs an expected executable wins.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::ArtifactSet;
use crate::config::BuildConfiguration;
use crate::error::BuildError;
use crate::fetch::SourceTree;
use crate::linkage::LinkageInspector;
use crate::obs;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::stage::{LinkStrategy, PipelineStage};

/// Outcome of one link strategy attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        step: PipelineStage,
        package: String,
        exit_code: i32,
        diagnostics: String,
    },
}

/// Record of one attempt in the fallback sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    pub strategy: LinkStrategy,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Strategy that produced the artifacts.
    pub strategy: LinkStrategy,

    /// Every attempt, in order, ending with the successful one.
    pub attempts: Vec<AttemptRecord>,

    pub artifacts: ArtifactSet,

    /// Executables that could not be stripped.
    pub strip_warnings: Vec<String>,
}

/// Builds the configured packages into the install prefix.
pub struct Builder<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BuildConfiguration,
}

impl<'a> Builder<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BuildConfiguration) -> Self {
        Self { runner, config }
    }

    /// Build `sources` (in build order, solver last).
    ///
    /// Fails with [`BuildError::Exhausted`] only after every strategy in the
    /// sequence has failed.
    pub async fn build(&self, sources: &[SourceTree]) -> Result<BuildOutcome, BuildError> {
        if sources.is_empty() {
            return Err(BuildError::NoSources);
        }

        let mut attempts = Vec::new();
        for &strategy in LinkStrategy::sequence(self.config.prefer_static) {
            info!(strategy = %strategy, "Attempting build");
            let start = Instant::now();

            match self.attempt(strategy, sources).await? {
                Ok(mut artifacts) => {
                    attempts.push(AttemptRecord {
                        strategy,
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    obs::emit_strategy_selected(strategy, attempts.len());

                    let strip_warnings = self.strip(&artifacts).await;
                    if self.config.strip {
                        // Stripping rewrites the files; digests are taken afterwards.
                        artifacts = self.collect()?;
                    }
                    artifacts.dynamic_fallback = strategy == LinkStrategy::Dynamic
                        && self.config.prefer_static;
                    self.classify(&mut artifacts).await;

                    return Ok(BuildOutcome {
                        strategy,
                        attempts,
                        artifacts,
                        strip_warnings,
                    });
                }
                Err(outcome) => {
                    if let AttemptOutcome::Failed {
                        step,
                        package,
                        exit_code,
                        ..
                    } = &outcome
                    {
                        obs::emit_attempt_failed(strategy, *step, package, *exit_code);
                    }
                    attempts.push(AttemptRecord {
                        strategy,
                        outcome,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        let (step, package, diagnostics) = match attempts.last().map(|a| &a.outcome) {
            Some(AttemptOutcome::Failed {
                step,
                package,
                diagnostics,
                ..
            }) => (*step, package.clone(), diagnostics.clone()),
            _ => (PipelineStage::Configure, String::new(), String::new()),
        };
        Err(BuildError::Exhausted {
            attempts,
            step,
            package,
            diagnostics,
        })
    }

    /// One pass over all packages. The inner `Err` is an ordinary failed
    /// attempt; the outer one is an unexpected failure.
    async fn attempt(
        &self,
        strategy: LinkStrategy,
        sources: &[SourceTree],
    ) -> Result<Result<ArtifactSet, AttemptOutcome>, BuildError> {
        let last = sources.len() - 1;
        for (index, source) in sources.iter().enumerate() {
            let name = source.package.name.as_str();
            let build_dir = self.config.build_dir(strategy, name);
            tokio::fs::create_dir_all(&build_dir)
                .await
                .map_err(|source| BuildError::Io {
                    path: build_dir.clone(),
                    source,
                })?;

            let steps = [
                (
                    PipelineStage::Configure,
                    configure_command(self.config, strategy, &source.path, &build_dir),
                ),
                (
                    PipelineStage::Compile,
                    compile_command(self.config, strategy, &build_dir, index == last),
                ),
                (PipelineStage::Install, install_command(&build_dir)),
            ];

            for (stage, spec) in steps {
                obs::emit_stage_started(stage, name);
                let output = self.runner.run(&spec).await?;
                obs::emit_stage_finished(stage, name, output.duration_ms, output.passed());
                if !output.passed() {
                    return Ok(Err(failed(stage, name, &output)));
                }
            }
        }

        let artifacts = self.collect()?;
        if !artifacts.is_valid() {
            return Ok(Err(AttemptOutcome::Failed {
                step: PipelineStage::Install,
                package: sources[last].package.name.clone(),
                exit_code: 0,
                diagnostics: format!(
                    "no expected executable installed under {:?}",
                    self.config.bin_dir()
                ),
            }));
        }
        Ok(Ok(artifacts))
    }

    async fn strip(&self, artifacts: &ArtifactSet) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.config.strip {
            return warnings;
        }
        for exe in artifacts.executables() {
            let name = exe.name();
            obs::emit_stage_started(PipelineStage::Strip, &name);
            // Spawn failures (no binutils) are warnings like non-zero exits.
            let (duration_ms, problem) = match self.runner.run(&strip_command(&exe.path)).await {
                Ok(output) if output.passed() => (output.duration_ms, None),
                Ok(output) => (output.duration_ms, Some(output.diagnostics())),
                Err(err) => (0, Some(err.to_string())),
            };
            obs::emit_stage_finished(PipelineStage::Strip, &name, duration_ms, problem.is_none());
            if let Some(problem) = problem {
                warn!(executable = %name, "strip failed: {problem}");
                warnings.push(format!("{name}: {problem}"));
            }
        }
        warnings
    }

    fn collect(&self) -> Result<ArtifactSet, BuildError> {
        ArtifactSet::collect(&self.config.prefix).map_err(|source| BuildError::Io {
            path: self.config.prefix.clone(),
            source,
        })
    }

    async fn classify(&self, artifacts: &mut ArtifactSet) {
        let inspector = LinkageInspector::new(self.runner);
        let paths: Vec<_> = artifacts.executables().map(|a| a.path.clone()).collect();
        for path in paths {
            let info = inspector.inspect(&path).await;
            info!(executable = ?path, linkage = %info.linkage, "Classified executable");
            artifacts.tag_linkage(&path, info.linkage);
        }
    }
}

fn failed(step: PipelineStage, package: &str, output: &CommandOutput) -> AttemptOutcome {
    AttemptOutcome::Failed {
        step,
        package: package.to_string(),
        exit_code: output.exit_code,
        diagnostics: output.diagnostics(),
    }
}

/// `<src>/configure` invocation for a package under a strategy.
pub fn configure_command(
    config: &BuildConfiguration,
    strategy: LinkStrategy,
    source_dir: &Path,
    build_dir: &Path,
) -> CommandSpec {
    let pkg_config_path = config.prefix.join("lib").join("pkgconfig");
    let mut spec = CommandSpec::new(source_dir.join("configure").to_string_lossy())
        .arg(format!("--prefix={}", config.prefix.display()))
        .arg("--disable-dependency-tracking")
        .args(
            config
                .disabled_dependencies
                .iter()
                .map(|dep| format!("--without-{dep}")),
        )
        .args(strategy.configure_args())
        .arg(format!("CFLAGS={}", config.opt_flags))
        .arg(format!("CXXFLAGS={}", config.opt_flags))
        .current_dir(build_dir)
        .env("PKG_CONFIG_PATH", pkg_config_path.to_string_lossy());
    if let Some(cc) = &config.cc {
        spec = spec.arg(format!("CC={cc}"));
    }
    if let Some(cxx) = &config.cxx {
        spec = spec.arg(format!("CXX={cxx}"));
    }
    spec
}

/// `make -j<jobs>`; the final package also gets the strategy's link flags.
pub fn compile_command(
    config: &BuildConfiguration,
    strategy: LinkStrategy,
    build_dir: &Path,
    links_final_binary: bool,
) -> CommandSpec {
    let mut spec = CommandSpec::new("make")
        .arg(format!("-j{}", config.jobs))
        .current_dir(build_dir);
    if links_final_binary {
        spec = spec.args(strategy.final_link_args());
    }
    spec
}

pub fn install_command(build_dir: &Path) -> CommandSpec {
    CommandSpec::new("make").arg("install").current_dir(build_dir)
}

pub fn strip_command(executable: &Path) -> CommandSpec {
    CommandSpec::new("strip")
        .arg("--strip-unneeded")
        .arg(executable.to_string_lossy())
}

/// Commands a strategy would run, in order, without running them.
pub fn plan(config: &BuildConfiguration, strategy: LinkStrategy) -> Vec<CommandSpec> {
    let packages: Vec<_> = config.packages().collect();
    let last = packages.len().saturating_sub(1);
    let mut commands = Vec::new();
    for (index, package) in packages.iter().enumerate() {
        let build_dir = config.build_dir(strategy, &package.name);
        commands.push(configure_command(
            config,
            strategy,
            &config.source_dir(package),
            &build_dir,
        ));
        commands.push(compile_command(config, strategy, &build_dir, index == last));
        commands.push(install_command(&build_dir));
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageSource;
    use crate::fakes::FakeRunner;
    use std::path::PathBuf;

    fn config_in(dir: &Path) -> BuildConfiguration {
        BuildConfiguration {
            prefix: dir.join("prefix"),
            work_dir: dir.join("work"),
            jobs: 4,
            ..Default::default()
        }
    }

    fn sources(config: &BuildConfiguration) -> Vec<SourceTree> {
        config
            .packages()
            .map(|p| SourceTree {
                package: p.clone(),
                path: config.source_dir(p),
                commit: None,
            })
            .collect()
    }

    #[cfg(unix)]
    fn install_cbc(prefix: PathBuf) -> impl Fn(&CommandSpec) + Send + Sync + 'static {
        move |_spec: &CommandSpec| {
            use std::os::unix::fs::PermissionsExt;
            let bin = prefix.join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            let cbc = bin.join("cbc");
            std::fs::write(&cbc, b"\x7fELF").unwrap();
            std::fs::set_permissions(&cbc, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn test_configure_translates_configuration() {
        let config = BuildConfiguration {
            cc: Some("musl-gcc".to_string()),
            ..config_in(Path::new("/tmp/cbcpack-test"))
        };
        let spec = configure_command(
            &config,
            LinkStrategy::Static,
            Path::new("/src/Cbc"),
            Path::new("/build/Cbc"),
        );
        assert_eq!(spec.program, "/src/Cbc/configure");
        assert_eq!(spec.cwd, Some(PathBuf::from("/build/Cbc")));
        assert!(spec.args.contains(&"--prefix=/tmp/cbcpack-test/prefix".to_string()));
        assert!(spec.args.contains(&"--without-lapack".to_string()));
        assert!(spec.args.contains(&"--without-blas".to_string()));
        assert!(spec.args.contains(&"--enable-static".to_string()));
        assert!(spec.args.contains(&"CXXFLAGS=-O2".to_string()));
        assert!(spec.args.contains(&"CC=musl-gcc".to_string()));
        assert!(spec.has_arg_containing("LDFLAGS=-static"));
        assert_eq!(
            spec.env,
            vec![(
                "PKG_CONFIG_PATH".to_string(),
                "/tmp/cbcpack-test/prefix/lib/pkgconfig".to_string()
            )]
        );
    }

    #[test]
    fn test_compile_adds_link_flags_only_for_final_package() {
        let config = config_in(Path::new("/tmp/x"));
        let dir = Path::new("/build");
        let dependency = compile_command(&config, LinkStrategy::ManualRelink, dir, false);
        let solver = compile_command(&config, LinkStrategy::ManualRelink, dir, true);
        assert_eq!(dependency.args, vec!["-j4"]);
        assert_eq!(solver.args, vec!["-j4", "LDFLAGS=-all-static"]);
    }

    #[test]
    fn test_plan_covers_every_package() {
        let config = config_in(Path::new("/tmp/x"));
        let commands = plan(&config, LinkStrategy::Static);
        assert_eq!(commands.len(), 15);
        assert!(commands[0].program.ends_with("CoinUtils/configure"));
        assert!(commands[12].program.ends_with("Cbc/configure"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_primary_strategy_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = FakeRunner::new()
            .on_with("make", &["install"], CommandOutput::ok(""), install_cbc(config.prefix.clone()))
            .on("ldd", &[], CommandOutput::failed(1, "\tnot a dynamic executable"));

        let outcome = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .expect("build failed");

        assert_eq!(outcome.strategy, LinkStrategy::Static);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(!outcome.artifacts.dynamic_fallback);
        assert_eq!(
            outcome.artifacts.executable("cbc").unwrap().linkage,
            Some(crate::linkage::Linkage::Static)
        );
        assert_eq!(runner.calls_to("strip").len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_strip_tool_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = FakeRunner::new()
            .on_with("make", &["install"], CommandOutput::ok(""), install_cbc(config.prefix.clone()))
            .spawn_error("strip", &[]);

        let outcome = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .expect("a missing strip must not fail the build");

        assert_eq!(outcome.strategy, LinkStrategy::Static);
        assert_eq!(outcome.strip_warnings.len(), 1);
        assert!(outcome.strip_warnings[0].starts_with("cbc: "));
        assert!(outcome.artifacts.executable("cbc").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_back_to_manual_relink() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = FakeRunner::new()
            .on(
                "configure",
                &["LDFLAGS=-static"],
                CommandOutput::failed(77, "configure: error: C compiler cannot create executables"),
            )
            .on_with("make", &["install"], CommandOutput::ok(""), install_cbc(config.prefix.clone()));

        let outcome = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .expect("build failed");

        assert_eq!(outcome.strategy, LinkStrategy::ManualRelink);
        assert_eq!(outcome.attempts.len(), 2);
        match &outcome.attempts[0].outcome {
            AttemptOutcome::Failed { step, package, exit_code, .. } => {
                assert_eq!(*step, PipelineStage::Configure);
                assert_eq!(package, "CoinUtils");
                assert_eq!(*exit_code, 77);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(outcome.attempts[1].succeeded());
        let relink: Vec<_> = runner
            .calls_to("make")
            .into_iter()
            .filter(|c| c.has_arg_containing("-all-static"))
            .collect();
        assert_eq!(relink.len(), 1);
        assert!(relink[0].cwd.as_ref().unwrap().ends_with("manual-relink/Cbc"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dynamic_fallback_marks_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = FakeRunner::new()
            .on("configure", &["--enable-static"], CommandOutput::failed(1, "unsupported"))
            .on_with("make", &["install"], CommandOutput::ok(""), install_cbc(config.prefix.clone()));

        let outcome = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .expect("build failed");

        assert_eq!(outcome.strategy, LinkStrategy::Dynamic);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.artifacts.dynamic_fallback);
    }

    #[tokio::test]
    async fn test_exhausted_after_every_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = FakeRunner::new().on("make", &[], CommandOutput::failed(2, "make: *** [all] Error 1"));

        let err = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .unwrap_err();

        match err {
            BuildError::Exhausted {
                attempts,
                step,
                diagnostics,
                ..
            } => {
                let order: Vec<_> = attempts.iter().map(|a| a.strategy).collect();
                assert_eq!(
                    order,
                    vec![
                        LinkStrategy::Static,
                        LinkStrategy::ManualRelink,
                        LinkStrategy::Dynamic
                    ]
                );
                assert_eq!(step, PipelineStage::Compile);
                assert!(diagnostics.contains("Error 1"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_fails_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfiguration {
            prefer_static: false,
            ..config_in(dir.path())
        };
        let runner = FakeRunner::new();

        let err = Builder::new(&runner, &config)
            .build(&sources(&config))
            .await
            .unwrap_err();
        match err {
            BuildError::Exhausted { attempts, step, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(step, PipelineStage::Install);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_sources() {
        let config = BuildConfiguration::default();
        let runner = FakeRunner::new();
        let err = Builder::new(&runner, &config).build(&[]).await.unwrap_err();
        assert!(matches!(err, BuildError::NoSources));
    }

    #[test]
    fn test_custom_solver_package_is_last_in_plan() {
        let mut config = config_in(Path::new("/tmp/x"));
        config.dependencies.clear();
        config.solver = PackageSource::coin_or("Clp", "releases/1.17.9");
        let commands = plan(&config, LinkStrategy::ManualRelink);
        assert_eq!(commands.len(), 3);
        assert!(commands[1].has_arg_containing("-all-static"));
    }
}
