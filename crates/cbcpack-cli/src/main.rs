//! cbcpack - build and verify a statically linked COIN-OR CBC solver
//!
//! ## Commands
//!
//! - `run`: fetch, build and verify
//! - `verify`: verify an existing install prefix
//! - `inspect`: print the linkage classification of a binary
//! - `plan`: print the configure/make commands per link strategy

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use cbcpack_core::{
    build, AttemptOutcome, BuildConfiguration, LibcFlavor, LinkStrategy, LinkageInspector,
    LinkageStrictness, Pipeline, PipelineError, SystemRunner, VerificationReport,
};

#[derive(Parser)]
#[command(name = "cbcpack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and verify a statically linked CBC solver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, build and verify the solver
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Write the verification report as JSON
        #[arg(long)]
        report_json: Option<PathBuf>,
    },

    /// Verify an existing install without building
    Verify {
        #[command(flatten)]
        config: ConfigArgs,

        /// Write the verification report as JSON
        #[arg(long)]
        report_json: Option<PathBuf>,
    },

    /// Print the linkage classification of a binary
    Inspect {
        /// Binary to inspect
        binary: PathBuf,

        /// Strictness to judge the binary against
        #[arg(long, default_value = "allow-libc")]
        strictness: LinkageStrictness,
    },

    /// Print the build commands for each link strategy without running them
    Plan {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Configuration sources. Flags override the file, which overrides defaults.
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(short, long, env = "CBCPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Cbc revision (tag, branch or commit)
    #[arg(long, env = "CBCPACK_REVISION")]
    revision: Option<String>,

    /// Install prefix
    #[arg(long, env = "CBCPACK_PREFIX")]
    prefix: Option<PathBuf>,

    /// Scratch directory for sources and build trees
    #[arg(long, env = "CBCPACK_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Skip the static link strategies
    #[arg(long)]
    no_static: bool,

    /// Optional dependencies to disable (comma separated)
    #[arg(long, value_delimiter = ',')]
    without: Vec<String>,

    /// Parallel make jobs
    #[arg(short, long, env = "CBCPACK_JOBS")]
    jobs: Option<usize>,

    /// Target C library (glibc, musl)
    #[arg(long, env = "CBCPACK_LIBC")]
    libc: Option<LibcFlavor>,

    /// Linkage strictness (strict, allow-libc)
    #[arg(long, env = "CBCPACK_STRICTNESS")]
    strictness: Option<LinkageStrictness>,

    /// Keep symbols in installed executables
    #[arg(long)]
    no_strip: bool,

    /// Container image for the portability check (repeatable)
    #[arg(long = "image")]
    images: Vec<String>,

    /// Timeout for the execution check, in seconds
    #[arg(long)]
    exec_timeout: Option<u64>,
}

impl ConfigArgs {
    /// Merge the file (if any) and flags into a validated configuration.
    fn resolve(&self) -> Result<BuildConfiguration> {
        let mut config = match &self.config {
            Some(path) => BuildConfiguration::load(path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?,
            None => BuildConfiguration::default(),
        };

        if let Some(revision) = &self.revision {
            config.solver.revision = revision.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            // Relative to the invocation directory, not each build directory.
            config.work_dir = std::path::absolute(work_dir)
                .with_context(|| format!("Failed to resolve work directory {:?}", work_dir))?;
        }
        if self.no_static {
            config.prefer_static = false;
        }
        for dep in &self.without {
            let dep = dep.trim();
            if !dep.is_empty() && !config.disabled_dependencies.iter().any(|d| d == dep) {
                config.disabled_dependencies.push(dep.to_string());
            }
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(libc) = self.libc {
            config.libc = libc;
        }
        if let Some(strictness) = self.strictness {
            config.strictness = Some(strictness);
        }
        if self.no_strip {
            config.strip = false;
        }
        if !self.images.is_empty() {
            config.portability_images = self.images.clone();
        }
        if let Some(timeout) = self.exec_timeout {
            config.exec_timeout_secs = timeout;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cbcpack_core::init_tracing(cli.json, level);

    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            report_json,
        } => cmd_run(&config.resolve()?, report_json.as_deref()).await,
        Commands::Verify {
            config,
            report_json,
        } => cmd_verify(&config.resolve()?, report_json.as_deref()).await,
        Commands::Inspect { binary, strictness } => cmd_inspect(&binary, strictness).await,
        Commands::Plan { config } => cmd_plan(&config.resolve()?),
    }
}

/// Pipeline errors carry their own exit status; anything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

async fn cmd_run(config: &BuildConfiguration, report_json: Option<&Path>) -> Result<()> {
    println!("Building {} {} into {:?}", config.solver.name, config.solver.revision, config.prefix);
    println!(
        "Dependencies: {}",
        config
            .dependencies
            .iter()
            .map(|d| format!("{} {}", d.name, d.revision))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    let result = Pipeline::run(config, &SystemRunner)
        .await
        .context("Pipeline failed")?;

    println!("Run ID: {}", result.run_id);
    println!("Duration: {}ms", result.duration_ms);
    println!("Link strategies:");
    for attempt in &result.attempts {
        match &attempt.outcome {
            AttemptOutcome::Succeeded => {
                println!("  ✓ {} ({}ms)", attempt.strategy, attempt.duration_ms)
            }
            AttemptOutcome::Failed {
                step,
                package,
                exit_code,
                ..
            } => println!(
                "  ✗ {} ({} of {} exited {})",
                attempt.strategy, step, package, exit_code
            ),
        }
    }
    if result.used_dynamic_fallback() {
        println!("Warning: static strategies failed; the installed binary is dynamically linked");
    }
    println!();

    finish(&result.report, report_json)
}

async fn cmd_verify(config: &BuildConfiguration, report_json: Option<&Path>) -> Result<()> {
    let report = Pipeline::verify_only(config, &SystemRunner)
        .await
        .context("Verification failed")?;
    finish(&report, report_json)
}

/// Print the report and optionally write it as JSON.
fn finish(report: &VerificationReport, report_json: Option<&Path>) -> Result<()> {
    println!("{report}");
    if let Some(path) = report_json {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        info!(path = ?path, "Wrote verification report");
    }
    Ok(())
}

async fn cmd_inspect(binary: &Path, strictness: LinkageStrictness) -> Result<()> {
    if !binary.is_file() {
        anyhow::bail!("No such file: {:?}", binary);
    }
    let info = LinkageInspector::new(&SystemRunner).inspect(binary).await;

    println!("Binary: {:?}", binary);
    if let Some(description) = &info.file_description {
        println!("File: {description}");
    }
    println!("Linkage: {}", info.linkage);
    if info.dependencies.is_empty() {
        println!("Dependencies: none");
    } else {
        println!("Dependencies:");
        for dep in &info.dependencies {
            println!("  - {dep}");
        }
    }
    let verdict = if strictness.accepts(info.linkage) {
        "✓ accepted"
    } else {
        "✗ rejected"
    };
    println!("Strictness {strictness}: {verdict}");
    Ok(())
}

fn cmd_plan(config: &BuildConfiguration) -> Result<()> {
    for &strategy in LinkStrategy::sequence(config.prefer_static) {
        println!("# {strategy}");
        for spec in build::plan(config, strategy) {
            match &spec.cwd {
                Some(cwd) => println!("(cd {} && {spec})", cwd.display()),
                None => println!("{spec}"),
            }
        }
        println!();
    }
    Ok(())
}
