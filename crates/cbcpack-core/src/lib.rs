//! cbcpack Core - static COIN-OR CBC build-and-verify pipeline
//!
//! Provides a linear pipeline that:
//! - Fetches pinned CoinUtils, Osi, Clp, Cgl and Cbc sources
//! - Builds them with the native autoconf toolchain, falling back from a
//!   fully static link to a manual relink and finally to a dynamic link
//! - Verifies the installed `cbc` binary (existence, linkage, execution,
//!   a sample LP solve and optional cross-distribution runs)

pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod fakes;
pub mod fetch;
pub mod linkage;
pub mod lp;
pub mod obs;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod verify;

// Re-export key types
pub use artifact::{Artifact, ArtifactKind, ArtifactSet, EXPECTED_EXECUTABLES, PRIMARY_EXECUTABLE};
pub use build::{AttemptOutcome, AttemptRecord, BuildOutcome, Builder};
pub use config::{BuildConfiguration, LibcFlavor, PackageSource};
pub use error::{
    BuildError, ConfigError, FetchError, PipelineError, RunnerError, SolutionParseError,
    VerificationError,
};
pub use fetch::{Fetcher, SourceTree};
pub use linkage::{Linkage, LinkageInfo, LinkageInspector, LinkageStrictness};
pub use lp::{parse_solution, LpProblem, Solution, SolutionStatus, SAMPLE_OPTIMUM};
pub use pipeline::{Pipeline, PipelineResult};
pub use report::{CheckKind, CheckResult, CheckStatus, VerificationReport};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use stage::{LinkStrategy, PipelineStage};
pub use telemetry::init_tracing;
pub use verify::Verifier;
