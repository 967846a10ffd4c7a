//! Error types for the build-and-verify pipeline.
//!
//! Each stage translates lower-level tool failures into its own error type at
//! the stage boundary; [`PipelineError`] is what callers of the pipeline see.

use std::path::PathBuf;

use thiserror::Error;

use crate::build::AttemptRecord;
use crate::stage::PipelineStage;

/// Errors raised while loading or validating a build configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for a build configuration
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is present but unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by a [`crate::runner::CommandRunner`] when a process could
/// not be run at all. A non-zero exit status is not an error.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("command has an empty program name")]
    EmptyProgram,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fetch failures. All of them are fatal to the pipeline.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("source {url} is unreachable: {diagnostics}")]
    Unreachable { url: String, diagnostics: String },

    #[error("revision {revision} does not exist in {url}: {diagnostics}")]
    RevisionNotFound {
        url: String,
        revision: String,
        diagnostics: String,
    },

    #[error("local source tree {0:?} does not exist")]
    MissingLocalTree(PathBuf),

    #[error("I/O error preparing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Build failures.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Every link strategy in the fallback sequence failed.
    #[error("all {} link strategies failed; last failure during {step} of {package}: {diagnostics}", .attempts.len())]
    Exhausted {
        attempts: Vec<AttemptRecord>,
        step: PipelineStage,
        package: String,
        diagnostics: String,
    },

    #[error("no source trees were provided to the builder")]
    NoSources,

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Verification failures. Only the structural (existence) check raises;
/// every other outcome is recorded in the report.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("expected executable {path:?} does not exist")]
    MissingBinary { path: PathBuf },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while parsing a CBC solution file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolutionParseError {
    #[error("solution file is empty")]
    Empty,

    #[error("missing objective header, found: {0:?}")]
    MissingHeader(String),

    #[error("invalid objective value {0:?}")]
    InvalidObjective(String),

    #[error("malformed variable row {line}: {content:?}")]
    MalformedRow { line: usize, content: String },
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("build failed: {0}")]
    Build(#[source] BuildError),

    #[error("verification failed: {0}")]
    Verification(#[source] VerificationError),

    /// An unexpected failure, carrying the offending stage's raw diagnostics.
    #[error("{stage} stage failed unexpectedly: {diagnostics}")]
    Stage {
        stage: PipelineStage,
        diagnostics: String,
    },
}

impl PipelineError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Fetch(_) => 2,
            PipelineError::Build(_) => 3,
            PipelineError::Verification(_) => 4,
            PipelineError::Config(_) | PipelineError::Stage { .. } => 1,
        }
    }
}

impl From<BuildError> for PipelineError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Exhausted { .. } => PipelineError::Build(err),
            other => PipelineError::Stage {
                stage: PipelineStage::Compile,
                diagnostics: other.to_string(),
            },
        }
    }
}

impl From<VerificationError> for PipelineError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::MissingBinary { .. } => PipelineError::Verification(err),
            other => PipelineError::Stage {
                stage: PipelineStage::Verify,
                diagnostics: other.to_string(),
            },
        }
    }
}
