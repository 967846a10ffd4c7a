//! Pipeline orchestration: fetch, build, verify.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::artifact::ArtifactSet;
use crate::build::{AttemptRecord, Builder};
use crate::config::BuildConfiguration;
use crate::error::{PipelineError, VerificationError};
use crate::fetch::{Fetcher, SourceTree};
use crate::obs;
use crate::report::VerificationReport;
use crate::runner::CommandRunner;
use crate::stage::{LinkStrategy, PipelineStage};
use crate::verify::Verifier;

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,

    /// Strategy that produced the binary.
    pub strategy: LinkStrategy,

    /// Every link strategy attempt, in order.
    pub attempts: Vec<AttemptRecord>,

    pub sources: Vec<SourceTree>,

    pub artifacts: ArtifactSet,

    pub report: VerificationReport,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Whether the static strategies all failed and a dynamic binary was built.
    pub fn used_dynamic_fallback(&self) -> bool {
        self.artifacts.dynamic_fallback
    }

    /// Attempts that failed before the successful one.
    pub fn failed_attempts(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.attempts.iter().filter(|a| !a.succeeded())
    }
}

/// Pipeline orchestrator.
pub struct Pipeline;

impl Pipeline {
    /// Fetch, build and verify according to `config`.
    ///
    /// A fetch failure stops the run before the builder is invoked. Soft
    /// verification failures are left in the report; only a missing binary
    /// fails the run.
    pub async fn run(
        config: &BuildConfiguration,
        runner: &dyn CommandRunner,
    ) -> Result<PipelineResult, PipelineError> {
        config.validate()?;
        let run_id = Uuid::new_v4().to_string();
        let span = obs::pipeline_span(&run_id);
        Self::run_inner(config, runner, run_id).instrument(span).await
    }

    async fn run_inner(
        config: &BuildConfiguration,
        runner: &dyn CommandRunner,
        run_id: String,
    ) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();
        obs::emit_pipeline_started(&run_id, &config.digest());

        let result = Self::stages(config, runner, &run_id).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_pipeline_finished(&run_id, duration_ms, result.is_ok());

        let (sources, outcome, report) = result?;
        Ok(PipelineResult {
            run_id,
            strategy: outcome.strategy,
            attempts: outcome.attempts,
            sources,
            artifacts: outcome.artifacts,
            report,
            duration_ms,
        })
    }

    async fn stages(
        config: &BuildConfiguration,
        runner: &dyn CommandRunner,
        run_id: &str,
    ) -> Result<(Vec<SourceTree>, crate::build::BuildOutcome, VerificationReport), PipelineError>
    {
        let sources = Fetcher::new(runner).fetch_all(config).await?;
        info!(packages = sources.len(), "Sources ready");

        let outcome = Builder::new(runner, config).build(&sources).await?;
        let path = outcome
            .attempts
            .iter()
            .map(|a| a.strategy.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        if outcome.artifacts.dynamic_fallback {
            warn!(strategy = %outcome.strategy, path = %path, "Static strategies failed, using dynamic build");
        } else {
            info!(strategy = %outcome.strategy, path = %path, "Build path");
        }
        for warning in &outcome.strip_warnings {
            warn!(warning = %warning, "Strip warning");
        }

        obs::emit_stage_started(PipelineStage::Verify, crate::artifact::PRIMARY_EXECUTABLE);
        let verify_start = Instant::now();
        let verified = Verifier::new(runner, config).verify(&outcome.artifacts).await;
        obs::emit_stage_finished(
            PipelineStage::Verify,
            crate::artifact::PRIMARY_EXECUTABLE,
            verify_start.elapsed().as_millis() as u64,
            verified.is_ok(),
        );
        let mut report = verified?;
        report.run_id = run_id.to_string();
        report.strategy = Some(outcome.strategy);

        Ok((sources, outcome, report))
    }

    /// Verify an existing install under the configured prefix without
    /// fetching or building.
    pub async fn verify_only(
        config: &BuildConfiguration,
        runner: &dyn CommandRunner,
    ) -> Result<VerificationReport, PipelineError> {
        config.validate()?;
        let run_id = Uuid::new_v4().to_string();
        let span = obs::pipeline_span(&run_id);
        async {
            obs::emit_pipeline_started(&run_id, &config.digest());
            let start = Instant::now();

            let result = Self::verify_prefix(config, runner).await;

            obs::emit_pipeline_finished(
                &run_id,
                start.elapsed().as_millis() as u64,
                result.is_ok(),
            );
            let mut report = result?;
            report.run_id = run_id.clone();
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn verify_prefix(
        config: &BuildConfiguration,
        runner: &dyn CommandRunner,
    ) -> Result<VerificationReport, PipelineError> {
        let artifacts = ArtifactSet::collect(&config.prefix).map_err(|source| {
            PipelineError::from(VerificationError::Io {
                path: config.prefix.clone(),
                source,
            })
        })?;
        Ok(Verifier::new(runner, config).verify(&artifacts).await?)
    }
}
