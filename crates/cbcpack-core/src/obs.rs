//! Structured observability hooks for pipeline lifecycle events.
//!
//! Events are emitted at `info!` level (`warn!` for failures) with an
//! `event` field naming the lifecycle point, so JSON log consumers can
//! filter on it.

use tracing::{info, warn};

use crate::report::CheckStatus;
use crate::stage::{LinkStrategy, PipelineStage};

/// Run-scoped span tagged with the run_id.
///
/// Attach it to async work with `tracing::Instrument`; an entered guard held
/// across `.await` would make the future `!Send`.
pub fn pipeline_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("cbcpack.run", run_id = %run_id)
}

/// Emit event: pipeline started.
pub fn emit_pipeline_started(run_id: &str, config_digest: &str) {
    info!(event = "pipeline.started", run_id = %run_id, config_digest = %config_digest);
}

/// Emit event: pipeline finished.
pub fn emit_pipeline_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: a stage started for a package (or executable).
pub fn emit_stage_started(stage: PipelineStage, subject: &str) {
    info!(event = "stage.started", stage = %stage, subject = %subject);
}

/// Emit event: a stage finished.
pub fn emit_stage_finished(stage: PipelineStage, subject: &str, duration_ms: u64, success: bool) {
    if success {
        info!(
            event = "stage.finished",
            stage = %stage,
            subject = %subject,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "stage.failed",
            stage = %stage,
            subject = %subject,
            duration_ms = duration_ms,
        );
    }
}

/// Emit event: a link strategy attempt failed and the builder falls back.
pub fn emit_attempt_failed(
    strategy: LinkStrategy,
    step: PipelineStage,
    package: &str,
    exit_code: i32,
) {
    warn!(
        event = "build.attempt_failed",
        strategy = %strategy,
        step = %step,
        package = %package,
        exit_code = exit_code,
    );
}

/// Emit event: the builder settled on a link strategy.
pub fn emit_strategy_selected(strategy: LinkStrategy, attempts: usize) {
    info!(
        event = "build.strategy_selected",
        strategy = %strategy,
        attempts = attempts,
    );
}

/// Emit event: a verification check was recorded.
pub fn emit_check_recorded(check: &str, status: CheckStatus, detail: &str) {
    match status {
        CheckStatus::Fail => warn!(event = "verify.check", check = %check, status = %status, detail = %detail),
        _ => info!(event = "verify.check", check = %check, status = %status, detail = %detail),
    }
}
