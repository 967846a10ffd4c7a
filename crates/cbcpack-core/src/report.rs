//! Verification report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::linkage::Linkage;
use crate::stage::LinkStrategy;

/// Verification checks, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    BinaryExists,
    IsStatic,
    RunsWithoutError,
    ProducesExpectedSolution,
    Portable,
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::BinaryExists => "binary-exists",
            CheckKind::IsStatic => "is-static",
            CheckKind::RunsWithoutError => "runs-without-error",
            CheckKind::ProducesExpectedSolution => "produces-expected-solution",
            CheckKind::Portable => "portable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Skipped => "SKIP",
        })
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub detail: String,

    /// What the check ran against when it is repeated (e.g. an image).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl CheckResult {
    pub fn pass(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self::new(kind, CheckStatus::Pass, detail)
    }

    pub fn fail(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self::new(kind, CheckStatus::Fail, detail)
    }

    pub fn skipped(kind: CheckKind, detail: impl Into<String>) -> Self {
        Self::new(kind, CheckStatus::Skipped, detail)
    }

    fn new(kind: CheckKind, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            detail: detail.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Terminal artifact of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,

    /// Digest of the build configuration.
    pub config_digest: String,

    /// The executable under test.
    pub binary: PathBuf,

    /// Link strategy the builder settled on (unknown for verify-only runs).
    pub strategy: Option<LinkStrategy>,

    pub linkage: Option<Linkage>,
    pub dependencies: Vec<String>,

    /// Objective of the sample problem, when it was solved.
    pub objective: Option<f64>,

    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn new(run_id: impl Into<String>, config_digest: impl Into<String>, binary: PathBuf) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            config_digest: config_digest.into(),
            binary,
            strategy: None,
            linkage: None,
            dependencies: Vec::new(),
            objective: None,
            checks: Vec::new(),
        }
    }

    pub fn record(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    /// First recorded result of the given kind.
    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.kind == kind)
    }

    /// The binary exists; soft checks do not affect this.
    pub fn structural_success(&self) -> bool {
        self.check(CheckKind::BinaryExists)
            .map(CheckResult::passed)
            .unwrap_or(false)
    }

    /// No check failed.
    pub fn all_passed(&self) -> bool {
        self.structural_success() && self.failed_checks().next().is_none()
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Verification report {}", self.run_id)?;
        writeln!(f, "  binary:        {}", self.binary.display())?;
        writeln!(f, "  config digest: {}", &self.config_digest[..12.min(self.config_digest.len())])?;
        match self.strategy {
            Some(strategy) => writeln!(f, "  link strategy: {strategy}")?,
            None => writeln!(f, "  link strategy: unknown")?,
        }
        match self.linkage {
            Some(linkage) => writeln!(f, "  linkage:       {linkage}")?,
            None => writeln!(f, "  linkage:       unknown")?,
        }
        if !self.dependencies.is_empty() {
            writeln!(f, "  dependencies:  {}", self.dependencies.join(", "))?;
        }
        if let Some(objective) = self.objective {
            writeln!(f, "  objective:     {objective}")?;
        }
        writeln!(f)?;
        for check in &self.checks {
            let name = match &check.target {
                Some(target) => format!("{} [{}]", check.kind.name(), target),
                None => check.kind.name().to_string(),
            };
            writeln!(f, "  [{}] {:<40} {}", check.status, name, check.detail)?;
        }
        writeln!(f)?;
        let verdict = if self.all_passed() {
            "all checks passed"
        } else if self.structural_success() {
            "binary present, some checks failed"
        } else {
            "binary missing"
        };
        write!(f, "Result: {verdict}")
    }
}
