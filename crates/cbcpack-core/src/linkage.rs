//! Linkage classification of built executables.
//!
//! A binary is inspected with `ldd` (and `file` as a fallback) and sorted
//! into one of three classes:
//! - `Static`: no dynamic dependencies at all
//! - `PartiallyStatic`: only the C runtime base set (loader, libc, libm, ...)
//! - `Dynamic`: anything else, e.g. `libstdc++` or the COIN-OR shared libraries

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::ConfigError;
use crate::runner::{CommandRunner, CommandSpec};

/// Linkage class of an executable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    Static,
    PartiallyStatic,
    Dynamic,
}

impl Linkage {
    pub fn name(&self) -> &'static str {
        match self {
            Linkage::Static => "static",
            Linkage::PartiallyStatic => "partially-static",
            Linkage::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which linkage classes count as "static" for verification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkageStrictness {
    /// Only fully static binaries pass.
    Strict,

    /// Binaries depending only on the C runtime base set also pass.
    #[default]
    AllowLibc,
}

impl LinkageStrictness {
    pub fn name(&self) -> &'static str {
        match self {
            LinkageStrictness::Strict => "strict",
            LinkageStrictness::AllowLibc => "allow-libc",
        }
    }

    /// Whether a binary of the given class is acceptable.
    pub fn accepts(&self, linkage: Linkage) -> bool {
        match (self, linkage) {
            (_, Linkage::Static) => true,
            (LinkageStrictness::AllowLibc, Linkage::PartiallyStatic) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkageStrictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LinkageStrictness {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(LinkageStrictness::Strict),
            "allow-libc" | "allow_libc" | "lenient" => Ok(LinkageStrictness::AllowLibc),
            other => Err(ConfigError::Invalid(format!(
                "unknown linkage strictness: {other}"
            ))),
        }
    }
}

/// Result of inspecting one executable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageInfo {
    pub linkage: Linkage,

    /// Shared libraries the binary resolves at load time.
    pub dependencies: Vec<String>,

    /// Output of `file -b`, when available.
    pub file_description: Option<String>,
}

/// Markers `ldd` prints for binaries without a dynamic section.
const STATIC_LDD_MARKERS: &[&str] = &[
    "not a dynamic executable",
    "statically linked",
    "not a valid dynamic program",
];

/// Parse `ldd` output into library names.
///
/// Returns `None` when the output says the binary is not dynamic.
pub fn parse_ldd(output: &str) -> Option<Vec<String>> {
    let lower = output.to_lowercase();
    if STATIC_LDD_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }

    let deps = output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|token| token.contains(".so"))
        .map(|token| {
            Path::new(token)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| token.to_string())
        })
        .collect();
    Some(deps)
}

/// Classify from `file -b` output. `None` when `file` cannot tell.
pub fn parse_file_output(output: &str) -> Option<Linkage> {
    let lower = output.to_lowercase();
    if !lower.contains("elf") {
        return None;
    }
    if lower.contains("statically linked") || lower.contains("static-pie linked") {
        Some(Linkage::Static)
    } else if lower.contains("dynamically linked") {
        Some(Linkage::Dynamic)
    } else {
        None
    }
}

/// Whether a shared library belongs to the C runtime base set.
pub fn is_base_library(name: &str) -> bool {
    let stem = name.split(".so").next().unwrap_or(name);
    stem.starts_with("ld-linux")
        || stem.starts_with("ld-musl")
        || stem.starts_with("libc.musl")
        || matches!(
            stem,
            "linux-vdso" | "linux-gate" | "libc" | "libm" | "libpthread" | "libdl" | "librt"
        )
}

/// Classify a dependency list.
pub fn classify(dependencies: &[String]) -> Linkage {
    if dependencies.is_empty() {
        Linkage::Static
    } else if dependencies.iter().all(|d| is_base_library(d)) {
        Linkage::PartiallyStatic
    } else {
        Linkage::Dynamic
    }
}

/// Inspects executables through `file` and `ldd`.
pub struct LinkageInspector<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> LinkageInspector<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Inspect a binary.
    ///
    /// Missing inspection tools never fail the call: without `ldd` the `file`
    /// output decides, and without either the binary is treated as dynamic.
    pub async fn inspect(&self, binary: &Path) -> LinkageInfo {
        let path = binary.to_string_lossy().to_string();

        let file_description = match self
            .runner
            .run(&CommandSpec::new("file").arg("-b").arg(&path))
            .await
        {
            Ok(output) if output.passed() => Some(output.stdout.trim().to_string()),
            _ => None,
        };

        let ldd = self.runner.run(&CommandSpec::new("ldd").arg(&path)).await;
        let (linkage, dependencies) = match ldd {
            Ok(output) => match parse_ldd(&output.combined()) {
                None => (Linkage::Static, Vec::new()),
                Some(deps) if output.passed() => (classify(&deps), deps),
                Some(_) => (from_file(file_description.as_deref()), Vec::new()),
            },
            Err(err) => {
                debug!(error = %err, "ldd unavailable, falling back to file");
                (from_file(file_description.as_deref()), Vec::new())
            }
        };

        LinkageInfo {
            linkage,
            dependencies,
            file_description,
        }
    }
}

fn from_file(description: Option<&str>) -> Linkage {
    description
        .and_then(parse_file_output)
        .unwrap_or(Linkage::Dynamic)
}
