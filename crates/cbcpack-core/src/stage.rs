//! Pipeline stage and link strategy definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// git clone / checkout of every package
    Fetch,

    /// `<src>/configure` in an out-of-tree build directory
    Configure,

    /// make -j<jobs>
    Compile,

    /// make install
    Install,

    /// strip --strip-unneeded on installed executables
    Strip,

    /// existence, linkage, execution and functional checks
    Verify,
}

impl PipelineStage {
    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Fetch => "fetch",
            PipelineStage::Configure => "configure",
            PipelineStage::Compile => "compile",
            PipelineStage::Install => "install",
            PipelineStage::Strip => "strip",
            PipelineStage::Verify => "verify",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Link configuration variants, attempted in order by the builder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkStrategy {
    /// Static flags passed eagerly to configure.
    Static,

    /// Static archives at configure time, `-all-static` only on the final link.
    ManualRelink,

    /// Plain dynamic link.
    Dynamic,
}

const STATIC_FIRST: [LinkStrategy; 3] = [
    LinkStrategy::Static,
    LinkStrategy::ManualRelink,
    LinkStrategy::Dynamic,
];
const DYNAMIC_ONLY: [LinkStrategy; 1] = [LinkStrategy::Dynamic];

impl LinkStrategy {
    /// Ordered fallback sequence for the given static-link preference.
    pub fn sequence(prefer_static: bool) -> &'static [LinkStrategy] {
        if prefer_static {
            &STATIC_FIRST
        } else {
            &DYNAMIC_ONLY
        }
    }

    /// Get the strategy name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            LinkStrategy::Static => "static",
            LinkStrategy::ManualRelink => "manual-relink",
            LinkStrategy::Dynamic => "dynamic",
        }
    }

    /// Position of this strategy in the fallback sequence.
    pub fn tier(&self) -> &'static str {
        match self {
            LinkStrategy::Static => "primary",
            LinkStrategy::ManualRelink => "secondary",
            LinkStrategy::Dynamic => "tertiary",
        }
    }

    /// Whether the strategy aims for a statically linked executable.
    pub fn is_static(&self) -> bool {
        !matches!(self, LinkStrategy::Dynamic)
    }

    /// Extra configure arguments for this strategy.
    pub fn configure_args(&self) -> Vec<String> {
        match self {
            LinkStrategy::Static => vec![
                "--enable-static".to_string(),
                "--disable-shared".to_string(),
                "LDFLAGS=-static -static-libgcc -static-libstdc++".to_string(),
            ],
            LinkStrategy::ManualRelink => {
                vec!["--enable-static".to_string(), "--disable-shared".to_string()]
            }
            LinkStrategy::Dynamic => Vec::new(),
        }
    }

    /// Extra `make` arguments for the package that links the final solver.
    pub fn final_link_args(&self) -> Vec<String> {
        match self {
            LinkStrategy::ManualRelink => vec!["LDFLAGS=-all-static".to_string()],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier(), self.name())
    }
}
