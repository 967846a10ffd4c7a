//! Source fetching through git.
//!
//! Each package is cloned to `<work>/src/<name>` at its pinned revision. Tags
//! and branches use a shallow clone; commit SHAs need a full clone followed
//! by a checkout. Failures are fatal to the pipeline and are not retried.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BuildConfiguration, PackageSource};
use crate::error::FetchError;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

/// A package's source tree on local disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceTree {
    pub package: PackageSource,

    /// Root of the tree (contains `configure`).
    pub path: PathBuf,

    /// Resolved HEAD commit, when the tree is a git checkout.
    pub commit: Option<String>,
}

/// Fetches pinned package sources.
pub struct Fetcher<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Fetcher<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Fetch every package of the configuration, in build order.
    ///
    /// Stops at the first failure.
    pub async fn fetch_all(
        &self,
        config: &BuildConfiguration,
    ) -> Result<Vec<SourceTree>, FetchError> {
        let mut trees = Vec::new();
        for package in config.packages() {
            let dest = config.source_dir(package);
            trees.push(self.fetch(package, &dest).await?);
        }
        Ok(trees)
    }

    /// Produce a source tree for `package` at `dest`.
    pub async fn fetch(
        &self,
        package: &PackageSource,
        dest: &Path,
    ) -> Result<SourceTree, FetchError> {
        if let Some(local) = &package.local_path {
            if !local.is_dir() {
                return Err(FetchError::MissingLocalTree(local.clone()));
            }
            info!(package = %package.name, path = ?local, "Using local source tree");
            return Ok(SourceTree {
                package: package.clone(),
                path: local.clone(),
                commit: self.resolve_head(local).await,
            });
        }

        if dest.join(".git").exists() {
            if self.checkout(package, dest).await?.passed() {
                info!(package = %package.name, revision = %package.revision, "Reusing existing checkout");
                return Ok(SourceTree {
                    package: package.clone(),
                    path: dest.to_path_buf(),
                    commit: self.resolve_head(dest).await,
                });
            }
            warn!(package = %package.name, "Existing checkout is stale, cloning again");
            tokio::fs::remove_dir_all(dest)
                .await
                .map_err(|source| FetchError::Io {
                    path: dest.to_path_buf(),
                    source,
                })?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        info!(package = %package.name, url = %package.url, revision = %package.revision, "Fetching source");

        let dest_str = dest.to_string_lossy().to_string();
        if is_commit_sha(&package.revision) {
            let clone = CommandSpec::new("git")
                .args(["clone", "--no-checkout", package.url.as_str(), dest_str.as_str()]);
            let output = self.runner.run(&clone).await?;
            if !output.passed() {
                return Err(classify_failure(package, &output));
            }
            let checkout = self.checkout(package, dest).await?;
            if !checkout.passed() {
                return Err(FetchError::RevisionNotFound {
                    url: package.url.clone(),
                    revision: package.revision.clone(),
                    diagnostics: checkout.diagnostics(),
                });
            }
        } else {
            let clone = CommandSpec::new("git").args([
                "clone",
                "--depth",
                "1",
                "--branch",
                package.revision.as_str(),
                package.url.as_str(),
                dest_str.as_str(),
            ]);
            let output = self.runner.run(&clone).await?;
            if !output.passed() {
                return Err(classify_failure(package, &output));
            }
        }

        let commit = self.resolve_head(dest).await;
        debug!(package = %package.name, commit = ?commit, "Fetched");

        Ok(SourceTree {
            package: package.clone(),
            path: dest.to_path_buf(),
            commit,
        })
    }

    async fn checkout(
        &self,
        package: &PackageSource,
        dest: &Path,
    ) -> Result<CommandOutput, FetchError> {
        let spec = CommandSpec::new("git")
            .args(["checkout", "--quiet", package.revision.as_str()])
            .current_dir(dest);
        Ok(self.runner.run(&spec).await?)
    }

    /// HEAD commit of a checkout; `None` outside a git work tree.
    async fn resolve_head(&self, dir: &Path) -> Option<String> {
        let spec = CommandSpec::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir);
        match self.runner.run(&spec).await {
            Ok(output) if output.passed() => {
                let sha = output.stdout.trim().to_string();
                (!sha.is_empty()).then_some(sha)
            }
            _ => None,
        }
    }
}

/// Whether a revision looks like an (abbreviated) commit SHA.
pub fn is_commit_sha(revision: &str) -> bool {
    (7..=40).contains(&revision.len()) && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Markers git prints when the repository exists but the revision does not.
const MISSING_REVISION_MARKERS: &[&str] = &[
    "remote branch",
    "did not match any",
    "couldn't find remote ref",
    "reference is not a tree",
    "unknown revision",
];

fn classify_failure(package: &PackageSource, output: &CommandOutput) -> FetchError {
    let diagnostics = output.diagnostics();
    let lower = diagnostics.to_lowercase();
    if MISSING_REVISION_MARKERS.iter().any(|m| lower.contains(m)) {
        FetchError::RevisionNotFound {
            url: package.url.clone(),
            revision: package.revision.clone(),
            diagnostics,
        }
    } else {
        FetchError::Unreachable {
            url: package.url.clone(),
            diagnostics,
        }
    }
}
