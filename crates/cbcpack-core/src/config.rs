//! Build configuration and identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::linkage::LinkageStrictness;
use crate::stage::LinkStrategy;

/// Base URL of the COIN-OR GitHub organisation.
pub const COIN_OR_BASE_URL: &str = "https://github.com/coin-or";

/// A pinned source package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageSource {
    /// Package name (CoinUtils, Osi, Clp, Cgl, Cbc).
    pub name: String,

    /// Git repository URL.
    pub url: String,

    /// Tag, branch or commit SHA.
    pub revision: String,

    /// Pre-fetched source tree used as-is instead of cloning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl PackageSource {
    /// A package hosted under the COIN-OR organisation.
    pub fn coin_or(name: &str, revision: &str) -> Self {
        Self {
            name: name.to_string(),
            url: format!("{COIN_OR_BASE_URL}/{name}"),
            revision: revision.to_string(),
            local_path: None,
        }
    }
}

/// C library the toolchain targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LibcFlavor {
    #[default]
    Glibc,
    Musl,
}

impl LibcFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            LibcFlavor::Glibc => "glibc",
            LibcFlavor::Musl => "musl",
        }
    }

    /// Strictness used when none is configured. musl links fully static
    /// without trouble; glibc builds commonly keep the loader and libc.
    pub fn default_strictness(&self) -> LinkageStrictness {
        match self {
            LibcFlavor::Glibc => LinkageStrictness::AllowLibc,
            LibcFlavor::Musl => LinkageStrictness::Strict,
        }
    }
}

impl fmt::Display for LibcFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LibcFlavor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "glibc" | "gnu" => Ok(LibcFlavor::Glibc),
            "musl" => Ok(LibcFlavor::Musl),
            other => Err(ConfigError::Invalid(format!("unknown libc flavor: {other}"))),
        }
    }
}

/// Configuration of a single pipeline run.
///
/// Selected once at pipeline start and passed by shared reference to every
/// stage; nothing downstream mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfiguration {
    /// The solver package whose executable is the primary artifact.
    pub solver: PackageSource,

    /// Dependency libraries, in build order.
    pub dependencies: Vec<PackageSource>,

    /// Install prefix (must be absolute).
    pub prefix: PathBuf,

    /// Scratch root for sources, build trees and verification files.
    pub work_dir: PathBuf,

    /// Value for CFLAGS and CXXFLAGS.
    pub opt_flags: String,

    /// Try static link strategies before the dynamic one.
    pub prefer_static: bool,

    /// Optional dependencies passed as `--without-<name>`.
    pub disabled_dependencies: Vec<String>,

    /// Parallelism hint for `make -j`.
    pub jobs: usize,

    pub libc: LibcFlavor,

    /// Strip installed executables.
    pub strip: bool,

    /// Whether partially static binaries are acceptable. Defaults per libc.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strictness: Option<LinkageStrictness>,

    /// C compiler override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,

    /// C++ compiler override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cxx: Option<String>,

    /// Wall-clock timeout for the execution check, in seconds.
    pub exec_timeout_secs: u64,

    /// Arguments for the execution check.
    pub exec_args: Vec<String>,

    /// Container images the binary is run in for the portability check.
    pub portability_images: Vec<String>,

    /// Container engine executable (docker, podman).
    pub container_engine: String,

    /// Timeout per portability run, in seconds.
    pub portability_timeout_secs: u64,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            solver: PackageSource::coin_or("Cbc", "releases/2.10.11"),
            dependencies: vec![
                PackageSource::coin_or("CoinUtils", "releases/2.11.10"),
                PackageSource::coin_or("Osi", "releases/0.108.9"),
                PackageSource::coin_or("Clp", "releases/1.17.9"),
                PackageSource::coin_or("Cgl", "releases/0.60.8"),
            ],
            prefix: PathBuf::from("/opt/cbc"),
            work_dir: std::env::temp_dir().join("cbcpack"),
            opt_flags: "-O2".to_string(),
            prefer_static: true,
            disabled_dependencies: vec!["lapack".to_string(), "blas".to_string()],
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            libc: LibcFlavor::default(),
            strip: true,
            strictness: None,
            cc: None,
            cxx: None,
            exec_timeout_secs: 30,
            exec_args: vec!["-quit".to_string()],
            portability_images: Vec::new(),
            container_engine: "docker".to_string(),
            portability_timeout_secs: 300,
        }
    }
}

impl BuildConfiguration {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Reject configurations no pipeline run could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for package in self.packages() {
            if package.name.trim().is_empty() {
                return Err(ConfigError::Invalid("package with empty name".to_string()));
            }
            if package.revision.trim().is_empty() && package.local_path.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "package {} has no revision",
                    package.name
                )));
            }
        }
        if !self.prefix.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "install prefix must be absolute: {:?}",
                self.prefix
            )));
        }
        // Build steps run with their own working directory, so relative
        // source and work paths would resolve against the wrong root.
        if !self.work_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "work directory must be absolute: {:?}",
                self.work_dir
            )));
        }
        for package in self.packages() {
            if let Some(local) = package.local_path.as_ref().filter(|p| !p.is_absolute()) {
                return Err(ConfigError::Invalid(format!(
                    "local source of {} must be absolute: {:?}",
                    package.name, local
                )));
            }
        }
        if self.jobs == 0 {
            return Err(ConfigError::Invalid("jobs must be at least 1".to_string()));
        }
        if self.exec_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution check timeout must be at least 1 second".to_string(),
            ));
        }
        if self.portability_timeout_secs == 0 && !self.portability_images.is_empty() {
            return Err(ConfigError::Invalid(
                "portability timeout must be at least 1 second".to_string(),
            ));
        }
        if self.exec_args.is_empty() {
            return Err(ConfigError::Invalid(
                "execution check needs at least one argument".to_string(),
            ));
        }
        Ok(())
    }

    /// All packages in build order; the solver comes last.
    pub fn packages(&self) -> impl Iterator<Item = &PackageSource> {
        self.dependencies.iter().chain(std::iter::once(&self.solver))
    }

    /// Effective linkage strictness.
    pub fn effective_strictness(&self) -> LinkageStrictness {
        self.strictness
            .unwrap_or_else(|| self.libc.default_strictness())
    }

    /// Where a package's sources are fetched to.
    pub fn source_dir(&self, package: &PackageSource) -> PathBuf {
        match &package.local_path {
            Some(path) => path.clone(),
            None => self.work_dir.join("src").join(&package.name),
        }
    }

    /// Out-of-tree build directory for a package under a link strategy.
    pub fn build_dir(&self, strategy: LinkStrategy, package: &str) -> PathBuf {
        self.work_dir
            .join("build")
            .join(strategy.name())
            .join(package)
    }

    /// Scratch directory for verification inputs and outputs.
    pub fn verify_dir(&self) -> PathBuf {
        self.work_dir.join("verify")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    /// Path of the primary executable under the install prefix.
    pub fn primary_executable(&self) -> PathBuf {
        self.bin_dir().join(crate::artifact::PRIMARY_EXECUTABLE)
    }

    /// Deterministic digest of everything that shapes the produced binary.
    ///
    /// The work directory and the parallelism hint are excluded; they do not
    /// change the artifact.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for package in self.packages() {
            update_field(&mut hasher, &package.name);
            update_field(&mut hasher, &package.url);
            update_field(&mut hasher, &package.revision);
        }
        update_field(&mut hasher, &self.prefix.to_string_lossy());
        update_field(&mut hasher, &self.opt_flags);
        update_field(&mut hasher, if self.prefer_static { "static" } else { "dynamic" });
        for dep in &self.disabled_dependencies {
            update_field(&mut hasher, dep);
        }
        update_field(&mut hasher, self.libc.name());
        update_field(&mut hasher, self.effective_strictness().name());
        update_field(&mut hasher, self.cc.as_deref().unwrap_or(""));
        update_field(&mut hasher, self.cxx.as_deref().unwrap_or(""));
        update_field(&mut hasher, if self.strip { "strip" } else { "nostrip" });
        hex::encode(hasher.finalize())
    }
}

fn update_field(hasher: &mut Sha256, value: &str) {
    hasher.update(value.as_bytes());
    hasher.update(b"\0");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = BuildConfiguration::default();
        config.validate().expect("default config should validate");
        let names: Vec<&str> = config.packages().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["CoinUtils", "Osi", "Clp", "Cgl", "Cbc"]);
        assert_eq!(config.solver.url, "https://github.com/coin-or/Cbc");
    }

    #[test]
    fn test_toml_overrides_merge_with_defaults() {
        let content = r#"
prefix = "/usr/local/cbc"
prefer_static = false
disabled_dependencies = ["lapack"]
libc = "musl"

[solver]
name = "Cbc"
url = "https://github.com/coin-or/Cbc"
revision = "releases/2.10.10"
"#;
        let config = BuildConfiguration::from_toml_str(content, Path::new("cbcpack.toml"))
            .expect("parse failed");
        assert_eq!(config.prefix, PathBuf::from("/usr/local/cbc"));
        assert!(!config.prefer_static);
        assert_eq!(config.solver.revision, "releases/2.10.10");
        assert_eq!(config.libc, LibcFlavor::Musl);
        assert_eq!(config.dependencies.len(), 4);
        assert_eq!(config.effective_strictness(), LinkageStrictness::Strict);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let err = BuildConfiguration::from_toml_str("jobs = \"many\"", Path::new("bad.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_validate_rejects_relative_prefix() {
        let config = BuildConfiguration {
            prefix: PathBuf::from("relative/prefix"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_work_paths() {
        let relative_work = BuildConfiguration {
            work_dir: PathBuf::from("work"),
            ..Default::default()
        };
        let err = relative_work.validate().unwrap_err();
        assert!(err.to_string().contains("work directory"));

        let mut relative_local = BuildConfiguration::default();
        relative_local.solver.local_path = Some(PathBuf::from("vendor/Cbc"));
        assert!(relative_local.validate().is_err());
    }

    #[test]
    fn test_validate_requires_timeouts() {
        let no_exec_timeout = BuildConfiguration {
            exec_timeout_secs: 0,
            ..Default::default()
        };
        let err = no_exec_timeout.validate().unwrap_err();
        assert!(err.to_string().contains("timeout"));

        // The portability timeout only matters when images are configured.
        let unused = BuildConfiguration {
            portability_timeout_secs: 0,
            ..Default::default()
        };
        assert!(unused.validate().is_ok());

        let with_images = BuildConfiguration {
            portability_timeout_secs: 0,
            portability_images: vec!["alpine:3.19".to_string()],
            ..Default::default()
        };
        assert!(with_images.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_jobs_and_empty_revision() {
        let zero_jobs = BuildConfiguration {
            jobs: 0,
            ..Default::default()
        };
        assert!(zero_jobs.validate().is_err());

        let mut no_revision = BuildConfiguration::default();
        no_revision.solver.revision = "  ".to_string();
        assert!(no_revision.validate().is_err());
    }

    #[test]
    fn test_digest_deterministic_and_ignores_jobs() {
        let a = BuildConfiguration::default();
        let b = BuildConfiguration {
            jobs: a.jobs + 7,
            work_dir: PathBuf::from("/elsewhere"),
            ..a.clone()
        };
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_digest_changes_with_revision() {
        let a = BuildConfiguration::default();
        let mut b = a.clone();
        b.solver.revision = "releases/2.10.5".to_string();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_build_dir_is_per_strategy() {
        let config = BuildConfiguration {
            work_dir: PathBuf::from("/work"),
            ..Default::default()
        };
        assert_eq!(
            config.build_dir(LinkStrategy::ManualRelink, "Cbc"),
            PathBuf::from("/work/build/manual-relink/Cbc")
        );
        assert_eq!(config.primary_executable(), PathBuf::from("/opt/cbc/bin/cbc"));
    }

    #[test]
    fn test_libc_from_str() {
        assert_eq!("musl".parse::<LibcFlavor>().unwrap(), LibcFlavor::Musl);
        assert_eq!("GNU".parse::<LibcFlavor>().unwrap(), LibcFlavor::Glibc);
        assert!("bionic".parse::<LibcFlavor>().is_err());
    }
}
