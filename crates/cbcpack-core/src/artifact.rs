//! Installed artifacts: executables, static archives and headers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

use crate::linkage::Linkage;

/// Executable whose presence makes or breaks the pipeline.
pub const PRIMARY_EXECUTABLE: &str = "cbc";

/// Executables an install is expected to produce.
pub const EXPECTED_EXECUTABLES: &[&str] = &["cbc", "clp"];

/// Kind of installed artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Executable,
    StaticArchive,
    HeaderDir,
}

/// One installed artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,

    /// Linkage class. Executables are tagged after inspection; archives are
    /// always static; header directories carry none.
    pub linkage: Option<Linkage>,

    /// SHA-256 of the file contents (executables only).
    pub sha256: Option<String>,
}

impl Artifact {
    /// File name of the artifact.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Files produced by one build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSet {
    pub prefix: PathBuf,
    pub artifacts: Vec<Artifact>,

    /// Produced by the dynamic fallback instead of a static strategy.
    pub dynamic_fallback: bool,
}

impl ArtifactSet {
    /// Scan an install prefix.
    ///
    /// Collects executables under `bin/`, `*.a` archives under `lib/` and the
    /// COIN-OR header directory under `include/`. A missing directory yields
    /// no artifacts of that kind.
    pub fn collect(prefix: &Path) -> io::Result<Self> {
        let mut artifacts = Vec::new();

        for path in sorted_entries(&prefix.join("bin"))? {
            if path.is_file() && is_executable(&path)? {
                let sha256 = Some(sha256_file(&path)?);
                artifacts.push(Artifact {
                    kind: ArtifactKind::Executable,
                    path,
                    linkage: None,
                    sha256,
                });
            }
        }

        for path in sorted_entries(&prefix.join("lib"))? {
            if path.is_file() && path.extension().map(|e| e == "a").unwrap_or(false) {
                artifacts.push(Artifact {
                    kind: ArtifactKind::StaticArchive,
                    path,
                    linkage: Some(Linkage::Static),
                    sha256: None,
                });
            }
        }

        for candidate in ["coin-or", "coin"] {
            let dir = prefix.join("include").join(candidate);
            if dir.is_dir() {
                artifacts.push(Artifact {
                    kind: ArtifactKind::HeaderDir,
                    path: dir,
                    linkage: None,
                    sha256: None,
                });
                break;
            }
        }

        Ok(Self {
            prefix: prefix.to_path_buf(),
            artifacts,
            dynamic_fallback: false,
        })
    }

    pub fn executables(&self) -> impl Iterator<Item = &Artifact> {
        self.of_kind(ArtifactKind::Executable)
    }

    pub fn archives(&self) -> impl Iterator<Item = &Artifact> {
        self.of_kind(ArtifactKind::StaticArchive)
    }

    pub fn header_dir(&self) -> Option<&Artifact> {
        self.of_kind(ArtifactKind::HeaderDir).next()
    }

    fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// Executable with the given file name.
    pub fn executable(&self, name: &str) -> Option<&Artifact> {
        self.executables().find(|a| a.name() == name)
    }

    /// Valid when at least one expected executable is present.
    pub fn is_valid(&self) -> bool {
        EXPECTED_EXECUTABLES
            .iter()
            .any(|name| self.executable(name).is_some())
    }

    /// Record the inspected linkage of an executable.
    pub fn tag_linkage(&mut self, path: &Path, linkage: Linkage) {
        for artifact in &mut self.artifacts {
            if artifact.kind == ArtifactKind::Executable && artifact.path == path {
                artifact.linkage = Some(linkage);
            }
        }
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> io::Result<bool> {
    Ok(true)
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_executable(path: &Path, content: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, content).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_install_tree() {
        let prefix = tempfile::tempdir().unwrap();
        let root = prefix.path();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::create_dir_all(root.join("lib/pkgconfig")).unwrap();
        std::fs::create_dir_all(root.join("include/coin-or")).unwrap();
        write_executable(&root.join("bin/cbc"), "cbc");
        write_executable(&root.join("bin/clp"), "clp");
        std::fs::write(root.join("lib/libCbc.a"), b"!<arch>\n").unwrap();
        std::fs::write(root.join("lib/libCbc.la"), b"libtool").unwrap();
        std::fs::write(root.join("lib/pkgconfig/cbc.pc"), b"Name: cbc").unwrap();

        let set = ArtifactSet::collect(root).expect("collect failed");
        let exes: Vec<String> = set.executables().map(|a| a.name()).collect();
        assert_eq!(exes, vec!["cbc", "clp"]);
        assert_eq!(set.archives().count(), 1);
        assert_eq!(set.archives().next().unwrap().linkage, Some(Linkage::Static));
        assert!(set.header_dir().is_some());
        assert!(set.is_valid());
        assert_eq!(set.executable("cbc").unwrap().sha256.as_ref().unwrap().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_files_are_ignored() {
        let prefix = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(prefix.path().join("bin")).unwrap();
        std::fs::write(prefix.path().join("bin/cbc"), "not executable").unwrap();

        let set = ArtifactSet::collect(prefix.path()).unwrap();
        assert_eq!(set.executables().count(), 0);
        assert!(!set.is_valid());
    }

    #[test]
    fn test_empty_prefix_is_invalid() {
        let prefix = tempfile::tempdir().unwrap();
        let set = ArtifactSet::collect(prefix.path()).unwrap();
        assert!(set.artifacts.is_empty());
        assert!(!set.is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_tag_linkage() {
        let prefix = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(prefix.path().join("bin")).unwrap();
        let cbc = prefix.path().join("bin/cbc");
        write_executable(&cbc, "cbc");

        let mut set = ArtifactSet::collect(prefix.path()).unwrap();
        set.tag_linkage(&cbc, Linkage::PartiallyStatic);
        assert_eq!(
            set.executable("cbc").unwrap().linkage,
            Some(Linkage::PartiallyStatic)
        );
    }
}
