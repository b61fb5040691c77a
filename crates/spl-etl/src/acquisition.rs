//! Archive acquisition seam.
//!
//! Fetching archives from the FDA source (HTTP, retries, backoff) is the
//! external collaborator's job; the pipeline only needs something that can
//! name the archives available for a run. [`LocalDirectorySource`] covers
//! the common case of a directory the collaborator has already populated.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use spl_common::{checksum, Result};

/// One archive available to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    /// Source filename; the ledger key
    pub name: String,
    pub path: PathBuf,
    /// Hex SHA-256 of the archive bytes
    pub checksum: String,
}

/// Supplier of input archives for one run
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Enumerate the archives available right now, with checksums
    async fn discover(&self) -> Result<Vec<SourceArchive>>;
}

/// Archive source scanning a local directory for `*.zip` files
pub struct LocalDirectorySource {
    dir: PathBuf,
}

impl LocalDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArchiveSource for LocalDirectorySource {
    async fn discover(&self) -> Result<Vec<SourceArchive>> {
        let mut archives = Vec::new();
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "Archive directory does not exist");
            return Ok(archives);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_zip = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if !path.is_file() || !is_zip {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let digest = checksum::compute_file_checksum(&path)?;
            archives.push(SourceArchive {
                name: name.to_string(),
                path: path.clone(),
                checksum: digest,
            });
        }
        // Deterministic processing order across runs
        archives.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %self.dir.display(), count = archives.len(), "Discovered archives");
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_zips_sorted_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.zip"), b"bytes-b").unwrap();
        std::fs::write(dir.path().join("a.zip"), b"bytes-a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let source = LocalDirectorySource::new(dir.path());
        let archives = source.discover().await.unwrap();

        assert_eq!(archives.len(), 2);
        assert_eq!(archives[0].name, "a.zip");
        assert_eq!(archives[1].name, "b.zip");
        assert_eq!(archives[0].checksum.len(), 64);
        assert_ne!(archives[0].checksum, archives[1].checksum);
    }

    #[tokio::test]
    async fn test_discover_missing_directory_is_empty() {
        let source = LocalDirectorySource::new("/nonexistent/spl-archives");
        let archives = source.discover().await.unwrap();
        assert!(archives.is_empty());
    }
}
