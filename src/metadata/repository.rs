//! Read-only access to the checked-out metadata/patch repository.
//!
//! Layout:
//! ```text
//! <repo>/
//!   .git/
//!   meta/<localId>.json
//!   patches/<localId>.diff
//! ```

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::MetadataError;

use super::record::CaseMeta;

/// Handle on a metadata repository checkout.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    root: PathBuf,
}

impl MetadataRepository {
    /// Opens a repository checkout, verifying its layout.
    ///
    /// A checkout without `.git`, `meta/` or `patches/` is considered
    /// unsynchronized and rejected.
    pub fn open(root: &Path) -> Result<Self, MetadataError> {
        let unavailable = |reason: &str| MetadataError::RepositoryUnavailable {
            path: root.display().to_string(),
            reason: reason.to_string(),
        };

        if !root.is_dir() {
            return Err(unavailable("directory not found"));
        }
        if !root.join(".git").exists() {
            return Err(unavailable("not a git checkout (missing .git)"));
        }
        if !root.join("meta").is_dir() {
            return Err(unavailable("missing meta/ directory"));
        }
        if !root.join("patches").is_dir() {
            return Err(unavailable("missing patches/ directory"));
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    /// Number of regular files under `meta/` and `patches/`.
    pub async fn entry_counts(&self) -> Result<(usize, usize), MetadataError> {
        Ok((
            count_files(&self.meta_dir()).await?,
            count_files(&self.patches_dir()).await?,
        ))
    }

    /// Reads `meta/<localId>.json`, if present.
    pub async fn read_meta(&self, local_id: u64) -> Result<Option<CaseMeta>, MetadataError> {
        let path = self.meta_dir().join(format!("{}.json", local_id));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta = serde_json::from_str(&raw).map_err(|e| MetadataError::MalformedDocument {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(meta))
    }

    /// Path of `patches/<localId>.diff`, if present.
    pub async fn patch_path(&self, local_id: u64) -> Option<PathBuf> {
        let path = self.patches_dir().join(format!("{}.diff", local_id));
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Some(path),
            _ => None,
        }
    }

    /// HEAD commit of the checkout, when git is available.
    pub async fn head_commit(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.root)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            tracing::debug!(
                repo = %self.root.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git rev-parse HEAD failed"
            );
            return None;
        }

        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }
}

async fn count_files(dir: &Path) -> Result<usize, MetadataError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo(dir: &Path) {
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::create_dir_all(dir.join("meta")).unwrap();
        std::fs::create_dir_all(dir.join("patches")).unwrap();
    }

    #[tokio::test]
    async fn test_read_meta_and_patch() {
        let dir = tempfile::tempdir().unwrap();
        make_repo(dir.path());
        std::fs::write(
            dir.path().join("meta/289.json"),
            r#"{"localId": 289, "project": "yara", "sanitizer": "asan"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("patches/289.diff"), "--- a\n+++ b\n").unwrap();

        let repo = MetadataRepository::open(dir.path()).unwrap();
        let meta = repo.read_meta(289).await.unwrap().unwrap();
        assert_eq!(meta.project.as_deref(), Some("yara"));
        assert!(repo.patch_path(289).await.is_some());

        assert!(repo.read_meta(290).await.unwrap().is_none());
        assert!(repo.patch_path(290).await.is_none());
        assert_eq!(repo.entry_counts().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_malformed_meta() {
        let dir = tempfile::tempdir().unwrap();
        make_repo(dir.path());
        std::fs::write(dir.path().join("meta/1.json"), "{not json").unwrap();

        let repo = MetadataRepository::open(dir.path()).unwrap();
        assert!(matches!(
            repo.read_meta(1).await,
            Err(MetadataError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn test_open_rejects_incomplete_checkout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("meta")).unwrap();
        let err = MetadataRepository::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains(".git"));

        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let err = MetadataRepository::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("patches/"));
    }
}
