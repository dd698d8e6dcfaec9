//! Per-case `case.json` manifest and tree digests.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::classify::ClassifiedEntry;
use crate::corpus::entry::EntryStatus;
use crate::environment::Side;
use crate::extract::ArtifactKind;
use crate::metadata::CaseRecord;

/// File name of the manifest inside a case directory.
pub const MANIFEST_FILE: &str = "case.json";

/// Metadata summary carried into the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub project: Option<String>,
    pub crash_type: Option<String>,
    pub sanitizer: Option<String>,
    pub fix_commits: Vec<String>,
    pub patch: Option<String>,
    pub metadata_commit: Option<String>,
}

impl From<&CaseRecord> for CaseSummary {
    fn from(record: &CaseRecord) -> Self {
        Self {
            project: record.project.clone(),
            crash_type: record.crash_type.clone(),
            sanitizer: record.sanitizer.clone(),
            fix_commits: record.fix_commits.clone(),
            patch: record
                .patch_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            metadata_commit: record.repo_commit.clone(),
        }
    }
}

/// What happened to one side of the case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideManifest {
    pub side: Side,
    pub image: String,
    /// In-environment path the tree was copied from.
    pub provenance: Option<String>,
    pub entries: Vec<ClassifiedEntry>,
    /// SHA-256 over the normalized source tree.
    pub source_digest: Option<String>,
    pub error: Option<String>,
}

/// One artifact slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub kind: ArtifactKind,
    pub file: Option<String>,
    /// Side the artifact was taken from.
    pub from: Option<Side>,
    pub omitted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseManifest {
    pub case_id: u64,
    pub status: EntryStatus,
    pub reason: Option<String>,
    pub assembled_at: DateTime<Utc>,
    pub metadata: CaseSummary,
    pub sides: Vec<SideManifest>,
    pub artifacts: Vec<ArtifactManifest>,
}

impl CaseManifest {
    pub fn write(&self, case_dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(case_dir.join(MANIFEST_FILE), json)
    }

    pub fn read(case_dir: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(case_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Hex SHA-256 over every path and file body below `root`, in sorted order.
///
/// Symlinks contribute their target rather than the linked contents.
pub fn tree_digest(root: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        let file_type = entry.file_type();

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        if file_type.is_symlink() {
            hasher.update(b"L");
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            let mut file = std::fs::File::open(entry.path())?;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update([0]);
    }

    Ok(hex::encode(hasher.finalize()))
}
