//! Corpus entry types.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a case in the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Both normalized trees are present and non-empty.
    Complete,
    /// Both sides extracted, but a normalized tree came out empty.
    Partial,
    /// At least one side could not be extracted.
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Complete => "complete",
            EntryStatus::Partial => "partial",
            EntryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(EntryStatus::Complete),
            "partial" => Ok(EntryStatus::Partial),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown entry status '{other}'")),
        }
    }
}

/// One case in the corpus index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub case_id: u64,
    pub status: EntryStatus,
    /// Set whenever the status is not complete.
    pub reason: Option<String>,
    pub case_dir: PathBuf,
    pub buggy_src: Option<PathBuf>,
    pub fixed_src: Option<PathBuf>,
    pub poc: Option<PathBuf>,
    pub runner: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl CorpusEntry {
    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Complete
    }

    /// True when the entry is complete and both source trees are still on
    /// disk and non-empty.
    pub fn is_intact(&self) -> bool {
        self.is_complete()
            && self.buggy_src.as_deref().is_some_and(non_empty_dir)
            && self.fixed_src.as_deref().is_some_and(non_empty_dir)
    }
}

pub(crate) fn non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dir: &Path) -> CorpusEntry {
        CorpusEntry {
            case_id: 1,
            status: EntryStatus::Complete,
            reason: None,
            case_dir: dir.to_path_buf(),
            buggy_src: Some(dir.join("buggy_src")),
            fixed_src: Some(dir.join("fixed_src")),
            poc: None,
            runner: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [EntryStatus::Complete, EntryStatus::Partial, EntryStatus::Failed] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!("done".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn test_intact_requires_non_empty_trees() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry(dir.path());
        assert!(!e.is_intact());

        std::fs::create_dir_all(dir.path().join("buggy_src/core")).unwrap();
        std::fs::create_dir_all(dir.path().join("fixed_src")).unwrap();
        assert!(!e.is_intact());

        std::fs::write(dir.path().join("fixed_src/a.c"), "a").unwrap();
        assert!(e.is_intact());
    }
}
