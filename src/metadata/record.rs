//! Case records resolved from the metadata stores.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-case document stored at `meta/<localId>.json` in the metadata repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseMeta {
    #[serde(rename = "localId", default)]
    pub local_id: Option<u64>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub crash_type: Option<String>,
    #[serde(default)]
    pub sanitizer: Option<String>,
    #[serde(default)]
    pub fuzz_target: Option<String>,
    /// Either a single commit or a list of commits.
    #[serde(default)]
    pub fix_commit: Option<serde_json::Value>,
    #[serde(default)]
    pub repo_addr: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub report: Option<String>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CaseMeta {
    /// Fix commits, normalized to a list.
    pub fn fix_commits(&self) -> Vec<String> {
        match &self.fix_commit {
            Some(serde_json::Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Where a case's row lives in the metadata database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRowRef {
    pub table: String,
    pub key_column: String,
}

/// Read-through view of one case, immutable once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    /// The dataset's local ID.
    pub local_id: u64,
    pub project: Option<String>,
    pub crash_type: Option<String>,
    pub sanitizer: Option<String>,
    pub fix_commits: Vec<String>,
    /// Location of the row in the database, if the case was found there.
    pub db_row: Option<DatabaseRowRef>,
    /// Row contents keyed by column name.
    pub db_fields: BTreeMap<String, serde_json::Value>,
    /// Repository document, if the case was found there.
    pub meta: Option<CaseMeta>,
    /// Patch file in the repository, if present.
    pub patch_path: Option<PathBuf>,
    /// Repository HEAD at resolution time.
    pub repo_commit: Option<String>,
}

impl CaseRecord {
    /// Builds a record from whichever stores knew about the case.
    ///
    /// Repository fields take precedence; database columns with matching
    /// names fill the gaps.
    pub fn from_sources(
        local_id: u64,
        db_row: Option<(DatabaseRowRef, BTreeMap<String, serde_json::Value>)>,
        meta: Option<CaseMeta>,
        patch_path: Option<PathBuf>,
        repo_commit: Option<String>,
    ) -> Self {
        let (db_row, db_fields) = match db_row {
            Some((row, fields)) => (Some(row), fields),
            None => (None, BTreeMap::new()),
        };

        let from_db = |column: &str| -> Option<String> {
            db_fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(column))
                .and_then(|(_, v)| v.as_str().map(str::to_string))
        };

        let project = meta
            .as_ref()
            .and_then(|m| m.project.clone())
            .or_else(|| from_db("project"));
        let crash_type = meta
            .as_ref()
            .and_then(|m| m.crash_type.clone())
            .or_else(|| from_db("crash_type"));
        let sanitizer = meta
            .as_ref()
            .and_then(|m| m.sanitizer.clone())
            .or_else(|| from_db("sanitizer"));

        let mut fix_commits = meta.as_ref().map(CaseMeta::fix_commits).unwrap_or_default();
        if fix_commits.is_empty() {
            fix_commits.extend(from_db("fix_commit"));
        }

        Self {
            local_id,
            project,
            crash_type,
            sanitizer,
            fix_commits,
            db_row,
            db_fields,
            meta,
            patch_path,
            repo_commit,
        }
    }
}
