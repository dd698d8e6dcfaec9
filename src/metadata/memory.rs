//! Selection of ASan memory-safety cases from the metadata repository.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

use super::record::CaseMeta;

const MEMORY_PATTERNS: &[&str] = &[
    r"use[- ]?after[- ]?free",
    r"use[- ]?after[- ]?return",
    r"double[- ]?free",
    r"heap[- ]?buffer[- ]?overflow",
    r"stack[- ]?buffer[- ]?overflow",
    r"global[- ]?buffer[- ]?overflow",
    r"buffer[- ]?overflow",
    r"out[- ]?of[- ]?bounds",
    r"oob[- ]?(read|write)?",
    r"invalid[- ]?(read|write)",
    r"use[- ]?of[- ]?uninitialized",
    r"null[- ]?dereference",
];

/// The combined pattern, or `None` if it fails to compile.
fn memory_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| {
            let pattern = format!("(?i){}", MEMORY_PATTERNS.join("|"));
            Regex::new(&pattern)
                .map_err(|e| tracing::error!(error = %e, "Invalid memory-safety pattern"))
                .ok()
        })
        .as_ref()
}

/// Whether a crash type describes a memory-safety bug.
pub fn is_memory_crash(crash_type: &str) -> bool {
    memory_regex().is_some_and(|re| re.is_match(crash_type))
}

/// A case selected by [`select_memory_cases`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCase {
    #[serde(rename = "localId")]
    pub local_id: u64,
    pub crash_type: String,
    pub sanitizer: String,
}

/// Scans `meta/*.json` for ASan cases whose crash type is a memory-safety bug.
///
/// Unparsable documents are skipped with a warning. Results are sorted by ID.
pub async fn select_memory_cases(meta_dir: &Path) -> Result<Vec<MemoryCase>, MetadataError> {
    let mut entries = tokio::fs::read_dir(meta_dir).await?;
    let mut cases = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        let meta: CaseMeta = match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping invalid metadata document");
                continue;
            }
        };

        if let Some(case) = memory_case(&meta) {
            cases.push(case);
        }
    }

    cases.sort_by_key(|c| c.local_id);
    Ok(cases)
}

fn memory_case(meta: &CaseMeta) -> Option<MemoryCase> {
    let local_id = meta.local_id?;
    let sanitizer = meta.sanitizer.as_deref().unwrap_or_default().to_lowercase();
    let crash_type = meta.crash_type.as_deref().unwrap_or_default();

    if sanitizer == "asan" && is_memory_crash(crash_type) {
        Some(MemoryCase {
            local_id,
            crash_type: crash_type.to_string(),
            sanitizer,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_patterns_compile() {
        assert!(memory_regex().is_some());
    }

    #[test]
    fn test_memory_crash_patterns() {
        assert!(is_memory_crash("Heap-buffer-overflow READ 4"));
        assert!(is_memory_crash("Heap-use-after-free WRITE 8"));
        assert!(is_memory_crash("Stack-buffer-overflow"));
        assert!(is_memory_crash("Use-of-uninitialized-value"));
        assert!(is_memory_crash("Null-dereference READ"));
        assert!(is_memory_crash("Index out of bounds"));
        assert!(is_memory_crash("double free"));

        assert!(!is_memory_crash("Timeout"));
        assert!(!is_memory_crash("Integer-overflow"));
        assert!(!is_memory_crash("Memory leak"));
    }

    #[tokio::test]
    async fn test_select_memory_cases() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| std::fs::write(dir.path().join(name), body).unwrap();

        write("30.json", r#"{"localId": 30, "crash_type": "Heap-buffer-overflow READ 1", "sanitizer": "ASAN"}"#);
        write("4.json", r#"{"localId": 4, "crash_type": "Use-after-free", "sanitizer": "asan"}"#);
        write("5.json", r#"{"localId": 5, "crash_type": "Use-after-free", "sanitizer": "msan"}"#);
        write("6.json", r#"{"localId": 6, "crash_type": "Timeout", "sanitizer": "asan"}"#);
        write("7.json", "{broken");
        write("notes.txt", "ignored");

        let cases = select_memory_cases(dir.path()).await.unwrap();
        let ids: Vec<u64> = cases.iter().map(|c| c.local_id).collect();
        assert_eq!(ids, vec![4, 30]);
        assert_eq!(cases[1].sanitizer, "asan");
    }
}
