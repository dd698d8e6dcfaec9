//! Source vs. harness classification of extracted top-level entries.
//!
//! The rule is a naming heuristic: an entry whose name contains `fuzz` or
//! `afl` (any case) is fuzzing-harness code, everything else is project
//! source. File contents are never inspected. Names that merely contain
//! `afl` inside an unrelated word are misclassified as harness; that risk is
//! accepted, and the harness entries are kept in the corpus for provenance.

use serde::{Deserialize, Serialize};

use crate::extract::ExtractedTree;

/// Substrings that mark a harness entry.
const HARNESS_MARKERS: &[&str] = &["fuzz", "afl"];

/// Role of an extracted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Harness,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Harness => write!(f, "harness"),
        }
    }
}

/// An entry name tagged with its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedEntry {
    pub name: String,
    pub role: Role,
}

/// Labels top-level entries of an extracted tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceClassifier;

impl SourceClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Role of a single entry name.
    pub fn role_of(&self, name: &str) -> Role {
        let lower = name.to_lowercase();
        if HARNESS_MARKERS.iter().any(|m| lower.contains(m)) {
            Role::Harness
        } else {
            Role::Source
        }
    }

    /// Tags every top-level entry of `tree`, preserving its order.
    ///
    /// Names that are not valid UTF-8 are matched and recorded in their lossy
    /// form; the tree itself keeps the raw names.
    pub fn classify(&self, tree: &ExtractedTree) -> Vec<ClassifiedEntry> {
        tree.entries
            .iter()
            .map(|raw| {
                let name = raw.to_string_lossy().into_owned();
                let role = self.role_of(&name);
                ClassifiedEntry { name, role }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::path::PathBuf;

    fn tree(entries: &[&str]) -> ExtractedTree {
        ExtractedTree {
            root: PathBuf::from("/tmp/tree"),
            entries: entries.iter().map(OsString::from).collect(),
            provenance: "/src".to_string(),
        }
    }

    #[test]
    fn test_mixed_tree() {
        let classified = SourceClassifier::new().classify(&tree(&["core", "fuzz_target", "AFL_driver"]));
        assert_eq!(
            classified,
            vec![
                ClassifiedEntry {
                    name: "core".to_string(),
                    role: Role::Source
                },
                ClassifiedEntry {
                    name: "fuzz_target".to_string(),
                    role: Role::Harness
                },
                ClassifiedEntry {
                    name: "AFL_driver".to_string(),
                    role: Role::Harness
                },
            ]
        );
    }

    #[test]
    fn test_markers_any_case_any_position() {
        let classifier = SourceClassifier::new();
        for name in ["FUZZ", "libFuzzer", "honggfuzz", "aflplusplus", "my-AfL", "xfuzzx"] {
            assert_eq!(classifier.role_of(name), Role::Harness, "{name}");
        }
        for name in ["binutils", "libxml2", "fu_zz", "a-f-l", ""] {
            assert_eq!(classifier.role_of(name), Role::Source, "{name}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_classified_lossily() {
        use std::os::unix::ffi::OsStringExt;

        let mut t = tree(&["core"]);
        t.entries.push(OsString::from_vec(b"fuzz\xff".to_vec()));
        let classified = SourceClassifier::new().classify(&t);
        assert_eq!(classified[1].role, Role::Harness);
        assert_eq!(classified[1].name, "fuzz\u{fffd}");
    }

    #[test]
    fn test_known_false_positive() {
        // "afl" inside an unrelated word still reads as harness.
        assert_eq!(SourceClassifier::new().role_of("waflib"), Role::Harness);
    }
}
