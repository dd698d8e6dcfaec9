//! Environment references for the two snapshots of a case.
//!
//! Each case has a pre-fix and a post-fix image named
//! `<namespace>:<localId>-vul` and `<namespace>:<localId>-fix`. Resolution is
//! pure; whether the images actually exist is only discovered at extraction.

use serde::{Deserialize, Serialize};

/// Which snapshot of a case an environment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Vulnerable snapshot.
    PreFix,
    /// Patched snapshot.
    PostFix,
}

impl Side {
    /// Image tag suffix.
    pub fn tag_suffix(&self) -> &'static str {
        match self {
            Side::PreFix => "vul",
            Side::PostFix => "fix",
        }
    }

    /// Name of the normalized source directory in a case entry.
    pub fn source_dir(&self) -> &'static str {
        match self {
            Side::PreFix => "buggy_src",
            Side::PostFix => "fixed_src",
        }
    }

    /// Name of the harness directory under `harness/` in a case entry.
    pub fn harness_dir(&self) -> &'static str {
        match self {
            Side::PreFix => "buggy",
            Side::PostFix => "fixed",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::PreFix => write!(f, "pre-fix"),
            Side::PostFix => write!(f, "post-fix"),
        }
    }
}

/// A name/tag reference to one environment image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub case_id: u64,
    pub side: Side,
    /// Full image reference, e.g. `n132/arvo:25402-vul`.
    pub image: String,
}

impl std::fmt::Display for EnvironmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.image)
    }
}

/// The pre-fix and post-fix references of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentPair {
    pub pre_fix: EnvironmentRef,
    pub post_fix: EnvironmentRef,
}

/// Derives environment references from a naming template.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    namespace: String,
}

impl ImageResolver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reference for one side of a case.
    pub fn reference(&self, case_id: u64, side: Side) -> EnvironmentRef {
        EnvironmentRef {
            case_id,
            side,
            image: format!("{}:{}-{}", self.namespace, case_id, side.tag_suffix()),
        }
    }

    /// Both references for a case. Never fails.
    pub fn resolve(&self, case_id: u64) -> EnvironmentPair {
        EnvironmentPair {
            pre_fix: self.reference(case_id, Side::PreFix),
            post_fix: self.reference(case_id, Side::PostFix),
        }
    }
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new("n132/arvo")
    }
}
