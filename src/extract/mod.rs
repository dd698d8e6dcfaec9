//! Source tree extraction from case environments.
//!
//! [`CaseExtractor::extract`] instantiates one environment, copies the first
//! candidate source path that yields a non-empty tree, copies the optional
//! artifacts best-effort, and always removes the environment before
//! returning.
//!
//! Layout of an extraction directory:
//! ```text
//! <out_dir>/tree/            copied source tree (candidate root stripped)
//! <out_dir>/artifacts/poc    proof-of-concept input, when present
//! <out_dir>/artifacts/arvo   runner script, when present
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::environment::EnvironmentRef;
use crate::error::{DockerError, ExtractionError};
use crate::execution::{EnvironmentLease, EnvironmentRuntime};
use crate::pipeline::{PipelineConfig, RunContext};

/// Directory under the extraction dir holding the copied tree.
pub const TREE_DIR: &str = "tree";

/// Directory under the extraction dir holding artifact copies.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// A copied source tree on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTree {
    pub root: PathBuf,
    /// Top-level entry names as found on disk, sorted.
    pub entries: Vec<OsString>,
    /// The in-environment path that satisfied the copy.
    pub provenance: String,
}

/// Ordered in-environment source locations; the first hit wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePaths {
    primary: String,
    fallbacks: Vec<String>,
}

impl CandidatePaths {
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
        }
    }

    /// Builds from a priority-ordered list. Returns `None` for an empty list.
    pub fn from_list(paths: &[String]) -> Option<Self> {
        let (primary, fallbacks) = paths.split_first()?;
        Some(Self::new(primary.clone(), fallbacks.to_vec()))
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// All candidates in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

impl Default for CandidatePaths {
    fn default() -> Self {
        Self::new("/src", vec!["/work/src".to_string(), "/root/src".to_string()])
    }
}

/// Optional artifacts copied next to the source trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Crash-triggering input.
    Poc,
    /// Auxiliary runner script.
    Runner,
}

impl ArtifactKind {
    /// File name of the artifact in a case entry.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Poc => "poc",
            ArtifactKind::Runner => "arvo",
        }
    }
}

/// Where an artifact lives inside the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    pub path: String,
}

/// Outcome of one best-effort artifact copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCopy {
    pub kind: ArtifactKind,
    /// In-environment path that was tried.
    pub source: String,
    /// Local copy, when the artifact was present.
    pub path: Option<PathBuf>,
    /// Why the artifact is missing.
    pub omitted: Option<String>,
}

impl ArtifactCopy {
    pub fn is_present(&self) -> bool {
        self.path.is_some()
    }
}

/// Result of environment removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum CleanupOutcome {
    Removed,
    Failed(String),
}

/// Everything one environment produced.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub reference: EnvironmentRef,
    pub tree: ExtractedTree,
    pub artifacts: Vec<ArtifactCopy>,
    pub cleanup: CleanupOutcome,
}

impl Extraction {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactCopy> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

/// Copies source trees and artifacts out of ephemeral environments.
pub struct CaseExtractor {
    runtime: Arc<dyn EnvironmentRuntime>,
    candidates: CandidatePaths,
    artifacts: Vec<ArtifactSpec>,
    environment_timeout: Duration,
    cleanup_timeout: Duration,
}

impl CaseExtractor {
    pub fn new(runtime: Arc<dyn EnvironmentRuntime>) -> Self {
        Self {
            runtime,
            candidates: CandidatePaths::default(),
            artifacts: vec![
                ArtifactSpec {
                    kind: ArtifactKind::Poc,
                    path: "/tmp/poc".to_string(),
                },
                ArtifactSpec {
                    kind: ArtifactKind::Runner,
                    path: "/bin/arvo".to_string(),
                },
            ],
            environment_timeout: Duration::from_secs(900),
            cleanup_timeout: Duration::from_secs(60),
        }
    }

    /// Builds an extractor for one run: in-environment locations come from
    /// the configuration, deadlines from the run context.
    pub fn for_run(
        runtime: Arc<dyn EnvironmentRuntime>,
        config: &PipelineConfig,
        context: &RunContext,
    ) -> Self {
        let mut extractor = Self::new(runtime)
            .with_artifact(ArtifactKind::Poc, &config.poc_path)
            .with_artifact(ArtifactKind::Runner, &config.runner_path)
            .with_timeouts(context.environment_timeout, context.cleanup_timeout);
        if let Some(candidates) = CandidatePaths::from_list(&config.source_candidates) {
            extractor = extractor.with_candidates(candidates);
        }
        extractor
    }

    pub fn with_candidates(mut self, candidates: CandidatePaths) -> Self {
        self.candidates = candidates;
        self
    }

    /// Sets the in-environment location of an artifact.
    pub fn with_artifact(mut self, kind: ArtifactKind, path: impl Into<String>) -> Self {
        let path = path.into();
        match self.artifacts.iter_mut().find(|a| a.kind == kind) {
            Some(spec) => spec.path = path,
            None => self.artifacts.push(ArtifactSpec { kind, path }),
        }
        self
    }

    pub fn with_timeouts(mut self, environment: Duration, cleanup: Duration) -> Self {
        self.environment_timeout = environment;
        self.cleanup_timeout = cleanup;
        self
    }

    pub fn candidates(&self) -> &CandidatePaths {
        &self.candidates
    }

    /// Extracts `reference` into `out_dir`.
    ///
    /// Create and copy-out share one deadline. Removal is attempted on every
    /// path once the environment exists, under its own deadline; a removal
    /// failure is logged and reported in [`Extraction::cleanup`] only.
    pub async fn extract(
        &self,
        reference: &EnvironmentRef,
        out_dir: &Path,
    ) -> Result<Extraction, ExtractionError> {
        let io_err = |source: std::io::Error| ExtractionError::Io {
            reference: reference.image.clone(),
            source,
        };
        tokio::fs::create_dir_all(out_dir).await.map_err(io_err)?;

        let deadline = tokio::time::Instant::now() + self.environment_timeout;
        let timed_out = || ExtractionError::Timeout {
            reference: reference.image.clone(),
            limit: self.environment_timeout,
        };
        let instantiation = |reason: String| ExtractionError::Instantiation {
            reference: reference.image.clone(),
            reason,
        };

        // Create runs in its own task so a late answer still yields a lease.
        let mut acquiring = tokio::spawn({
            let runtime = Arc::clone(&self.runtime);
            let reference = reference.clone();
            async move { EnvironmentLease::acquire(runtime, &reference).await }
        });

        let lease = match tokio::time::timeout_at(deadline, &mut acquiring).await {
            Ok(Ok(Ok(lease))) => lease,
            Ok(Ok(Err(e))) => {
                tracing::warn!(image = %reference, error = %e, "Environment instantiation failed");
                return Err(instantiation(e.to_string()));
            }
            Ok(Err(e)) => return Err(instantiation(format!("create task failed: {e}"))),
            Err(_) => {
                tracing::warn!(
                    image = %reference,
                    limit = ?self.environment_timeout,
                    "Environment deadline exceeded during create"
                );
                self.release_late(acquiring, reference).await;
                return Err(timed_out());
            }
        };

        let copied =
            tokio::time::timeout_at(deadline, self.copy_from(&lease, reference, out_dir)).await;

        let cleanup = match lease.release(self.cleanup_timeout).await {
            Ok(()) => CleanupOutcome::Removed,
            Err(e) => {
                tracing::warn!(image = %reference, error = %e, "Environment cleanup failed");
                CleanupOutcome::Failed(e.to_string())
            }
        };

        let (tree, artifacts) = match copied {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    image = %reference,
                    limit = ?self.environment_timeout,
                    "Environment deadline exceeded"
                );
                return Err(timed_out());
            }
        };

        Ok(Extraction {
            reference: reference.clone(),
            tree,
            artifacts,
            cleanup,
        })
    }

    /// Waits for a create that outlived the deadline and removes whatever it
    /// produced. Both waits are bounded by the cleanup deadline; a create still
    /// pending after that is left to a background task.
    async fn release_late(
        &self,
        mut acquiring: JoinHandle<Result<EnvironmentLease, DockerError>>,
        reference: &EnvironmentRef,
    ) {
        let late = match tokio::time::timeout(self.cleanup_timeout, &mut acquiring).await {
            Ok(Ok(Ok(lease))) => lease,
            Ok(_) => return,
            Err(_) => {
                tracing::warn!(image = %reference, "Create still pending; removal continues in background");
                let cleanup_timeout = self.cleanup_timeout;
                tokio::spawn(async move {
                    if let Ok(Ok(lease)) = acquiring.await {
                        if let Err(e) = lease.release(cleanup_timeout).await {
                            tracing::warn!(error = %e, "Background removal of late environment failed");
                        }
                    }
                });
                return;
            }
        };

        if let Err(e) = late.release(self.cleanup_timeout).await {
            tracing::warn!(image = %reference, error = %e, "Environment cleanup failed");
        }
    }

    async fn copy_from(
        &self,
        lease: &EnvironmentLease,
        reference: &EnvironmentRef,
        out_dir: &Path,
    ) -> Result<(ExtractedTree, Vec<ArtifactCopy>), ExtractionError> {
        let io_err = |source: std::io::Error| ExtractionError::Io {
            reference: reference.image.clone(),
            source,
        };

        let tree_dir = out_dir.join(TREE_DIR);
        let mut tried = Vec::new();
        let mut tree = None;

        for candidate in self.candidates.iter() {
            clear_path(&tree_dir).await.map_err(io_err)?;
            tried.push(candidate.to_string());

            match lease.copy_out(candidate, &tree_dir).await {
                Ok(()) => {
                    let entries = top_level_entries(&tree_dir).await.map_err(io_err)?;
                    if entries.is_empty() {
                        tracing::debug!(image = %reference, path = candidate, "Candidate is empty");
                        continue;
                    }
                    tracing::info!(
                        image = %reference,
                        path = candidate,
                        entries = entries.len(),
                        "Source tree extracted"
                    );
                    tree = Some(ExtractedTree {
                        root: tree_dir.clone(),
                        entries,
                        provenance: candidate.to_string(),
                    });
                    break;
                }
                Err(DockerError::PathNotFound { .. }) => {
                    tracing::debug!(image = %reference, path = candidate, "Candidate not present");
                }
                Err(e) => {
                    tracing::warn!(image = %reference, path = candidate, error = %e, "Candidate copy failed");
                }
            }
        }

        let Some(tree) = tree else {
            clear_path(&tree_dir).await.map_err(io_err)?;
            return Err(ExtractionError::NoCandidate {
                reference: reference.image.clone(),
                tried,
            });
        };

        let artifact_dir = out_dir.join(ARTIFACTS_DIR);
        let mut artifacts = Vec::with_capacity(self.artifacts.len());
        for spec in &self.artifacts {
            let dest = artifact_dir.join(spec.kind.file_name());
            clear_path(&dest).await.map_err(io_err)?;

            let copy = match lease.copy_out(&spec.path, &dest).await {
                Ok(()) if tokio::fs::symlink_metadata(&dest).await.is_ok() => ArtifactCopy {
                    kind: spec.kind,
                    source: spec.path.clone(),
                    path: Some(dest),
                    omitted: None,
                },
                Ok(()) => ArtifactCopy {
                    kind: spec.kind,
                    source: spec.path.clone(),
                    path: None,
                    omitted: Some("copy produced no file".to_string()),
                },
                Err(e) => {
                    clear_path(&dest).await.map_err(io_err)?;
                    tracing::debug!(image = %reference, artifact = spec.kind.file_name(), reason = %e, "Artifact omitted");
                    ArtifactCopy {
                        kind: spec.kind,
                        source: spec.path.clone(),
                        path: None,
                        omitted: Some(e.to_string()),
                    }
                }
            };
            artifacts.push(copy);
        }

        Ok((tree, artifacts))
    }
}

/// Sorted names of the entries directly under `dir`.
pub async fn top_level_entries(dir: &Path) -> std::io::Result<Vec<OsString>> {
    let mut names = Vec::new();
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e),
    };
    while let Some(entry) = reader.next_entry().await? {
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Removes a file or directory tree if it exists.
pub(crate) async fn clear_path(path: &Path) -> std::io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
