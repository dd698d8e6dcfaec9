//! Normalized case directories.
//!
//! A case is staged under `<output_root>/.work/` and renamed into
//! `<output_root>/<localId>/` only once fully written. Layout:
//!
//! ```text
//! <localId>/
//!   buggy_src/        source-tagged entries of the pre-fix tree
//!   fixed_src/        source-tagged entries of the post-fix tree
//!   harness/buggy/    harness-tagged entries, kept for provenance
//!   harness/fixed/
//!   poc               optional
//!   arvo              optional
//!   case.json
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::classify::{Role, SourceClassifier};
use crate::corpus::entry::{CorpusEntry, EntryStatus};
use crate::corpus::index::{CorpusIndex, EventAction};
use crate::corpus::manifest::{
    tree_digest, ArtifactManifest, CaseManifest, CaseSummary, SideManifest,
};
use crate::environment::Side;
use crate::error::{CorpusError, ExtractionError};
use crate::extract::{ArtifactCopy, ArtifactKind, ExtractedTree, Extraction};
use crate::metadata::CaseRecord;

/// Scratch directory under the output root.
pub const WORK_DIR: &str = ".work";

/// Extraction result for one side of a case.
pub type SideResult = Result<Extraction, ExtractionError>;

/// What [`CorpusAssembler::assemble`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    Written(CorpusEntry),
    /// A complete entry already existed and was left untouched.
    Skipped(CorpusEntry),
}

impl Assembly {
    pub fn entry(&self) -> &CorpusEntry {
        match self {
            Assembly::Written(entry) | Assembly::Skipped(entry) => entry,
        }
    }

    pub fn into_entry(self) -> CorpusEntry {
        match self {
            Assembly::Written(entry) | Assembly::Skipped(entry) => entry,
        }
    }
}

#[derive(Clone)]
pub struct CorpusAssembler {
    output_root: PathBuf,
    index: CorpusIndex,
    classifier: SourceClassifier,
}

impl CorpusAssembler {
    /// Opens the corpus at `output_root`, creating the index if needed.
    ///
    /// Scratch left in `.work/` by an interrupted run is removed; one run owns
    /// an output root at a time.
    pub async fn open(output_root: &Path) -> Result<Self, CorpusError> {
        let index = CorpusIndex::open(output_root).await?;
        let work_root = output_root.join(WORK_DIR);
        tokio::fs::create_dir_all(&work_root).await?;

        let swept = sweep_scratch(&work_root).await?;
        if swept > 0 {
            tracing::info!(path = %work_root.display(), entries = swept, "Removed stale scratch directories");
        }

        Ok(Self {
            output_root: output_root.to_path_buf(),
            index,
            classifier: SourceClassifier::new(),
        })
    }

    pub fn index(&self) -> &CorpusIndex {
        &self.index
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn case_dir(&self, case_id: u64) -> PathBuf {
        self.output_root.join(case_id.to_string())
    }

    /// Fresh scratch directory for one attempt at `case_id`.
    pub async fn new_work_dir(&self, case_id: u64) -> Result<PathBuf, CorpusError> {
        let dir = self.output_root.join(WORK_DIR).join(scratch_name(case_id, "extract"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// The indexed entry for `case_id` if it is complete and still intact on disk.
    pub async fn existing_complete(&self, case_id: u64) -> Result<Option<CorpusEntry>, CorpusError> {
        Ok(self.index.get(case_id).await?.filter(CorpusEntry::is_intact))
    }

    /// Writes the normalized case directory and its index row.
    ///
    /// Unless `force` is set, an intact complete entry is returned unchanged.
    pub async fn assemble(
        &self,
        record: &CaseRecord,
        pre: &SideResult,
        post: &SideResult,
        force: bool,
    ) -> Result<Assembly, CorpusError> {
        let case_id = record.local_id;
        let _guard = self.index.lock(case_id).await;

        if !force {
            if let Some(existing) = self.existing_complete(case_id).await? {
                self.index
                    .record_event(case_id, EventAction::Skipped, Some(existing.status), None)
                    .await?;
                tracing::info!(case_id = case_id, "Complete entry exists, skipping assembly");
                return Ok(Assembly::Skipped(existing));
            }
        }

        let sides = vec![
            SideInput::from_result(Side::PreFix, pre),
            SideInput::from_result(Side::PostFix, post),
        ];
        let summary = CaseSummary::from(record);
        let case_dir = self.case_dir(case_id);
        let work_root = self.output_root.join(WORK_DIR);
        let classifier = self.classifier;

        let target = case_dir.clone();
        let staged = tokio::task::spawn_blocking(move || {
            build_case(case_id, &work_root, &target, classifier, summary, &sides)
        })
        .await
        .map_err(|e| CorpusError::WriteFailed {
            case_id,
            reason: format!("assembly task failed: {e}"),
        })?
        .map_err(|e| CorpusError::WriteFailed {
            case_id,
            reason: e.to_string(),
        })?;

        let entry = CorpusEntry {
            case_id,
            status: staged.status,
            reason: staged.reason,
            buggy_src: staged
                .extracted
                .contains(&Side::PreFix)
                .then(|| case_dir.join(Side::PreFix.source_dir())),
            fixed_src: staged
                .extracted
                .contains(&Side::PostFix)
                .then(|| case_dir.join(Side::PostFix.source_dir())),
            poc: staged
                .artifacts
                .contains(&ArtifactKind::Poc)
                .then(|| case_dir.join(ArtifactKind::Poc.file_name())),
            runner: staged
                .artifacts
                .contains(&ArtifactKind::Runner)
                .then(|| case_dir.join(ArtifactKind::Runner.file_name())),
            case_dir,
            updated_at: Utc::now(),
        };

        self.index.upsert(&entry, EventAction::Assembled).await?;
        tracing::info!(
            case_id = case_id,
            status = %entry.status,
            reason = entry.reason.as_deref().unwrap_or(""),
            "Case assembled"
        );
        Ok(Assembly::Written(entry))
    }

    /// Marks `case_id` failed in the index without touching its directory.
    ///
    /// Used when assembly itself could not complete. An intact complete
    /// entry is never downgraded unless `force` is set.
    pub async fn record_failure(
        &self,
        case_id: u64,
        reason: &str,
        force: bool,
    ) -> Result<CorpusEntry, CorpusError> {
        let _guard = self.index.lock(case_id).await;

        if !force {
            if let Some(existing) = self.existing_complete(case_id).await? {
                self.index
                    .record_event(case_id, EventAction::Failed, Some(existing.status), Some(reason))
                    .await?;
                return Ok(existing);
            }
        }

        let entry = CorpusEntry {
            case_id,
            status: EntryStatus::Failed,
            reason: Some(reason.to_string()),
            case_dir: self.case_dir(case_id),
            buggy_src: None,
            fixed_src: None,
            poc: None,
            runner: None,
            updated_at: Utc::now(),
        };
        self.index.upsert(&entry, EventAction::Failed).await?;
        Ok(entry)
    }
}

struct SideInput {
    side: Side,
    image: String,
    outcome: Result<(ExtractedTree, Vec<ArtifactCopy>), String>,
}

impl SideInput {
    fn from_result(side: Side, result: &SideResult) -> Self {
        match result {
            Ok(extraction) => Self {
                side,
                image: extraction.reference.image.clone(),
                outcome: Ok((extraction.tree.clone(), extraction.artifacts.clone())),
            },
            Err(e) => Self {
                side,
                image: e.reference().to_string(),
                outcome: Err(e.to_string()),
            },
        }
    }
}

struct Staged {
    status: EntryStatus,
    reason: Option<String>,
    extracted: Vec<Side>,
    artifacts: Vec<ArtifactKind>,
}

async fn sweep_scratch(work_root: &Path) -> io::Result<usize> {
    let mut reader = tokio::fs::read_dir(work_root).await?;
    let mut swept = 0;
    while let Some(entry) = reader.next_entry().await? {
        crate::extract::clear_path(&entry.path()).await?;
        swept += 1;
    }
    Ok(swept)
}

fn scratch_name(case_id: u64, purpose: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{case_id}-{}.{purpose}", &suffix[..8])
}

fn build_case(
    case_id: u64,
    work_root: &Path,
    case_dir: &Path,
    classifier: SourceClassifier,
    metadata: CaseSummary,
    sides: &[SideInput],
) -> io::Result<Staged> {
    let staging = work_root.join(scratch_name(case_id, "assembling"));
    fs::create_dir_all(&staging)?;

    let result = stage(&staging, case_id, classifier, metadata, sides)
        .and_then(|staged| install(&staging, case_dir, work_root, case_id).map(|()| staged));
    if result.is_err() && staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}

fn stage(
    staging: &Path,
    case_id: u64,
    classifier: SourceClassifier,
    metadata: CaseSummary,
    sides: &[SideInput],
) -> io::Result<Staged> {
    let mut side_manifests = Vec::with_capacity(sides.len());
    let mut extracted = Vec::new();
    let mut empty = Vec::new();
    let mut failures = Vec::new();

    for input in sides {
        let (tree, _) = match &input.outcome {
            Ok(ok) => ok,
            Err(reason) => {
                failures.push(format!("{}: {reason}", input.side));
                side_manifests.push(SideManifest {
                    side: input.side,
                    image: input.image.clone(),
                    provenance: None,
                    entries: Vec::new(),
                    source_digest: None,
                    error: Some(reason.clone()),
                });
                continue;
            }
        };

        let source_dir = staging.join(input.side.source_dir());
        let harness_dir = staging.join("harness").join(input.side.harness_dir());
        fs::create_dir_all(&source_dir)?;

        let entries = classifier.classify(tree);
        let mut sources = 0;
        // Moves use the on-disk name; the classified name may be lossy.
        for (raw, entry) in tree.entries.iter().zip(&entries) {
            let from = tree.root.join(raw);
            let to = match entry.role {
                Role::Source => {
                    sources += 1;
                    source_dir.join(raw)
                }
                Role::Harness => {
                    fs::create_dir_all(&harness_dir)?;
                    harness_dir.join(raw)
                }
            };
            move_entry(&from, &to)?;
        }

        if sources == 0 {
            empty.push(input.side);
        }
        extracted.push(input.side);
        side_manifests.push(SideManifest {
            side: input.side,
            image: input.image.clone(),
            provenance: Some(tree.provenance.clone()),
            entries,
            source_digest: Some(tree_digest(&source_dir)?),
            error: None,
        });
    }

    let mut artifact_manifests = Vec::new();
    let mut artifacts = Vec::new();
    for kind in [ArtifactKind::Poc, ArtifactKind::Runner] {
        let manifest = stage_artifact(staging, kind, sides)?;
        if manifest.file.is_some() {
            artifacts.push(kind);
        }
        artifact_manifests.push(manifest);
    }

    let (status, reason) = if !failures.is_empty() {
        (EntryStatus::Failed, Some(failures.join("; ")))
    } else if !empty.is_empty() {
        let sides: Vec<String> = empty.iter().map(ToString::to_string).collect();
        (
            EntryStatus::Partial,
            Some(format!(
                "{} normalized tree is empty (every entry is harness-tagged)",
                sides.join(" and ")
            )),
        )
    } else {
        (EntryStatus::Complete, None)
    };

    CaseManifest {
        case_id,
        status,
        reason: reason.clone(),
        assembled_at: Utc::now(),
        metadata,
        sides: side_manifests,
        artifacts: artifact_manifests,
    }
    .write(staging)?;

    Ok(Staged {
        status,
        reason,
        extracted,
        artifacts,
    })
}

/// Takes an artifact from the pre-fix side, falling back to the post-fix side.
fn stage_artifact(
    staging: &Path,
    kind: ArtifactKind,
    sides: &[SideInput],
) -> io::Result<ArtifactManifest> {
    let mut omitted = None;
    for input in sides {
        let Ok((_, copies)) = &input.outcome else {
            continue;
        };
        let Some(copy) = copies.iter().find(|c| c.kind == kind) else {
            continue;
        };
        match &copy.path {
            Some(path) => {
                move_entry(path, &staging.join(kind.file_name()))?;
                return Ok(ArtifactManifest {
                    kind,
                    file: Some(kind.file_name().to_string()),
                    from: Some(input.side),
                    omitted: None,
                });
            }
            None => {
                if omitted.is_none() {
                    omitted = copy.omitted.clone();
                }
            }
        }
    }

    Ok(ArtifactManifest {
        kind,
        file: None,
        from: None,
        omitted: Some(omitted.unwrap_or_else(|| "no side was extracted".to_string())),
    })
}

/// Renames the staged directory over `case_dir`.
fn install(staging: &Path, case_dir: &Path, work_root: &Path, case_id: u64) -> io::Result<()> {
    let replaced = work_root.join(scratch_name(case_id, "replaced"));
    let had_previous = case_dir.exists();
    if had_previous {
        fs::rename(case_dir, &replaced)?;
    }

    if let Err(e) = fs::rename(staging, case_dir) {
        if had_previous {
            let _ = fs::rename(&replaced, case_dir);
        }
        return Err(e);
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(&replaced) {
            tracing::warn!(case_id = case_id, error = %e, "Failed to remove replaced case directory");
        }
    }
    Ok(())
}

/// Moves a file or tree, copying when a rename is not possible.
fn move_entry(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let meta = fs::symlink_metadata(from)?;
    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(from) {
            let entry = entry.map_err(io::Error::other)?;
            let rel = entry.path().strip_prefix(from).map_err(io::Error::other)?;
            let dest = to.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&dest)?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }
        fs::remove_dir_all(from)
    } else if meta.file_type().is_symlink() {
        copy_symlink(from, to)?;
        fs::remove_file(from)
    } else {
        fs::copy(from, to)?;
        fs::remove_file(from)
    }
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}
