//! Pipeline orchestrator for building the corpus.
//!
//! This module provides the `PipelineOrchestrator` that drives, per case:
//! - Metadata resolution
//! - Image resolution into a pre-fix/post-fix pair
//! - Extraction of both sides (concurrently)
//! - Classification and assembly into the corpus
//!
//! Cases run in parallel up to the configured limit. A failure is recorded
//! at the case boundary and never affects sibling cases; only the global
//! preflight (metadata stores and runtime reachable) can abort a run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{watch, Semaphore, SemaphorePermit};

use crate::corpus::{Assembly, CorpusAssembler, EntryStatus, EventAction};
use crate::environment::{ImageResolver, Side};
use crate::error::{CorpusError, DockerError, MetadataError};
use crate::execution::EnvironmentRuntime;
use crate::extract::CaseExtractor;
use crate::metadata::{MetadataStore, SanityReport};

use super::config::{ConfigError, PipelineConfig, RunContext};
use super::summary::{CaseOutcome, OutcomeStatus, RunSummary};

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metadata stores missing or unreadable.
    #[error("Metadata stores unavailable: {0}")]
    Metadata(#[from] MetadataError),

    /// Environment runtime unreachable.
    #[error("Environment runtime unavailable: {0}")]
    Runtime(#[from] DockerError),

    /// Corpus output could not be opened.
    #[error("Corpus error: {0}")]
    Corpus(#[from] CorpusError),

    /// No cases to process.
    #[error("No case IDs given")]
    NoCases,
}

/// Main pipeline orchestrator that coordinates all components.
pub struct PipelineOrchestrator {
    metadata: MetadataStore,
    resolver: ImageResolver,
    extractor: CaseExtractor,
    assembler: CorpusAssembler,
    runtime: Arc<dyn EnvironmentRuntime>,
    context: RunContext,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator, opening the metadata stores and the corpus.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the configuration is invalid or a store
    /// cannot be opened.
    pub async fn new(
        config: &PipelineConfig,
        runtime: Arc<dyn EnvironmentRuntime>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let context = config.run_context();
        let metadata = MetadataStore::open(config).await?;
        let assembler = CorpusAssembler::open(&context.output_root).await?;
        Ok(Self::from_parts(config, metadata, assembler, runtime))
    }

    /// Creates an orchestrator from already-opened components.
    ///
    /// The run context is frozen from `config` here; the corpus the
    /// assembler writes to is the one it was opened on.
    pub fn from_parts(
        config: &PipelineConfig,
        metadata: MetadataStore,
        assembler: CorpusAssembler,
        runtime: Arc<dyn EnvironmentRuntime>,
    ) -> Self {
        let mut context = config.run_context();
        if context.output_root != assembler.output_root() {
            tracing::debug!(
                configured = %context.output_root.display(),
                opened = %assembler.output_root().display(),
                "Using the output root the corpus was opened on"
            );
            context.output_root = assembler.output_root().to_path_buf();
        }

        Self {
            metadata,
            resolver: ImageResolver::new(config.image_namespace.clone()),
            extractor: CaseExtractor::for_run(Arc::clone(&runtime), config, &context),
            assembler,
            runtime,
            context,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn assembler(&self) -> &CorpusAssembler {
        &self.assembler
    }

    /// Checks the global prerequisites of a run.
    pub async fn preflight(&self) -> Result<SanityReport, PipelineError> {
        let report = self.metadata.sanity_check().await?;
        self.runtime.ping().await?;
        Ok(report)
    }

    /// Runs every case in `case_ids`, at most `context.concurrency` at a time.
    ///
    /// Duplicate IDs are processed once. Setting `abort` stops scheduling new
    /// cases; cases already in flight run to the end of their cleanup.
    pub async fn run(
        &self,
        case_ids: &[u64],
        abort: watch::Receiver<bool>,
    ) -> Result<RunSummary, PipelineError> {
        if case_ids.is_empty() {
            return Err(PipelineError::NoCases);
        }
        self.preflight().await?;

        let mut seen = HashSet::new();
        let unique: Vec<u64> = case_ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        tracing::info!(
            cases = unique.len(),
            concurrency = self.context.concurrency,
            force = self.context.force,
            "Starting corpus run"
        );

        let limiter = Semaphore::new(self.context.concurrency);
        let futures: Vec<_> = unique
            .into_iter()
            .map(|case_id| {
                let limiter = &limiter;
                let abort = abort.clone();
                async move {
                    let Some(_permit) = wait_for_permit(limiter, abort).await else {
                        tracing::info!(case_id = case_id, "Run aborted before case started");
                        return CaseOutcome::without_entry(
                            case_id,
                            OutcomeStatus::Cancelled,
                            "run aborted",
                            Default::default(),
                        );
                    };
                    self.run_case(case_id).await
                }
            })
            .collect();

        let summary = RunSummary::from_outcomes(futures::future::join_all(futures).await);
        tracing::info!(
            complete = summary.counts.complete,
            skipped = summary.counts.skipped,
            partial = summary.counts.partial,
            failed = summary.counts.failed,
            metadata_unavailable = summary.counts.metadata_unavailable,
            cancelled = summary.counts.cancelled,
            "Corpus run finished"
        );
        Ok(summary)
    }

    /// Processes one case end to end. Never fails; every error becomes the
    /// case's outcome.
    pub async fn run_case(&self, case_id: u64) -> CaseOutcome {
        let started = Instant::now();
        let force = self.context.force;

        if !force {
            match self.assembler.existing_complete(case_id).await {
                Ok(Some(entry)) => {
                    tracing::info!(case_id = case_id, "Already complete, skipping");
                    if let Err(e) = self
                        .assembler
                        .index()
                        .record_event(case_id, EventAction::Skipped, Some(EntryStatus::Complete), None)
                        .await
                    {
                        tracing::warn!(case_id = case_id, error = %e, "Failed to log skip");
                    }
                    return CaseOutcome::skipped(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(case_id = case_id, error = %e, "Corpus index lookup failed, rebuilding");
                }
            }
        }

        let record = match self.metadata.resolve(case_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(case_id = case_id, error = %e, "Metadata unavailable");
                return CaseOutcome::without_entry(
                    case_id,
                    OutcomeStatus::MetadataUnavailable,
                    e.to_string(),
                    started.elapsed(),
                );
            }
        };

        let pair = self.resolver.resolve(case_id);
        let work_dir = match self.assembler.new_work_dir(case_id).await {
            Ok(dir) => dir,
            Err(e) => return self.fail_case(case_id, format!("work directory: {e}"), started).await,
        };

        tracing::info!(
            case_id = case_id,
            pre_fix = %pair.pre_fix,
            post_fix = %pair.post_fix,
            "Extracting case"
        );
        let pre_dir = work_dir.join(Side::PreFix.tag_suffix());
        let post_dir = work_dir.join(Side::PostFix.tag_suffix());
        let (pre, post) = tokio::join!(
            self.extractor.extract(&pair.pre_fix, &pre_dir),
            self.extractor.extract(&pair.post_fix, &post_dir),
        );

        let outcome = match self.assembler.assemble(&record, &pre, &post, force).await {
            Ok(Assembly::Written(entry)) => CaseOutcome::from_entry(entry, started.elapsed()),
            Ok(Assembly::Skipped(entry)) => CaseOutcome::skipped(entry),
            Err(e) => self.fail_case(case_id, format!("assembly: {e}"), started).await,
        };

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::warn!(case_id = case_id, path = %work_dir.display(), error = %e, "Failed to remove work directory");
        }
        outcome
    }

    async fn fail_case(&self, case_id: u64, reason: String, started: Instant) -> CaseOutcome {
        tracing::error!(case_id = case_id, reason = %reason, "Case failed");
        let mut outcome = CaseOutcome::without_entry(
            case_id,
            OutcomeStatus::Failed,
            reason.clone(),
            started.elapsed(),
        );
        match self
            .assembler
            .record_failure(case_id, &reason, self.context.force)
            .await
        {
            Ok(entry) => outcome.entry = Some(entry),
            Err(e) => tracing::warn!(case_id = case_id, error = %e, "Failed to record failure in index"),
        }
        outcome
    }
}

/// Waits for a slot, giving up as soon as `abort` is set.
async fn wait_for_permit(
    limiter: &Semaphore,
    mut abort: watch::Receiver<bool>,
) -> Option<SemaphorePermit<'_>> {
    loop {
        if *abort.borrow_and_update() {
            return None;
        }
        tokio::select! {
            permit = limiter.acquire() => {
                let permit = permit.ok()?;
                return (!*abort.borrow()).then_some(permit);
            }
            changed = abort.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can abort any more.
                    return limiter.acquire().await.ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::FakeRuntime;
    use crate::metadata::{MetadataDatabase, MetadataRepository};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::path::Path;
    use std::time::Duration;

    async fn fixture(dir: &Path, ids: &[u64]) -> MetadataStore {
        let db = dir.join("arvo.db");
        let opts = SqliteConnectOptions::new().filename(&db).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(opts).await.unwrap();
        sqlx::query("CREATE TABLE arvo (localId INTEGER PRIMARY KEY, project TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for id in ids {
            sqlx::query("INSERT INTO arvo (localId, project) VALUES (?1, 'proj')")
                .bind(*id as i64)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;

        let repo = dir.join("ARVO-Meta");
        for sub in [".git", "meta", "patches"] {
            std::fs::create_dir_all(repo.join(sub)).unwrap();
        }

        MetadataStore::from_parts(
            MetadataDatabase::open(&db, None).await.unwrap(),
            MetadataRepository::open(&repo).unwrap(),
        )
    }

    async fn orchestrator(
        dir: &Path,
        ids: &[u64],
        runtime: Arc<FakeRuntime>,
        config: PipelineConfig,
    ) -> PipelineOrchestrator {
        let metadata = fixture(dir, ids).await;
        let config = config.with_output_root(dir.join("cases"));
        let assembler = CorpusAssembler::open(&config.output_root).await.unwrap();
        PipelineOrchestrator::from_parts(&config, metadata, assembler, runtime)
    }

    fn add_case(runtime: &FakeRuntime, id: u64) {
        let files: &[(&str, &[u8])] = &[("src/proj/main.c", b"int main;"), ("src/fuzz/f.c", b"f")];
        runtime.add_image(&format!("n132/arvo:{id}-vul"), files);
        runtime.add_image(&format!("n132/arvo:{id}-fix"), files);
    }

    #[tokio::test]
    async fn test_duplicates_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        add_case(&runtime, 1);
        let orch = orchestrator(dir.path(), &[1], runtime.clone(), PipelineConfig::new()).await;

        let (_tx, rx) = watch::channel(false);
        let summary = orch.run(&[1, 1, 1], rx).await.unwrap();
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.counts.complete, 1);
        assert_eq!(runtime.created(), 2);
        assert_eq!(runtime.removed(), 2);
    }

    #[tokio::test]
    async fn test_unknown_case_is_metadata_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        add_case(&runtime, 1);
        let orch = orchestrator(dir.path(), &[1], runtime.clone(), PipelineConfig::new()).await;

        let (_tx, rx) = watch::channel(false);
        let summary = orch.run(&[1, 999], rx).await.unwrap();
        let missing = summary.get(999).unwrap();
        assert_eq!(missing.status, OutcomeStatus::MetadataUnavailable);
        assert!(missing.entry.is_none());
        assert!(orch.assembler().index().get(999).await.unwrap().is_none());
        assert_eq!(summary.get(1).unwrap().status, OutcomeStatus::Complete);
        assert!(!summary.all_complete());
    }

    #[tokio::test]
    async fn test_abort_before_start_cancels_everything() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        add_case(&runtime, 1);
        add_case(&runtime, 2);
        let orch = orchestrator(dir.path(), &[1, 2], runtime.clone(), PipelineConfig::new()).await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let summary = orch.run(&[1, 2], rx).await.unwrap();
        assert_eq!(summary.counts.cancelled, 2);
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn test_empty_request_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            dir.path(),
            &[],
            Arc::new(FakeRuntime::new()),
            PipelineConfig::new(),
        )
        .await;
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(orch.run(&[], rx).await, Err(PipelineError::NoCases)));
    }

    #[tokio::test]
    async fn test_work_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        add_case(&runtime, 4);
        let orch = orchestrator(dir.path(), &[4, 5], runtime.clone(), PipelineConfig::new()).await;

        let (_tx, rx) = watch::channel(false);
        orch.run(&[4, 5], rx).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("cases/.work"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit_one_still_completes_all() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        for id in 1..=3 {
            add_case(&runtime, id);
        }
        let orch = orchestrator(
            dir.path(),
            &[1, 2, 3],
            runtime.clone(),
            PipelineConfig::new().with_concurrency(1),
        )
        .await;

        let (_tx, rx) = watch::channel(false);
        let summary = orch.run(&[3, 1, 2], rx).await.unwrap();
        assert!(summary.all_complete());
        assert_eq!(runtime.created(), 6);
        assert_eq!(runtime.live(), 0);
        assert!(runtime.peak() <= 2, "peak {}", runtime.peak());
    }

    #[tokio::test]
    async fn test_live_environments_bounded_by_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_copy_delay(Duration::from_millis(20)));
        let ids: Vec<u64> = (1..=6).collect();
        for id in &ids {
            add_case(&runtime, *id);
        }
        let orch = orchestrator(
            dir.path(),
            &ids,
            runtime.clone(),
            PipelineConfig::new().with_concurrency(2),
        )
        .await;

        let (_tx, rx) = watch::channel(false);
        let summary = orch.run(&ids, rx).await.unwrap();
        assert_eq!(summary.counts.complete, 6);
        // Two cases in flight, two environments each.
        assert!(runtime.peak() <= 4, "peak {}", runtime.peak());
        assert!(runtime.peak() >= 2);
        assert_eq!(runtime.created(), runtime.removed());
    }

    #[tokio::test]
    async fn test_abort_lets_in_flight_case_finish_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_copy_delay(Duration::from_millis(100)));
        for id in 1..=3 {
            add_case(&runtime, id);
        }
        let orch = orchestrator(
            dir.path(),
            &[1, 2, 3],
            runtime.clone(),
            PipelineConfig::new().with_concurrency(1),
        )
        .await;

        let (tx, rx) = watch::channel(false);
        let watched = runtime.clone();
        let aborter = tokio::spawn(async move {
            while watched.created() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tx.send(true).unwrap();
            tx
        });
        let summary = orch.run(&[1, 2, 3], rx).await.unwrap();
        let _tx = aborter.await.unwrap();

        assert_eq!(summary.get(1).unwrap().status, OutcomeStatus::Complete);
        assert_eq!(summary.get(2).unwrap().status, OutcomeStatus::Cancelled);
        assert_eq!(summary.get(3).unwrap().status, OutcomeStatus::Cancelled);
        assert_eq!(runtime.created(), 2);
        assert_eq!(runtime.removed(), 2);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_context_follows_opened_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = fixture(dir.path(), &[1]).await;
        let assembler = CorpusAssembler::open(&dir.path().join("opened")).await.unwrap();
        let config = PipelineConfig::new()
            .with_output_root(dir.path().join("configured"))
            .with_concurrency(3);

        let orch = PipelineOrchestrator::from_parts(
            &config,
            metadata,
            assembler,
            Arc::new(FakeRuntime::new()),
        );
        assert_eq!(orch.context().output_root, dir.path().join("opened"));
        assert_eq!(orch.context().concurrency, 3);
        assert_eq!(orch.context().environment_timeout, Duration::from_secs(900));
    }
}
