//! Read-only metadata store over the case database and the metadata repository.
//!
//! # Overview
//!
//! - **MetadataDatabase**: SQLite database with a `localId`-keyed case table
//! - **MetadataRepository**: git checkout with `meta/` documents and `patches/`
//! - **MetadataStore**: resolves a case ID against both and produces a [`CaseRecord`]
//!
//! Neither store is ever written; downloading and updating them is left to
//! whoever provisions the data directory.

pub mod database;
pub mod memory;
pub mod record;
pub mod repository;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::error::MetadataError;
use crate::pipeline::PipelineConfig;

pub use database::MetadataDatabase;
pub use memory::{is_memory_crash, select_memory_cases, MemoryCase};
pub use record::{CaseMeta, CaseRecord, DatabaseRowRef};
pub use repository::MetadataRepository;

/// Result of [`MetadataStore::sanity_check`].
#[derive(Debug, Clone, Serialize)]
pub struct SanityReport {
    pub tables: Vec<String>,
    pub case_table: DatabaseRowRef,
    pub case_rows: i64,
    pub meta_documents: usize,
    pub patches: usize,
    pub repo_commit: Option<String>,
}

/// Read-only accessor over both metadata stores.
#[derive(Clone)]
pub struct MetadataStore {
    database: MetadataDatabase,
    repository: MetadataRepository,
    repo_commit: Arc<OnceCell<Option<String>>>,
}

impl MetadataStore {
    /// Opens both stores. Failure here is fatal for a run.
    pub async fn open(config: &PipelineConfig) -> Result<Self, MetadataError> {
        let database =
            MetadataDatabase::open(&config.metadata_db, config.case_table.as_deref()).await?;
        let repository = MetadataRepository::open(&config.metadata_repo)?;
        Ok(Self::from_parts(database, repository))
    }

    pub fn from_parts(database: MetadataDatabase, repository: MetadataRepository) -> Self {
        Self {
            database,
            repository,
            repo_commit: Arc::new(OnceCell::new()),
        }
    }

    pub fn database(&self) -> &MetadataDatabase {
        &self.database
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repository
    }

    /// Repository HEAD, read once per store.
    async fn repo_commit(&self) -> Option<String> {
        self.repo_commit
            .get_or_init(|| self.repository.head_commit())
            .await
            .clone()
    }

    /// Lists the tables and repository directories the pipeline depends on.
    ///
    /// Run once at startup; an error aborts the whole run.
    pub async fn sanity_check(&self) -> Result<SanityReport, MetadataError> {
        let tables = self.database.tables().await?;
        let case_rows = self.database.count_cases().await?;
        let (meta_documents, patches) = self.repository.entry_counts().await?;
        let repo_commit = self.repo_commit().await;

        tracing::info!(
            tables = tables.len(),
            case_rows = case_rows,
            meta_documents = meta_documents,
            patches = patches,
            "Metadata stores look sane"
        );

        Ok(SanityReport {
            tables,
            case_table: self.database.case_table().clone(),
            case_rows,
            meta_documents,
            patches,
            repo_commit,
        })
    }

    /// Resolves a case ID to its record.
    ///
    /// Fails with `CaseNotFound` only when neither store knows the case.
    pub async fn resolve(&self, local_id: u64) -> Result<CaseRecord, MetadataError> {
        let db_row = self.database.lookup(local_id).await?;
        let meta = self.repository.read_meta(local_id).await?;

        if db_row.is_none() && meta.is_none() {
            return Err(MetadataError::CaseNotFound(local_id));
        }

        let patch_path = self.repository.patch_path(local_id).await;
        let repo_commit = self.repo_commit().await;

        Ok(CaseRecord::from_sources(
            local_id,
            db_row,
            meta,
            patch_path,
            repo_commit,
        ))
    }
}
