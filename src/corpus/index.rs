//! SQLite-backed corpus index.
//!
//! One row per case in `corpus_entries`, upserted on every assembly, plus an
//! append-only `corpus_events` log of every attempt. Writers for the same case
//! are serialized through [`CorpusIndex::lock`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<std::sync::Mutex<HashMap<u64, Arc<Mutex<()>>>>>;

use crate::corpus::entry::{CorpusEntry, EntryStatus};
use crate::error::CorpusError;

/// File name of the index inside the output root.
pub const INDEX_FILE: &str = "index.db";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS corpus_entries (
    local_id    INTEGER PRIMARY KEY,
    status      TEXT    NOT NULL,
    reason      TEXT,
    case_dir    TEXT    NOT NULL,
    buggy_src   TEXT,
    fixed_src   TEXT,
    poc         TEXT,
    runner      TEXT,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS corpus_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    local_id    INTEGER NOT NULL,
    action      TEXT    NOT NULL,
    status      TEXT,
    reason      TEXT,
    at          TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_corpus_entries_status ON corpus_entries(status);
CREATE INDEX IF NOT EXISTS idx_corpus_events_case ON corpus_events(local_id);
"#;

/// Kind of event recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Assembled,
    Skipped,
    Failed,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Assembled => "assembled",
            EventAction::Skipped => "skipped",
            EventAction::Failed => "failed",
        }
    }
}

/// A row of `corpus_events`.
#[derive(Debug, Clone)]
pub struct CorpusEvent {
    pub case_id: u64,
    pub action: String,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub at: String,
}

#[derive(Clone)]
pub struct CorpusIndex {
    pool: SqlitePool,
    path: PathBuf,
    locks: LockMap,
}

impl CorpusIndex {
    /// Opens (creating if needed) `<output_root>/index.db`.
    pub async fn open(output_root: &Path) -> Result<Self, CorpusError> {
        tokio::fs::create_dir_all(output_root).await?;
        let path = output_root.join(INDEX_FILE);

        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::debug!(path = %path.display(), "Corpus index opened");
        Ok(Self {
            pool,
            path,
            locks: Arc::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the write lock for one case.
    pub async fn lock(&self, case_id: u64) -> CaseLock {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(case_id).or_default())
        };
        CaseLock {
            guard: Some(Arc::clone(&lock).lock_owned().await),
            lock,
            locks: Arc::clone(&self.locks),
            case_id,
        }
    }

    /// Number of cases with a lock currently held or awaited.
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn get(&self, case_id: u64) -> Result<Option<CorpusEntry>, CorpusError> {
        let row = sqlx::query("SELECT * FROM corpus_entries WHERE local_id = ?1")
            .bind(case_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    /// All entries ordered by case ID.
    pub async fn list(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
        let rows = sqlx::query("SELECT * FROM corpus_entries ORDER BY local_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Writes `entry` and logs the attempt in one transaction.
    pub async fn upsert(&self, entry: &CorpusEntry, action: EventAction) -> Result<(), CorpusError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO corpus_entries (
                local_id, status, reason, case_dir, buggy_src, fixed_src, poc, runner, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            ON CONFLICT(local_id) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                case_dir = excluded.case_dir,
                buggy_src = excluded.buggy_src,
                fixed_src = excluded.fixed_src,
                poc = excluded.poc,
                runner = excluded.runner,
                updated_at = excluded.updated_at",
        )
        .bind(entry.case_id as i64)
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(path_text(&entry.case_dir))
        .bind(entry.buggy_src.as_deref().map(path_text))
        .bind(entry.fixed_src.as_deref().map(path_text))
        .bind(entry.poc.as_deref().map(path_text))
        .bind(entry.runner.as_deref().map(path_text))
        .bind(entry.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        insert_event(
            &mut tx,
            entry.case_id,
            action,
            Some(entry.status),
            entry.reason.as_deref(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Logs an event without touching the entry.
    pub async fn record_event(
        &self,
        case_id: u64,
        action: EventAction,
        status: Option<EntryStatus>,
        reason: Option<&str>,
    ) -> Result<(), CorpusError> {
        let mut tx = self.pool.begin().await?;
        insert_event(&mut tx, case_id, action, status, reason).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn events(&self, case_id: u64) -> Result<Vec<CorpusEvent>, CorpusError> {
        let rows = sqlx::query(
            "SELECT local_id, action, status, reason, at FROM corpus_events WHERE local_id = ?1 ORDER BY id",
        )
        .bind(case_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CorpusEvent {
                case_id: row.get::<i64, _>("local_id") as u64,
                action: row.get("action"),
                status: row.get("status"),
                reason: row.get("reason"),
                at: row.get("at"),
            })
            .collect())
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    case_id: u64,
    action: EventAction,
    status: Option<EntryStatus>,
    reason: Option<&str>,
) -> Result<(), CorpusError> {
    sqlx::query(
        "INSERT INTO corpus_events (local_id, action, status, reason, at) VALUES (?1,?2,?3,?4,?5)",
    )
    .bind(case_id as i64)
    .bind(action.as_str())
    .bind(status.map(|s| s.as_str()))
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CorpusEntry, CorpusError> {
    let case_id = row.get::<i64, _>("local_id") as u64;
    let corrupt = |reason: String| CorpusError::CorruptIndex { case_id, reason };

    let status = row
        .get::<String, _>("status")
        .parse::<EntryStatus>()
        .map_err(corrupt)?;
    let updated_at = DateTime::parse_from_rfc3339(&row.get::<String, _>("updated_at"))
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);
    let path = |column: &str| row.get::<Option<String>, _>(column).map(PathBuf::from);

    Ok(CorpusEntry {
        case_id,
        status,
        reason: row.get("reason"),
        case_dir: PathBuf::from(row.get::<String, _>("case_dir")),
        buggy_src: path("buggy_src"),
        fixed_src: path("fixed_src"),
        poc: path("poc"),
        runner: path("runner"),
        updated_at,
    })
}

/// Held write lock for one case. The lock is forgotten once nobody holds or
/// awaits it.
pub struct CaseLock {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    locks: LockMap,
    case_id: u64,
}

impl Drop for CaseLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here: no waiters.
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.case_id)
                .is_some_and(|l| Arc::ptr_eq(l, &self.lock))
        {
            locks.remove(&self.case_id);
        }
    }
}
