//! Read-only access to the case-metadata SQLite database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, ValueRef};

use crate::error::MetadataError;

use super::record::DatabaseRowRef;

/// Table names tried, in order, when no case table is configured.
const PREFERRED_TABLES: &[&str] = &["arvo", "records", "cases", "vulns", "meta"];

/// Column names tried, in order, as the case key.
const KEY_COLUMNS: &[&str] = &["localId", "local_id", "id"];

/// Read-only handle on the metadata database.
#[derive(Clone)]
pub struct MetadataDatabase {
    pool: SqlitePool,
    path: PathBuf,
    case_table: DatabaseRowRef,
}

impl MetadataDatabase {
    /// Opens the database read-only and locates the case table.
    ///
    /// A missing file, a file that is not a SQLite database, or a database
    /// without a usable case table all yield `MetadataError`.
    pub async fn open(path: &Path, case_table: Option<&str>) -> Result<Self, MetadataError> {
        let unavailable = |reason: String| MetadataError::DatabaseUnavailable {
            path: path.display().to_string(),
            reason,
        };

        if !path.is_file() {
            return Err(unavailable("file not found".to_string()));
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let tables = list_tables(&pool)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let table = choose_case_table(&tables, case_table)?;
        let columns = table_columns(&pool, &table)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let key_column = choose_key_column(&columns).ok_or_else(|| {
            MetadataError::NoCaseTable(format!(
                "table '{}' has none of the key columns {:?}",
                table, KEY_COLUMNS
            ))
        })?;

        tracing::debug!(path = %path.display(), table = %table, key = %key_column, "Metadata database opened");

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            case_table: DatabaseRowRef { table, key_column },
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The table and key column used for case lookups.
    pub fn case_table(&self) -> &DatabaseRowRef {
        &self.case_table
    }

    /// Lists user tables.
    pub async fn tables(&self) -> Result<Vec<String>, MetadataError> {
        Ok(list_tables(&self.pool).await?)
    }

    /// Number of rows in the case table.
    pub async fn count_cases(&self) -> Result<i64, MetadataError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM \"{}\"",
            self.case_table.table
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Fetches the row for a case, if any.
    pub async fn lookup(
        &self,
        local_id: u64,
    ) -> Result<Option<(DatabaseRowRef, BTreeMap<String, serde_json::Value>)>, MetadataError> {
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?1 LIMIT 1",
            self.case_table.table, self.case_table.key_column
        );
        let row = sqlx::query(&sql)
            .bind(local_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| (self.case_table.clone(), row_to_map(&r))))
    }
}

async fn list_tables(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>, sqlx::Error> {
    let sql = format!("PRAGMA table_info(\"{}\")", table);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

/// Picks the case table: the configured one, else a preferred name, else the
/// first non-internal table.
fn choose_case_table(tables: &[String], configured: Option<&str>) -> Result<String, MetadataError> {
    if let Some(name) = configured {
        validate_identifier(name)?;
        return tables
            .iter()
            .find(|t| t.as_str() == name)
            .cloned()
            .ok_or_else(|| MetadataError::NoCaseTable(format!("configured table '{}' is absent", name)));
    }

    let user_tables: Vec<&String> = tables
        .iter()
        .filter(|t| !t.starts_with("sqlite_"))
        .collect();

    let chosen = PREFERRED_TABLES
        .iter()
        .find_map(|p| user_tables.iter().find(|t| t.eq_ignore_ascii_case(p)))
        .or_else(|| user_tables.first())
        .map(|t| t.to_string())
        .ok_or_else(|| MetadataError::NoCaseTable("database has no tables".to_string()))?;

    validate_identifier(&chosen)?;
    Ok(chosen)
}

fn choose_key_column(columns: &[String]) -> Option<String> {
    KEY_COLUMNS.iter().find_map(|k| {
        columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(k))
            .filter(|c| validate_identifier(c).is_ok())
            .cloned()
    })
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`; anything else is never interpolated into SQL.
pub(crate) fn validate_identifier(name: &str) -> Result<(), MetadataError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MetadataError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

fn row_to_map(row: &SqliteRow) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let is_null = row
            .try_get_raw(idx)
            .map(|raw| raw.is_null())
            .unwrap_or(true);

        let value = if is_null {
            serde_json::Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            serde_json::Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            serde_json::Value::from(v)
        } else if let Ok(v) = row.try_get::<String, _>(idx) {
            serde_json::Value::from(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
            serde_json::Value::from(hex::encode(v))
        } else {
            serde_json::Value::Null
        };

        map.insert(column.name().to_string(), value);
    }
    map
}
