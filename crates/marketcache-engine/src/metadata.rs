//! Metadata store
//!
//! Uses SQLite for one record per fingerprint plus an append-only log of
//! fetch trials. Records are replaced whole on update, never patched.

use crate::error::{EngineError, Result};
use crate::fingerprint::{Clock, Fingerprint};
use crate::layout::StorageLayout;
use chrono::{DateTime, SecondsFormat, Utc};
use marketcache_common::Params;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Maximum pooled connections to the metadata database.
const MAX_CONNECTIONS: u32 = 4;

/// How long a writer waits on SQLite's own lock before failing.
const BUSY_TIMEOUT_SECS: u64 = 30;

/// Download and processing state of one logical artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub fingerprint: Fingerprint,
    pub artifact_type: String,
    pub timestamp: DateTime<Utc>,
    /// Effective parameters of the request
    pub params: Params,
    /// Transport response descriptor, opaque to the engine
    pub response: serde_json::Value,
    pub content_checksum: Option<String>,
    /// Root-relative raw files, in their retained (compressed) form
    pub raw_files: Vec<String>,
    /// Output name -> root-relative dataset file
    pub outputs: BTreeMap<String, String>,
    pub volatility_key: String,
    pub processing_error: Option<String>,
}

impl ArtifactMetadata {
    pub fn new(
        fingerprint: Fingerprint,
        artifact_type: impl Into<String>,
        params: Params,
        volatility_key: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint,
            artifact_type: artifact_type.into(),
            timestamp,
            params,
            response: serde_json::Value::Null,
            content_checksum: None,
            raw_files: Vec::new(),
            outputs: BTreeMap::new(),
            volatility_key: volatility_key.into(),
            processing_error: None,
        }
    }

    pub fn is_materialized(&self) -> bool {
        !self.outputs.is_empty()
    }
}

/// One fetch attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTrial {
    pub fingerprint: Fingerprint,
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

#[derive(sqlx::FromRow)]
struct MetadataRow {
    fingerprint: String,
    content_checksum: Option<String>,
    timestamp: String,
    response: String,
    params: String,
    artifact_type: String,
    raw_files: String,
    outputs: String,
    volatility_key: String,
    processing_error: Option<String>,
}

impl TryFrom<MetadataRow> for ArtifactMetadata {
    type Error = EngineError;

    fn try_from(row: MetadataRow) -> Result<Self> {
        Ok(Self {
            fingerprint: Fingerprint::from(row.fingerprint),
            artifact_type: row.artifact_type,
            timestamp: parse_timestamp(&row.timestamp)?,
            params: serde_json::from_str(&row.params)?,
            response: serde_json::from_str(&row.response)?,
            content_checksum: row.content_checksum,
            raw_files: serde_json::from_str(&row.raw_files)?,
            outputs: serde_json::from_str(&row.outputs)?,
            volatility_key: row.volatility_key,
            processing_error: row.processing_error.filter(|e| !e.is_empty()),
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Decode(format!("invalid timestamp '{}': {}", value, e)))
}

const SELECT_METADATA: &str = r#"
    SELECT fingerprint, content_checksum, timestamp, response, params, artifact_type,
           raw_files, outputs, volatility_key, processing_error
    FROM cache_metadata
"#;

/// Metadata store with SQLite backend
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    layout: StorageLayout,
    clock: Arc<dyn Clock>,
}

impl MetadataStore {
    /// Open (creating if needed) the store under `<root>/meta/`
    pub async fn open(layout: StorageLayout, clock: Arc<dyn Clock>) -> Result<Self> {
        layout.ensure()?;

        let options = SqliteConnectOptions::new()
            .filename(layout.meta_db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            layout,
            clock,
        })
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM cache_metadata WHERE fingerprint = ?1")
            .bind(fingerprint.as_str())
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<ArtifactMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(&format!(
            "{} WHERE fingerprint = ?1",
            SELECT_METADATA
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ArtifactMetadata::try_from).transpose()
    }

    /// Insert or replace the record for `meta.fingerprint`
    #[instrument(skip(self, meta), fields(fingerprint = %meta.fingerprint))]
    pub async fn save(&self, meta: &ArtifactMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_metadata (fingerprint, content_checksum, timestamp, response, params,
                                        artifact_type, raw_files, outputs, volatility_key, processing_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(fingerprint) DO UPDATE SET
                content_checksum = excluded.content_checksum,
                timestamp = excluded.timestamp,
                response = excluded.response,
                params = excluded.params,
                artifact_type = excluded.artifact_type,
                raw_files = excluded.raw_files,
                outputs = excluded.outputs,
                volatility_key = excluded.volatility_key,
                processing_error = excluded.processing_error
            "#,
        )
        .bind(meta.fingerprint.as_str())
        .bind(meta.content_checksum.as_deref())
        .bind(format_timestamp(&meta.timestamp))
        .bind(serde_json::to_string(&meta.response)?)
        .bind(serde_json::to_string(&meta.params)?)
        .bind(&meta.artifact_type)
        .bind(serde_json::to_string(&meta.raw_files)?)
        .bind(serde_json::to_string(&meta.outputs)?)
        .bind(&meta.volatility_key)
        .bind(meta.processing_error.as_deref())
        .execute(&self.pool)
        .await?;

        debug!("Saved metadata");
        Ok(())
    }

    /// Purge a record with its raw folder and dataset files.
    ///
    /// Raw folders and dataset files still referenced by another record are
    /// kept. Files that are already gone are not an error. The trial log is
    /// append-only and survives the purge.
    #[instrument(skip(self, meta), fields(fingerprint = %meta.fingerprint))]
    pub async fn delete(&self, meta: &ArtifactMetadata) -> Result<()> {
        if let Some(checksum) = meta.content_checksum.as_deref() {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS count FROM cache_metadata
                WHERE artifact_type = ?1 AND content_checksum = ?2 AND fingerprint <> ?3
                "#,
            )
            .bind(&meta.artifact_type)
            .bind(checksum)
            .bind(meta.fingerprint.as_str())
            .fetch_one(&self.pool)
            .await?;
            let shared: i64 = row.get("count");

            if shared == 0 {
                let folder = self.layout.raw_folder(&meta.artifact_type, checksum);
                remove_if_present(&self.layout.resolve(&folder), true)?;
            } else {
                debug!(shared, "Raw folder shared with other records, keeping it");
            }
        }

        let referenced = self.referenced_outputs(meta).await?;
        for output in meta.outputs.values() {
            if referenced.contains(output) {
                continue;
            }
            remove_if_present(&self.layout.resolve(output), false)?;
        }

        sqlx::query("DELETE FROM cache_metadata WHERE fingerprint = ?1")
            .bind(meta.fingerprint.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Dataset files referenced by other records of the same artifact type
    async fn referenced_outputs(&self, meta: &ArtifactMetadata) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT outputs FROM cache_metadata WHERE artifact_type = ?1 AND fingerprint <> ?2",
        )
        .bind(&meta.artifact_type)
        .bind(meta.fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut referenced = HashSet::new();
        for row in rows {
            let outputs: String = row.get("outputs");
            let outputs: BTreeMap<String, String> = serde_json::from_str(&outputs)?;
            referenced.extend(outputs.into_values());
        }
        Ok(referenced)
    }

    pub async fn record_trial(&self, fingerprint: &Fingerprint, succeeded: bool) -> Result<()> {
        sqlx::query("INSERT INTO fetch_trials (fingerprint, timestamp, succeeded) VALUES (?1, ?2, ?3)")
            .bind(fingerprint.as_str())
            .bind(format_timestamp(&self.clock.now()))
            .bind(succeeded)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_successful_trial(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM fetch_trials WHERE fingerprint = ?1 AND succeeded = 1",
        )
        .bind(fingerprint.as_str())
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Trials for a fingerprint, oldest first
    pub async fn trials(&self, fingerprint: &Fingerprint) -> Result<Vec<DownloadTrial>> {
        let rows = sqlx::query(
            "SELECT timestamp, succeeded FROM fetch_trials WHERE fingerprint = ?1 ORDER BY id",
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let timestamp: String = row.get("timestamp");
                Ok(DownloadTrial {
                    fingerprint: fingerprint.clone(),
                    timestamp: parse_timestamp(&timestamp)?,
                    succeeded: row.get("succeeded"),
                })
            })
            .collect()
    }

    pub async fn list_by_artifact_type(&self, artifact_type: &str) -> Result<Vec<Fingerprint>> {
        let rows = sqlx::query(
            "SELECT fingerprint FROM cache_metadata WHERE artifact_type = ?1 ORDER BY timestamp",
        )
        .bind(artifact_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Fingerprint::from(row.get::<String, _>("fingerprint")))
            .collect())
    }

    /// Fetched records that have no dataset outputs yet
    pub async fn list_unmaterialized(&self, artifact_type: &str) -> Result<Vec<ArtifactMetadata>> {
        let rows = sqlx::query_as::<_, MetadataRow>(&format!(
            "{} WHERE artifact_type = ?1 AND outputs = '{{}}' ORDER BY timestamp",
            SELECT_METADATA
        ))
        .bind(artifact_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ArtifactMetadata::try_from).collect()
    }
}

fn remove_if_present(path: &std::path::Path, dir: bool) -> Result<()> {
    let removed = if dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Already removed");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}
