//! libSQL record store for enriched companies, job logs, and dead letters.
//!
//! The [`Storage`] struct wraps an embedded libSQL database. The store is
//! single-writer-safe only under the discipline that all mutations go through
//! one logical writer path: workers funnel writes through the orchestrator's
//! storage handle, and read-only handles are used for inspection.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};

use ditta_shared::{
    AttemptRecord, CompanyRecord, DittaError, EnrichmentResult, ReasonCode, RecordId,
    ResolutionJob, Result,
};

/// A dead-lettered job as read back from the store.
#[derive(Debug, Clone)]
pub struct DeadLetterRow {
    pub job_id: String,
    pub correlation_id: String,
    pub record: CompanyRecord,
    pub reason_code: String,
    pub history: Vec<AttemptRecord>,
    pub dead_at: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DittaError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for inspection commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DittaError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DittaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Company operations
    // -----------------------------------------------------------------------

    /// Upsert a company with its latest enrichment result.
    pub async fn upsert_company(
        &self,
        record: &CompanyRecord,
        result: &EnrichmentResult,
    ) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| DittaError::Storage(format!("serialize record: {e}")))?;
        let result_json = serde_json::to_string(result)
            .map_err(|e| DittaError::Storage(format!("serialize result: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO companies (id, correlation_id, name, city, record_json, result_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   correlation_id = excluded.correlation_id,
                   result_json = excluded.result_json,
                   updated_at = excluded.updated_at",
                params![
                    result.record_id.as_str(),
                    result.correlation_id.to_string(),
                    record.name.as_str(),
                    record.city.as_str(),
                    record_json.as_str(),
                    result_json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a company and its enrichment result by record id.
    pub async fn get_company(
        &self,
        id: &RecordId,
    ) -> Result<Option<(CompanyRecord, EnrichmentResult)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, result_json FROM companies WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record_json: String = row
                    .get(0)
                    .map_err(|e| DittaError::Storage(e.to_string()))?;
                let result_json: String = row
                    .get(1)
                    .map_err(|e| DittaError::Storage(e.to_string()))?;
                let record: CompanyRecord = serde_json::from_str(&record_json)
                    .map_err(|e| DittaError::Storage(format!("corrupt record_json: {e}")))?;
                let result: EnrichmentResult = serde_json::from_str(&result_json)
                    .map_err(|e| DittaError::Storage(format!("corrupt result_json: {e}")))?;
                Ok(Some((record, result)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DittaError::Storage(e.to_string())),
        }
    }

    /// Count companies stored for a correlation id.
    pub async fn count_companies(&self, correlation_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM companies WHERE correlation_id = ?1",
                params![correlation_id],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|count| count.max(0) as u64)
                .map_err(|e| DittaError::Storage(e.to_string())),
            _ => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Job log operations
    // -----------------------------------------------------------------------

    /// Append one job status row to the audit trail.
    pub async fn append_job_log(
        &self,
        job_id: &RecordId,
        correlation_id: &str,
        status: &str,
        duration_ms: u64,
        reason_code: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO job_log (job_id, correlation_id, status, duration_ms, reason_code, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id.as_str(),
                    correlation_id,
                    status,
                    duration_ms as i64,
                    reason_code,
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All log rows for a job, oldest first. Returns `(status, duration_ms, reason_code)`.
    pub async fn job_log(
        &self,
        job_id: &RecordId,
    ) -> Result<Vec<(String, u64, Option<String>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, duration_ms, reason_code FROM job_log
                 WHERE job_id = ?1 ORDER BY id",
                params![job_id.as_str()],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| DittaError::Storage(e.to_string()))?;
            let duration: i64 = row
                .get(1)
                .map_err(|e| DittaError::Storage(e.to_string()))?;
            let reason: Option<String> = row.get(2).ok();
            results.push((status, duration as u64, reason));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Dead-letter operations
    // -----------------------------------------------------------------------

    /// Persist a dead-lettered job with its full attempt history.
    pub async fn insert_dead_letter(
        &self,
        job: &ResolutionJob,
        reason: ReasonCode,
    ) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(&job.record)
            .map_err(|e| DittaError::Storage(format!("serialize record: {e}")))?;
        let history_json = serde_json::to_string(&job.history)
            .map_err(|e| DittaError::Storage(format!("serialize history: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO dead_letters (job_id, correlation_id, record_json, reason_code, history_json, dead_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id) DO UPDATE SET
                   reason_code = excluded.reason_code,
                   history_json = excluded.history_json,
                   dead_at = excluded.dead_at",
                params![
                    job.id.as_str(),
                    job.correlation_id.to_string(),
                    record_json.as_str(),
                    reason.as_str(),
                    history_json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List all dead letters, newest first.
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, correlation_id, record_json, reason_code, history_json, dead_at
                 FROM dead_letters ORDER BY dead_at DESC",
                params![],
            )
            .await
            .map_err(|e| DittaError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let record_json: String = row
                .get(2)
                .map_err(|e| DittaError::Storage(e.to_string()))?;
            let history_json: String = row
                .get(4)
                .map_err(|e| DittaError::Storage(e.to_string()))?;
            results.push(DeadLetterRow {
                job_id: row
                    .get(0)
                    .map_err(|e| DittaError::Storage(e.to_string()))?,
                correlation_id: row
                    .get(1)
                    .map_err(|e| DittaError::Storage(e.to_string()))?,
                record: serde_json::from_str(&record_json)
                    .map_err(|e| DittaError::Storage(format!("corrupt record_json: {e}")))?,
                reason_code: row
                    .get(3)
                    .map_err(|e| DittaError::Storage(e.to_string()))?,
                history: serde_json::from_str(&history_json)
                    .map_err(|e| DittaError::Storage(format!("corrupt history_json: {e}")))?,
                dead_at: row
                    .get(5)
                    .map_err(|e| DittaError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }
}
