//! Postgres-backed job archive.
//!
//! Records are stored as JSONB keyed by job id in `bulk_scan_jobs`. The
//! archive trait is synchronous, so the store drives sqlx on a private
//! current-thread runtime and must not be called from inside an async task.

use bulkscan_core::{JobId, JobRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::runtime::Runtime;

use super::{ArchiveError, JobArchive};

pub struct PostgresJobArchive {
    pool: PgPool,
    runtime: Runtime,
}

impl std::fmt::Debug for PostgresJobArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobArchive").finish_non_exhaustive()
    }
}

impl PostgresJobArchive {
    /// Connect to `database_url` and make sure the archive table exists.
    pub fn connect(database_url: &str) -> Result<Self, ArchiveError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ArchiveError::Storage(format!("failed to start archive runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(4)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let archive = Self { pool, runtime };
        archive.ensure_schema()?;
        Ok(archive)
    }

    fn ensure_schema(&self) -> Result<(), ArchiveError> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS bulk_scan_jobs (
                        job_id UUID PRIMARY KEY,
                        status TEXT NOT NULL,
                        record JSONB NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

impl JobArchive for PostgresJobArchive {
    fn save(&self, record: &JobRecord) -> Result<(), ArchiveError> {
        let payload = serde_json::to_value(record)
            .map_err(|e| ArchiveError::Malformed(e.to_string()))?;

        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO bulk_scan_jobs (job_id, status, record, updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (job_id)
                    DO UPDATE SET
                        status = EXCLUDED.status,
                        record = EXCLUDED.record,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(*record.id.as_uuid())
                .bind(record.status.as_str())
                .bind(payload)
                .bind(record.updated_at)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    fn load(&self, id: JobId) -> Result<Option<JobRecord>, ArchiveError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT record FROM bulk_scan_jobs WHERE job_id = $1")
                    .bind(*id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("load", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: serde_json::Value = row
            .try_get("record")
            .map_err(|e| map_sqlx_error("load", e))?;
        serde_json::from_value(payload)
            .map(Some)
            .map_err(|e| ArchiveError::Malformed(e.to_string()))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ArchiveError {
    match err {
        sqlx::Error::Database(db_err) => {
            ArchiveError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            ArchiveError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            ArchiveError::Malformed(format!("{} in {}", err, operation))
        }
        _ => ArchiveError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
