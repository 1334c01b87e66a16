//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation on insert) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use jobforge_core::{Job, JobPriority, JobState, JobUid, clamp_progress};

use super::store::{JobStore, JobStoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_uid                  TEXT PRIMARY KEY,
        job_created              TIMESTAMPTZ NOT NULL,
        job_updated              TIMESTAMPTZ NOT NULL,
        job_type                 TEXT NOT NULL,
        job_priority             SMALLINT NOT NULL,
        job_data                 TEXT NOT NULL,
        job_result               TEXT NOT NULL,
        job_max_duration_seconds BIGINT NOT NULL,
        job_max_retries          INTEGER NOT NULL,
        job_state                TEXT NOT NULL,
        job_scheduled            TIMESTAMPTZ NOT NULL,
        job_total_executions     INTEGER NOT NULL,
        job_run_by               TEXT NOT NULL,
        job_run_deadline         TIMESTAMPTZ,
        job_run_progress         SMALLINT NOT NULL,
        job_last_executed        TIMESTAMPTZ,
        job_is_recurring         BOOLEAN NOT NULL,
        job_recurring_cron       TEXT NOT NULL,
        job_consecutive_failures INTEGER NOT NULL,
        job_last_failure_error   TEXT NOT NULL,
        job_group_id             TEXT NOT NULL DEFAULT ''
    )
    "#,
    "ALTER TABLE jobs ADD COLUMN IF NOT EXISTS job_group_id TEXT NOT NULL DEFAULT ''",
    "CREATE INDEX IF NOT EXISTS jobs_state_scheduled ON jobs (job_state, job_scheduled)",
    "CREATE INDEX IF NOT EXISTS jobs_state_run_deadline ON jobs (job_state, job_run_deadline)",
    "CREATE INDEX IF NOT EXISTS jobs_last_executed ON jobs (job_last_executed)",
    "CREATE INDEX IF NOT EXISTS jobs_group_id ON jobs (job_group_id)",
];

const COLUMNS: &str = r#"
    job_uid, job_created, job_updated, job_type, job_priority, job_data, job_result,
    job_max_duration_seconds, job_max_retries, job_state, job_scheduled,
    job_total_executions, job_run_by, job_run_deadline, job_run_progress,
    job_last_executed, job_is_recurring, job_recurring_cron,
    job_consecutive_failures, job_last_failure_error, job_group_id
"#;

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync`; all operations go through the SQLx
/// connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(job_uid = %uid), err)]
    async fn find(&self, uid: &JobUid) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE job_uid = $1"))
            .bind(uid.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?
            .ok_or_else(|| JobStoreError::NotFound(uid.clone()))?;

        job_from_row(&row)
    }

    #[instrument(skip(self, job), fields(job_uid = %job.uid), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        bind_job(
            sqlx::query(&format!(
                r#"
                INSERT INTO jobs ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                "#
            )),
            job,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.uid.clone())
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, job), fields(job_uid = %job.uid), err)]
    async fn upsert(&self, job: &Job) -> Result<(), JobStoreError> {
        bind_job(
            sqlx::query(&format!(
                r#"
                INSERT INTO jobs ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
                ON CONFLICT (job_uid) DO UPDATE SET
                    job_updated = EXCLUDED.job_updated,
                    job_group_id = EXCLUDED.job_group_id,
                    job_type = EXCLUDED.job_type,
                    job_priority = EXCLUDED.job_priority,
                    job_data = EXCLUDED.job_data,
                    job_result = EXCLUDED.job_result,
                    job_max_duration_seconds = EXCLUDED.job_max_duration_seconds,
                    job_max_retries = EXCLUDED.job_max_retries,
                    job_state = EXCLUDED.job_state,
                    job_scheduled = EXCLUDED.job_scheduled,
                    job_is_recurring = EXCLUDED.job_is_recurring,
                    job_recurring_cron = EXCLUDED.job_recurring_cron
                WHERE
                    jobs.job_type <> EXCLUDED.job_type OR
                    jobs.job_group_id <> EXCLUDED.job_group_id OR
                    jobs.job_priority <> EXCLUDED.job_priority OR
                    jobs.job_data <> EXCLUDED.job_data OR
                    jobs.job_max_duration_seconds <> EXCLUDED.job_max_duration_seconds OR
                    jobs.job_max_retries <> EXCLUDED.job_max_retries OR
                    jobs.job_is_recurring <> EXCLUDED.job_is_recurring OR
                    jobs.job_recurring_cron <> EXCLUDED.job_recurring_cron
                "#
            )),
            job,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(())
    }

    #[instrument(skip(self, job), fields(job_uid = %job.uid, state = %job.state), err)]
    async fn update_execution(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                job_updated = $2,
                job_result = $3,
                job_state = $4,
                job_scheduled = $5,
                job_total_executions = $6,
                job_run_by = $7,
                job_run_deadline = $8,
                job_run_progress = $9,
                job_last_executed = $10,
                job_consecutive_failures = $11,
                job_last_failure_error = $12,
                job_max_duration_seconds = $13
            WHERE job_uid = $1
            "#,
        )
        .bind(job.uid.as_str())
        .bind(job.updated_at)
        .bind(&job.result)
        .bind(job.state.as_str())
        .bind(job.scheduled_at)
        .bind(job.total_executions)
        .bind(&job.run_by)
        .bind(job.run_deadline)
        .bind(i16::from(job.run_progress))
        .bind(job.last_executed)
        .bind(job.consecutive_failures)
        .bind(&job.last_failure_error)
        .bind(job.max_duration_seconds)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.uid.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(job_uid = %uid), err)]
    async fn update_progress(
        &self,
        uid: &JobUid,
        progress: u8,
        result: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                job_updated = $2,
                job_run_progress = $3,
                job_result = $4
            WHERE job_uid = $1 AND job_state = 'running'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(uid.as_str())
        .bind(now)
        .bind(i16::from(progress))
        .bind(result)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?
        .ok_or_else(|| JobStoreError::NotFound(uid.clone()))?;

        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn count_running(&self) -> Result<usize, JobStoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) FROM jobs WHERE job_state = 'running'")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_running", e))?
            .try_get(0)
            .map_err(|e| map_sqlx_error("count_running", e))?;

        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), err)]
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE job_state = 'scheduled' AND job_scheduled <= $1
            ORDER BY job_priority DESC, job_scheduled ASC, job_uid ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_ready", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE job_state = 'running' AND job_run_deadline < $1
            ORDER BY job_run_deadline ASC
            "#
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_deadline_exceeded", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        sqlx::query(
            r#"
            SELECT MIN(job_scheduled) FROM jobs
            WHERE job_state = 'scheduled' AND job_scheduled > $1
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("next_scheduled_time", e))?
        .try_get::<Option<DateTime<Utc>>, _>(0)
        .map_err(|e| map_sqlx_error("next_scheduled_time", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE job_state IN ('finished', 'failed')
              AND NOT job_is_recurring
              AND job_last_executed < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_old", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_uid = %uid), err)]
    async fn delete_by_uid(&self, uid: &JobUid) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_uid = $1")
            .bind(uid.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_by_uid", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(uid.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE job_group_id = $1
            ORDER BY job_created ASC, job_uid ASC
            "#
        ))
        .bind(group_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_group_id", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_group_id = $1")
            .bind(group_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_by_group_id", e))?;

        Ok(result.rows_affected())
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_job<'q>(query: PgQuery<'q>, job: &'q Job) -> PgQuery<'q> {
    query
        .bind(job.uid.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.job_type)
        .bind(job.priority.as_i16())
        .bind(&job.data)
        .bind(&job.result)
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(job.state.as_str())
        .bind(job.scheduled_at)
        .bind(job.total_executions)
        .bind(&job.run_by)
        .bind(job.run_deadline)
        .bind(i16::from(job.run_progress))
        .bind(job.last_executed)
        .bind(job.is_recurring)
        .bind(&job.recurring_cron)
        .bind(job.consecutive_failures)
        .bind(&job.last_failure_error)
        .bind(&job.group_id)
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let state: String = row.try_get("job_state").map_err(decode)?;
    let state = state
        .parse::<JobState>()
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;
    let priority: i16 = row.try_get("job_priority").map_err(decode)?;
    let progress: i16 = row.try_get("job_run_progress").map_err(decode)?;
    let uid: String = row.try_get("job_uid").map_err(decode)?;

    Ok(Job {
        uid: JobUid::from(uid),
        group_id: row.try_get("job_group_id").map_err(decode)?,
        created_at: row.try_get("job_created").map_err(decode)?,
        updated_at: row.try_get("job_updated").map_err(decode)?,
        job_type: row.try_get("job_type").map_err(decode)?,
        priority: JobPriority::from_i16(priority),
        data: row.try_get("job_data").map_err(decode)?,
        result: row.try_get("job_result").map_err(decode)?,
        max_duration_seconds: row.try_get("job_max_duration_seconds").map_err(decode)?,
        max_retries: row.try_get("job_max_retries").map_err(decode)?,
        state,
        scheduled_at: row.try_get("job_scheduled").map_err(decode)?,
        total_executions: row.try_get("job_total_executions").map_err(decode)?,
        run_by: row.try_get("job_run_by").map_err(decode)?,
        run_deadline: row.try_get("job_run_deadline").map_err(decode)?,
        run_progress: clamp_progress(i64::from(progress)),
        last_executed: row.try_get("job_last_executed").map_err(decode)?,
        is_recurring: row.try_get("job_is_recurring").map_err(decode)?,
        recurring_cron: row.try_get("job_recurring_cron").map_err(decode)?,
        consecutive_failures: row.try_get("job_consecutive_failures").map_err(decode)?,
        last_failure_error: row.try_get("job_last_failure_error").map_err(decode)?,
    })
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => JobStoreError::Storage(format!(
            "unexpected row not found in {}",
            operation
        )),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
