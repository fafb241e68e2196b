//! Postgres-backed execution store.
//!
//! Records map one-to-one onto the tables of `migrations/0001_batch_schema.sql`;
//! execution contexts live in `batch_execution_context` keyed by
//! `(owner_kind, owner_id, key)` and are rewritten wholesale on every update.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `DuplicateInstance` (instance insert only) |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! ## Sync bridge
//!
//! [`ExecutionStore`] is synchronous. The store captures the tokio runtime
//! handle it was created on and blocks on it; callers must be on a plain
//! thread, a `spawn_blocking` thread or a multi-threaded runtime worker.
//! Calls from a current-thread runtime fail with `Storage`.
//!
//! Reads that assemble an execution from several tables run in one
//! REPEATABLE READ transaction, so the row, its context and its steps come
//! from the same snapshot.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::instrument;

use batchforge_core::{
    BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobParameters, StepExecution, StepExecutionId,
};

use super::{ExecutionStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_batch_schema.sql");

const OWNER_JOB: &str = "JOB";
const OWNER_STEP: &str = "STEP";

const JOB_EXECUTION_COLUMNS: &str = r#"
    id, instance_id, job_name, parameters, status, exit_code, exit_description,
    create_time, start_time, end_time, last_updated
"#;

const STEP_EXECUTION_COLUMNS: &str = r#"
    id, job_execution_id, step_name, status, exit_code, exit_description,
    read_count, write_count, commit_count, rollback_count, filter_count,
    read_skip_count, process_skip_count, write_skip_count,
    start_time, end_time, last_updated
"#;

/// Postgres execution store.
///
/// Instance uniqueness is enforced by the `(job_name, identity_key)` unique
/// constraint, which makes the launch race atomic across connections.
#[derive(Debug, Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresExecutionStore {
    /// Must be called from inside a tokio runtime; that runtime services
    /// every synchronous store call afterwards.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Storage("PostgresExecutionStore requires a tokio runtime".to_string())
        })?;
        Ok(Self { pool, runtime })
    }

    pub fn with_handle(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Drive `fut` to completion from synchronous code.
    ///
    /// A current-thread runtime cannot be blocked from one of its own
    /// threads, so calls made there fail instead of panicking.
    fn block_on<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.runtime.block_on(fut))
            }
            Ok(_) => Err(StoreError::Storage(
                "PostgresExecutionStore called from a current-thread runtime; use a multi-threaded runtime or spawn_blocking".to_string(),
            )),
            Err(_) => self.runtime.block_on(fut),
        }
    }

    /// A read-only transaction that sees one consistent snapshot across
    /// every statement it runs.
    async fn snapshot(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        Ok(tx)
    }

    #[instrument(skip(self, params), fields(job = %job_name), err)]
    pub async fn insert_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError> {
        let identity_key = params.identity_key();
        let row = sqlx::query(
            r#"
            INSERT INTO batch_job_instance (job_name, identity_key)
            VALUES ($1, $2)
            RETURNING id, created_at
            "#,
        )
        .bind(job_name)
        .bind(&identity_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateInstance {
                    job_name: job_name.to_string(),
                    identity: identity_key.clone(),
                }
            } else {
                map_sqlx_error("insert_job_instance", e)
            }
        })?;

        Ok(JobInstance {
            id: JobInstanceId::new(to_u64(row.try_get::<i64, _>("id").map_err(row_error)?)),
            job_name: job_name.to_string(),
            identity_key,
            created_at: row.try_get("created_at").map_err(row_error)?,
        })
    }

    pub async fn select_job_instance(
        &self,
        job_name: &str,
        identity_key: &str,
    ) -> Result<Option<JobInstance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_name, identity_key, created_at
            FROM batch_job_instance
            WHERE job_name = $1 AND identity_key = $2
            "#,
        )
        .bind(job_name)
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_job_instance", e))?;

        row.map(|r| instance_from_row(&r)).transpose()
    }

    pub async fn select_job_instance_by_id(
        &self,
        id: JobInstanceId,
    ) -> Result<Option<JobInstance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_name, identity_key, created_at
            FROM batch_job_instance
            WHERE id = $1
            "#,
        )
        .bind(to_i64(id.get()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_job_instance_by_id", e))?;

        row.map(|r| instance_from_row(&r)).transpose()
    }

    #[instrument(skip(self, instance, params), fields(instance_id = %instance.id), err)]
    pub async fn insert_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError> {
        let mut execution = JobExecution::new(JobExecutionId::new(0), instance, params);
        let parameters = serde_json::to_value(&execution.parameters)
            .map_err(|e| StoreError::Serialization(format!("job parameters: {e}")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO batch_job_execution (
                instance_id, job_name, parameters, status, exit_code, exit_description,
                create_time, start_time, end_time, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(to_i64(instance.id.get()))
        .bind(&execution.job_name)
        .bind(&parameters)
        .bind(execution.status.as_str())
        .bind(&execution.exit_status.exit_code)
        .bind(&execution.exit_status.exit_description)
        .bind(execution.create_time)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.last_updated)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job_execution", e))?;

        execution.id = JobExecutionId::new(to_u64(row.try_get::<i64, _>("id").map_err(row_error)?));
        Ok(execution)
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status), err)]
    pub async fn save_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        self.write_job_execution(execution, None).await.map(|_| ())
    }

    /// Save only while the stored status is one of `expected`; the row is
    /// locked between the check and the write.
    pub async fn save_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError> {
        self.write_job_execution(execution, Some(expected)).await
    }

    async fn write_job_execution(
        &self,
        execution: &JobExecution,
        expected: Option<&[BatchStatus]>,
    ) -> Result<bool, StoreError> {
        let parameters = serde_json::to_value(&execution.parameters)
            .map_err(|e| StoreError::Serialization(format!("job parameters: {e}")))?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM batch_job_execution WHERE id = $1 FOR UPDATE")
                .bind(to_i64(execution.id.get()))
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_job_execution", e))?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(format!("job execution {}", execution.id)));
        };
        if let Some(expected) = expected {
            if !expected.iter().any(|status| status.as_str() == current) {
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            UPDATE batch_job_execution SET
                parameters = $2,
                status = $3,
                exit_code = $4,
                exit_description = $5,
                start_time = $6,
                end_time = $7,
                last_updated = $8
            WHERE id = $1
            "#,
        )
        .bind(to_i64(execution.id.get()))
        .bind(&parameters)
        .bind(execution.status.as_str())
        .bind(&execution.exit_status.exit_code)
        .bind(&execution.exit_status.exit_description)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.last_updated)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_job_execution", e))?;

        replace_context(&mut tx, OWNER_JOB, execution.id.get(), &execution.execution_context).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    pub async fn select_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let sql = format!("SELECT {JOB_EXECUTION_COLUMNS} FROM batch_job_execution WHERE id = $1");
        let mut tx = self.snapshot().await?;
        let row = sqlx::query(&sql)
            .bind(to_i64(id.get()))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_job_execution", e))?;

        let execution = match row {
            Some(row) => Some(hydrate_job_execution(&mut tx, JobExecutionRow::from_row(&row)?).await?),
            None => None,
        };
        finish_snapshot(tx).await?;
        Ok(execution)
    }

    pub async fn select_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let sql = format!(
            "SELECT {JOB_EXECUTION_COLUMNS} FROM batch_job_execution WHERE instance_id = $1 ORDER BY id ASC"
        );
        let mut tx = self.snapshot().await?;
        let rows = sqlx::query(&sql)
            .bind(to_i64(instance_id.get()))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_job_executions", e))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(hydrate_job_execution(&mut tx, JobExecutionRow::from_row(&row)?).await?);
        }
        finish_snapshot(tx).await?;
        Ok(executions)
    }

    pub async fn select_last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let sql = format!(
            "SELECT {JOB_EXECUTION_COLUMNS} FROM batch_job_execution WHERE instance_id = $1 ORDER BY id DESC LIMIT 1"
        );
        let mut tx = self.snapshot().await?;
        let row = sqlx::query(&sql)
            .bind(to_i64(instance_id.get()))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_last_job_execution", e))?;

        let execution = match row {
            Some(row) => Some(hydrate_job_execution(&mut tx, JobExecutionRow::from_row(&row)?).await?),
            None => None,
        };
        finish_snapshot(tx).await?;
        Ok(execution)
    }

    pub async fn select_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_EXECUTION_COLUMNS} FROM batch_job_execution
            WHERE status IN ('STARTING', 'STARTED', 'STOPPING')
              AND ($1::text IS NULL OR job_name = $1)
            ORDER BY id ASC
            "#
        );
        let mut tx = self.snapshot().await?;
        let rows = sqlx::query(&sql)
            .bind(job_name)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_running_job_executions", e))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(hydrate_job_execution(&mut tx, JobExecutionRow::from_row(&row)?).await?);
        }
        finish_snapshot(tx).await?;
        Ok(executions)
    }

    #[instrument(skip(self), fields(execution_id = %job_execution_id, step = %step_name), err)]
    pub async fn insert_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError> {
        let mut step = StepExecution::new(StepExecutionId::new(0), job_execution_id, step_name);
        let row = sqlx::query(
            r#"
            INSERT INTO batch_step_execution (
                job_execution_id, step_name, status, exit_code, exit_description,
                start_time, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(to_i64(job_execution_id.get()))
        .bind(step_name)
        .bind(step.status.as_str())
        .bind(&step.exit_status.exit_code)
        .bind(&step.exit_status.exit_description)
        .bind(step.start_time)
        .bind(step.last_updated)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            // The only foreign key here points at the job execution.
            if is_foreign_key_violation(&e) {
                StoreError::NotFound(format!("job execution {job_execution_id}"))
            } else {
                map_sqlx_error("insert_step_execution", e)
            }
        })?;

        step.id = StepExecutionId::new(to_u64(row.try_get::<i64, _>("id").map_err(row_error)?));
        Ok(step)
    }

    #[instrument(skip(self, step), fields(step_execution_id = %step.id, step = %step.step_name), err)]
    pub async fn save_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE batch_step_execution SET
                status = $2,
                exit_code = $3,
                exit_description = $4,
                read_count = $5,
                write_count = $6,
                commit_count = $7,
                rollback_count = $8,
                filter_count = $9,
                read_skip_count = $10,
                process_skip_count = $11,
                write_skip_count = $12,
                end_time = $13,
                last_updated = $14
            WHERE id = $1
            "#,
        )
        .bind(to_i64(step.id.get()))
        .bind(step.status.as_str())
        .bind(&step.exit_status.exit_code)
        .bind(&step.exit_status.exit_description)
        .bind(to_i64(step.read_count))
        .bind(to_i64(step.write_count))
        .bind(to_i64(step.commit_count))
        .bind(to_i64(step.rollback_count))
        .bind(to_i64(step.filter_count))
        .bind(to_i64(step.read_skip_count))
        .bind(to_i64(step.process_skip_count))
        .bind(to_i64(step.write_skip_count))
        .bind(step.end_time)
        .bind(step.last_updated)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_step_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("step execution {}", step.id)));
        }

        replace_context(&mut tx, OWNER_STEP, step.id.get(), &step.execution_context).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    pub async fn select_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let mut tx = self.snapshot().await?;
        let steps = fetch_step_executions(&mut tx, job_execution_id).await?;
        finish_snapshot(tx).await?;
        Ok(steps)
    }

    pub async fn select_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        let sql = format!(
            r#"
            SELECT {STEP_EXECUTION_COLUMNS} FROM batch_step_execution
            WHERE step_name = $2
              AND job_execution_id IN (SELECT id FROM batch_job_execution WHERE instance_id = $1)
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let mut tx = self.snapshot().await?;
        let row = sqlx::query(&sql)
            .bind(to_i64(instance_id.get()))
            .bind(step_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("select_last_step_execution", e))?;

        let step = match row {
            Some(row) => Some(hydrate_step_execution(&mut tx, StepExecutionRow::from_row(&row)?).await?),
            None => None,
        };
        finish_snapshot(tx).await?;
        Ok(step)
    }

    pub async fn count_step_executions(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM batch_step_execution
            WHERE step_name = $2
              AND job_execution_id IN (SELECT id FROM batch_job_execution WHERE instance_id = $1)
            "#,
        )
        .bind(to_i64(instance_id.get()))
        .bind(step_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_step_executions", e))?;

        let total: i64 = row.try_get("total").map_err(row_error)?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }
}

async fn finish_snapshot(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Execution row plus its context and step executions, read on `conn`.
async fn hydrate_job_execution(
    conn: &mut PgConnection,
    row: JobExecutionRow,
) -> Result<JobExecution, StoreError> {
    let mut execution = row.into_execution()?;
    execution.execution_context = load_context(conn, OWNER_JOB, execution.id.get()).await?;
    execution.step_executions = fetch_step_executions(conn, execution.id).await?;
    Ok(execution)
}

async fn fetch_step_executions(
    conn: &mut PgConnection,
    job_execution_id: JobExecutionId,
) -> Result<Vec<StepExecution>, StoreError> {
    let sql = format!(
        "SELECT {STEP_EXECUTION_COLUMNS} FROM batch_step_execution WHERE job_execution_id = $1 ORDER BY id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(to_i64(job_execution_id.get()))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("select_step_executions", e))?;

    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        steps.push(hydrate_step_execution(conn, StepExecutionRow::from_row(&row)?).await?);
    }
    Ok(steps)
}

async fn hydrate_step_execution(
    conn: &mut PgConnection,
    row: StepExecutionRow,
) -> Result<StepExecution, StoreError> {
    let mut step = row.into_step()?;
    step.execution_context = load_context(conn, OWNER_STEP, step.id.get()).await?;
    Ok(step)
}

async fn load_context(
    conn: &mut PgConnection,
    owner_kind: &str,
    owner_id: u64,
) -> Result<ExecutionContext, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT key, value FROM batch_execution_context
        WHERE owner_kind = $1 AND owner_id = $2
        "#,
    )
    .bind(owner_kind)
    .bind(to_i64(owner_id))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_context", e))?;

    rows.iter()
        .map(|row| {
            let key: String = row.try_get("key").map_err(row_error)?;
            let value: JsonValue = row.try_get("value").map_err(row_error)?;
            Ok((key, value))
        })
        .collect()
}

async fn replace_context(
    tx: &mut Transaction<'_, Postgres>,
    owner_kind: &str,
    owner_id: u64,
    context: &ExecutionContext,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM batch_execution_context WHERE owner_kind = $1 AND owner_id = $2")
        .bind(owner_kind)
        .bind(to_i64(owner_id))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_context", e))?;

    for (key, value) in context.iter() {
        sqlx::query(
            r#"
            INSERT INTO batch_execution_context (owner_kind, owner_id, key, value)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(owner_kind)
        .bind(to_i64(owner_id))
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_context", e))?;
    }
    Ok(())
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<JobInstance, StoreError> {
    Ok(JobInstance {
        id: JobInstanceId::new(to_u64(row.try_get::<i64, _>("id").map_err(row_error)?)),
        job_name: row.try_get("job_name").map_err(row_error)?,
        identity_key: row.try_get("identity_key").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn row_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to decode row: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

fn has_code(err: &sqlx::Error, expected: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == expected;
        }
    }
    false
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobExecutionRow {
    id: i64,
    instance_id: i64,
    job_name: String,
    parameters: JsonValue,
    status: String,
    exit_code: String,
    exit_description: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl JobExecutionRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        <Self as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row).map_err(row_error)
    }

    fn into_execution(self) -> Result<JobExecution, StoreError> {
        let parameters: JobParameters = serde_json::from_value(self.parameters)
            .map_err(|e| StoreError::Serialization(format!("job parameters: {e}")))?;
        let status: BatchStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        Ok(JobExecution {
            id: JobExecutionId::new(to_u64(self.id)),
            instance_id: JobInstanceId::new(to_u64(self.instance_id)),
            job_name: self.job_name,
            parameters,
            status,
            exit_status: ExitStatus::new(self.exit_code).with_description(self.exit_description),
            create_time: self.create_time,
            start_time: self.start_time,
            end_time: self.end_time,
            last_updated: self.last_updated,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobExecutionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobExecutionRow {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            parameters: row.try_get("parameters")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            exit_description: row.try_get("exit_description")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

#[derive(Debug)]
struct StepExecutionRow {
    id: i64,
    job_execution_id: i64,
    step_name: String,
    status: String,
    exit_code: String,
    exit_description: String,
    read_count: i64,
    write_count: i64,
    commit_count: i64,
    rollback_count: i64,
    filter_count: i64,
    read_skip_count: i64,
    process_skip_count: i64,
    write_skip_count: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl StepExecutionRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        <Self as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row).map_err(row_error)
    }

    fn into_step(self) -> Result<StepExecution, StoreError> {
        let status: BatchStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        Ok(StepExecution {
            id: StepExecutionId::new(to_u64(self.id)),
            job_execution_id: JobExecutionId::new(to_u64(self.job_execution_id)),
            step_name: self.step_name,
            status,
            exit_status: ExitStatus::new(self.exit_code).with_description(self.exit_description),
            read_count: to_u64(self.read_count),
            write_count: to_u64(self.write_count),
            commit_count: to_u64(self.commit_count),
            rollback_count: to_u64(self.rollback_count),
            filter_count: to_u64(self.filter_count),
            read_skip_count: to_u64(self.read_skip_count),
            process_skip_count: to_u64(self.process_skip_count),
            write_skip_count: to_u64(self.write_skip_count),
            start_time: self.start_time,
            end_time: self.end_time,
            last_updated: self.last_updated,
            execution_context: ExecutionContext::new(),
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StepExecutionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StepExecutionRow {
            id: row.try_get("id")?,
            job_execution_id: row.try_get("job_execution_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            exit_description: row.try_get("exit_description")?,
            read_count: row.try_get("read_count")?,
            write_count: row.try_get("write_count")?,
            commit_count: row.try_get("commit_count")?,
            rollback_count: row.try_get("rollback_count")?,
            filter_count: row.try_get("filter_count")?,
            read_skip_count: row.try_get("read_skip_count")?,
            process_skip_count: row.try_get("process_skip_count")?,
            write_skip_count: row.try_get("write_skip_count")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

impl ExecutionStore for PostgresExecutionStore {
    fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, StoreError> {
        self.block_on(self.insert_job_instance(job_name, params))
    }

    fn find_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<Option<JobInstance>, StoreError> {
        self.block_on(self.select_job_instance(job_name, &params.identity_key()))
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        self.block_on(self.select_job_instance_by_id(id))
    }

    fn create_job_execution(
        &self,
        instance: &JobInstance,
        params: JobParameters,
    ) -> Result<JobExecution, StoreError> {
        self.block_on(self.insert_job_execution(instance, params))
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        self.block_on(self.save_job_execution(execution))
    }

    fn update_job_execution_if_status(
        &self,
        execution: &JobExecution,
        expected: &[BatchStatus],
    ) -> Result<bool, StoreError> {
        self.block_on(self.save_job_execution_if_status(execution, expected))
    }

    fn find_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, StoreError> {
        self.block_on(self.select_job_execution(id))
    }

    fn last_job_execution(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        self.block_on(self.select_last_job_execution(instance_id))
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, StoreError> {
        self.block_on(self.select_job_executions(instance_id))
    }

    fn find_running_job_executions(
        &self,
        job_name: Option<&str>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        self.block_on(self.select_running_job_executions(job_name))
    }

    fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
    ) -> Result<StepExecution, StoreError> {
        self.block_on(self.insert_step_execution(job_execution_id, step_name))
    }

    fn update_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        self.block_on(self.save_step_execution(step))
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        self.block_on(self.select_step_executions(job_execution_id))
    }

    fn last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, StoreError> {
        self.block_on(self.select_last_step_execution(instance_id, step_name))
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        self.block_on(self.count_step_executions(instance_id, step_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn current_thread_runtime_gets_an_error_instead_of_a_panic() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let pool = PgPoolOptions::new()
                .connect_lazy("postgres://batch@localhost/batch")
                .unwrap();
            let store = PostgresExecutionStore::new(pool).unwrap();
            let params = JobParameters::builder().add_string("run", "1", true).build();

            match store.find_job_instance("import", &params) {
                Err(StoreError::Storage(message)) => assert!(message.contains("current-thread"), "{message}"),
                other => panic!("expected a storage error, got {other:?}"),
            }
        });
    }
}
