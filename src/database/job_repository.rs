//! Job registry: persistent queue of asynchronous analysis runs
//!
//! Workers claim pending runs with a `FOR UPDATE SKIP LOCKED` pop, so
//! exactly one worker wins each job without blocking the others. Progress
//! and checkpoints live inside `run_parameters` and are safe to overwrite;
//! terminal states absorb further transitions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{AnalysisRun, ImportCheckpoint, RunProgress, RunStatus, RunType};

pub struct JobRepository;

type RunRow = (
    Uuid,
    String,
    String,
    Uuid,
    Option<String>,
    Uuid,
    Value,
    Option<Value>,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const RUN_COLUMNS: &str = "id, run_type, status, dataset_id, source_commit_id, user_id, \
                           run_parameters, output_summary, error_message, created_at, completed_at";

fn run_from_row(row: RunRow) -> AnalysisRun {
    let (
        id,
        run_type,
        status,
        dataset_id,
        source_commit_id,
        user_id,
        run_parameters,
        output_summary,
        error_message,
        created_at,
        completed_at,
    ) = row;

    AnalysisRun {
        id,
        run_type: RunType::parse(&run_type).unwrap_or(RunType::Import),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        dataset_id,
        source_commit_id,
        user_id,
        run_parameters,
        output_summary,
        error_message,
        created_at,
        completed_at,
    }
}

impl JobRepository {
    pub async fn enqueue(
        tx: &mut Transaction<'static, Postgres>,
        run_type: RunType,
        dataset_id: Uuid,
        source_commit_id: Option<&str>,
        user_id: Uuid,
        run_parameters: &Value,
    ) -> Result<Uuid, sqlx::Error> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO analysis_runs (run_type, dataset_id, source_commit_id, user_id, run_parameters)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(run_type.as_str())
        .bind(dataset_id)
        .bind(source_commit_id)
        .bind(user_id)
        .bind(run_parameters)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Atomically claim the oldest pending run of `run_type`. The skip-locked
    /// subselect guarantees a single winner across concurrent workers.
    pub async fn claim_next(
        pool: &PgPool,
        run_type: RunType,
    ) -> Result<Option<AnalysisRun>, sqlx::Error> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE analysis_runs
            SET status = 'running', started_at = now(), heartbeat_at = now()
            WHERE id = (
                SELECT id FROM analysis_runs
                WHERE status = 'pending' AND run_type = $1
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_type.as_str())
        .fetch_optional(pool)
        .await?;

        Ok(row.map(run_from_row))
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<AnalysisRun>, sqlx::Error> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM analysis_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(run_from_row))
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        dataset_id: Option<Uuid>,
        status: Option<RunStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<AnalysisRun>, sqlx::Error> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM analysis_runs
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR dataset_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(user_id)
        .bind(dataset_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(run_from_row).collect())
    }

    /// Pending or running jobs of a type for one dataset; backs the
    /// concurrent-import cap.
    pub async fn count_active(
        pool: &PgPool,
        dataset_id: Uuid,
        run_type: RunType,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM analysis_runs
            WHERE dataset_id = $1 AND run_type = $2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(dataset_id)
        .bind(run_type.as_str())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Overwrite the progress substructure. Idempotent; later writes win.
    pub async fn set_progress(
        pool: &PgPool,
        id: Uuid,
        progress: &RunProgress,
    ) -> Result<(), sqlx::Error> {
        let value = serde_json::to_value(progress).unwrap_or(Value::Null);
        sqlx::query(
            r#"
            UPDATE analysis_runs
            SET run_parameters = jsonb_set(run_parameters, '{progress}', $2, true)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Persist a resume checkpoint. Safe to overwrite at any interval.
    pub async fn set_checkpoint(
        pool: &PgPool,
        id: Uuid,
        checkpoint: &ImportCheckpoint,
    ) -> Result<(), sqlx::Error> {
        let value = serde_json::to_value(checkpoint).unwrap_or(Value::Null);
        sqlx::query(
            r#"
            UPDATE analysis_runs
            SET run_parameters = jsonb_set(run_parameters, '{checkpoint}', $2, true)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Refresh the worker heartbeat and report the job's current status so
    /// workers can observe cancellation at batch boundaries.
    pub async fn heartbeat(pool: &PgPool, id: Uuid) -> Result<Option<RunStatus>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE analysis_runs
            SET heartbeat_at = CASE WHEN status = 'running' THEN now() ELSE heartbeat_at END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row.and_then(|(status,)| RunStatus::parse(&status)))
    }

    /// Transition running → completed with the output summary. A job no
    /// longer in `running` (cancelled meanwhile) is left untouched.
    pub async fn complete(
        pool: &PgPool,
        id: Uuid,
        output_summary: &Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'completed', output_summary = $2, completed_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(output_summary)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn fail(pool: &PgPool, id: Uuid, error_message: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'failed', error_message = $2, completed_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a pending or running job. Running jobs stop at their next
    /// batch boundary; terminal states are untouched.
    pub async fn cancel(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = 'cancelled', completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reset running jobs whose heartbeat is older than `timeout` back to
    /// pending so a live worker can reclaim them from their checkpoint.
    pub async fn recover_stalled(
        pool: &PgPool,
        timeout: Duration,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE analysis_runs
            SET status = 'pending', started_at = NULL, heartbeat_at = NULL
            WHERE status = 'running'
              AND heartbeat_at < now() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(timeout.as_secs_f64())
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
