//! Run lifecycle operations.

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::parse_status;
use crate::models::{NodeRunStatus, RunRow, RunStatus};
use crate::DbError;

const COLUMNS: &str =
    "id, pipeline_id, status, input, output, definition, created_at, started_at, completed_at";

fn from_row(row: &PgRow) -> Result<RunRow, DbError> {
    let status: String = row.try_get("status")?;
    Ok(RunRow {
        id: row.try_get("id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        status: parse_status(&status)?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        definition: row.try_get("definition")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Insert a `PENDING` run plus one `PENDING` node run per node id, in one
/// transaction.  Node runs keep the order of `node_ids`.
pub async fn create_run(
    pool: &PgPool,
    pipeline_id: Uuid,
    input: Value,
    definition: Value,
    node_ids: &[String],
) -> Result<RunRow, DbError> {
    let mut tx = pool.begin().await?;
    let run_id = Uuid::new_v4();

    let sql = format!(
        "INSERT INTO runs (id, pipeline_id, status, input, definition, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(pipeline_id)
        .bind(RunStatus::Pending.as_str())
        .bind(input)
        .bind(definition)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
    let run = from_row(&row)?;

    for (position, node_id) in node_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO node_runs (id, run_id, node_id, position, status)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(node_id)
        .bind(position as i32)
        .bind(NodeRunStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(run)
}

/// Fetch a single run by its primary key.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;
    from_row(&row)
}

/// All runs of one pipeline, newest first.
pub async fn list_runs(pool: &PgPool, pipeline_id: Uuid) -> Result<Vec<RunRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE pipeline_id = $1 ORDER BY created_at DESC");
    let rows = sqlx::query(&sql).bind(pipeline_id).fetch_all(pool).await?;
    rows.iter().map(from_row).collect()
}

pub async fn delete_run(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM runs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Move a run to `to` only if its current status is one of `from`.
///
/// Returns `true` when the row changed.  `started_at` is stamped on the move
/// to `RUNNING`, `completed_at` on the move to a terminal status, and
/// `output` is only written when given.
pub async fn transition_run(
    pool: &PgPool,
    id: Uuid,
    from: &[RunStatus],
    to: RunStatus,
    output: Option<Value>,
) -> Result<bool, DbError> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_owned()).collect();

    let result = sqlx::query(
        "UPDATE runs
         SET status       = $2,
             output       = COALESCE($3, output),
             started_at   = CASE WHEN $4 THEN $6 ELSE started_at END,
             completed_at = CASE WHEN $5 THEN $6 ELSE completed_at END
         WHERE id = $1 AND status = ANY($7)",
    )
    .bind(id)
    .bind(to.as_str())
    .bind(output)
    .bind(to == RunStatus::Running)
    .bind(to.is_terminal())
    .bind(Utc::now())
    .bind(from)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
