//! Per-node run state.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::parse_status;
use crate::models::{NodeRunRow, NodeRunStatus, NodeRunTransition, RunStatus};
use crate::DbError;

const COLUMNS: &str =
    "nr.id, nr.run_id, nr.node_id, nr.status, nr.job_id, nr.input, nr.output, nr.error, nr.started_at, nr.completed_at";

fn from_row(row: &PgRow) -> Result<NodeRunRow, DbError> {
    let status: String = row.try_get("status")?;
    Ok(NodeRunRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        status: parse_status(&status)?,
        job_id: row.try_get("job_id")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn status_list(statuses: &[NodeRunStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

/// All node runs of a run, in pipeline node order.
pub async fn list_node_runs(pool: &PgPool, run_id: Uuid) -> Result<Vec<NodeRunRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM node_runs nr WHERE nr.run_id = $1 ORDER BY nr.position");
    let rows = sqlx::query(&sql).bind(run_id).fetch_all(pool).await?;
    rows.iter().map(from_row).collect()
}

pub async fn get_node_run(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
) -> Result<NodeRunRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM node_runs nr WHERE nr.run_id = $1 AND nr.node_id = $2");
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;
    from_row(&row)
}

/// Look up the node run that delegated to `job_id`, if any.
pub async fn find_by_job(pool: &PgPool, job_id: &str) -> Result<Option<NodeRunRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM node_runs nr WHERE nr.job_id = $1 LIMIT 1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.as_ref().map(from_row).transpose()
}

/// Apply `transition` only if the node run's status is one of `from`.
///
/// Returns `true` when the row changed.
pub async fn transition_node_run(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
    from: &[NodeRunStatus],
    transition: NodeRunTransition,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE node_runs
         SET status       = $3,
             input        = COALESCE($4, input),
             output       = COALESCE($5, output),
             error        = COALESCE($6, error),
             started_at   = CASE WHEN $7 THEN $9 ELSE started_at END,
             completed_at = CASE WHEN $8 THEN $9 ELSE completed_at END
         WHERE run_id = $1 AND node_id = $2 AND status = ANY($10)",
    )
    .bind(run_id)
    .bind(node_id)
    .bind(transition.to.as_str())
    .bind(transition.input)
    .bind(transition.output)
    .bind(transition.error)
    .bind(transition.to == NodeRunStatus::Running)
    .bind(transition.to.is_terminal())
    .bind(Utc::now())
    .bind(status_list(from))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record the job a node delegated to.
pub async fn set_job(
    pool: &PgPool,
    run_id: Uuid,
    node_id: &str,
    job_id: &str,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE node_runs SET job_id = $3 WHERE run_id = $1 AND node_id = $2")
        .bind(run_id)
        .bind(node_id)
        .bind(job_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Fail every `PENDING` or `RUNNING` node run of `run_id` and return the
/// rows that changed, in node order.
pub async fn fail_open(
    pool: &PgPool,
    run_id: Uuid,
    error: &str,
) -> Result<Vec<NodeRunRow>, DbError> {
    let sql = format!(
        "UPDATE node_runs nr
         SET status = $2, error = $3, completed_at = $4
         WHERE nr.run_id = $1 AND nr.status = ANY($5)
         RETURNING {COLUMNS}, nr.position"
    );
    let rows = sqlx::query(&sql)
        .bind(run_id)
        .bind(NodeRunStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(status_list(&[NodeRunStatus::Pending, NodeRunStatus::Running]))
        .fetch_all(pool)
        .await?;

    let mut changed: Vec<(i32, NodeRunRow)> = rows
        .iter()
        .map(|row| -> Result<(i32, NodeRunRow), DbError> {
            Ok((row.try_get("position")?, from_row(row)?))
        })
        .collect::<Result<_, _>>()?;
    changed.sort_by_key(|(position, _)| *position);
    Ok(changed.into_iter().map(|(_, row)| row).collect())
}

/// `RUNNING` node runs with a job id whose run is still `RUNNING`.
pub async fn list_inflight(pool: &PgPool) -> Result<Vec<NodeRunRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM node_runs nr
         JOIN runs r ON r.id = nr.run_id
         WHERE nr.status = $1 AND nr.job_id IS NOT NULL AND r.status = $2
         ORDER BY nr.started_at"
    );
    let rows = sqlx::query(&sql)
        .bind(NodeRunStatus::Running.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}
