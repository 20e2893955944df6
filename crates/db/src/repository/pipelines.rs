//! Pipeline CRUD operations.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::PipelineRow, DbError};

const COLUMNS: &str = "id, name, description, definition, created_at, updated_at";

/// Insert a new pipeline.
///
/// `definition` is the serialised domain `Pipeline` from the `engine` crate.
pub async fn create_pipeline(
    pool: &PgPool,
    name: &str,
    description: Option<&str>,
    definition: Value,
) -> Result<PipelineRow, DbError> {
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO pipelines (id, name, description, definition, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $5)
         RETURNING {COLUMNS}"
    );

    let row = sqlx::query_as::<_, PipelineRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(definition)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Fetch a single pipeline by its primary key.
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<PipelineRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM pipelines WHERE id = $1");
    sqlx::query_as::<_, PipelineRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Return all pipelines, newest first.
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<PipelineRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM pipelines ORDER BY created_at DESC");
    let rows = sqlx::query_as::<_, PipelineRow>(&sql)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Replace a pipeline's name, description and definition.
///
/// Existing runs keep their own definition snapshot.
pub async fn update_pipeline(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    description: Option<&str>,
    definition: Value,
) -> Result<PipelineRow, DbError> {
    let sql = format!(
        "UPDATE pipelines
         SET name = $2, description = $3, definition = $4, updated_at = $5
         WHERE id = $1
         RETURNING {COLUMNS}"
    );

    sqlx::query_as::<_, PipelineRow>(&sql)
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(definition)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Permanently delete a pipeline together with its runs.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_pipeline(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
