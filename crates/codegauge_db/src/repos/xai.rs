//! XAI result repository.
//!
//! Rows are created `pending` and are idempotent on
//! `(inference_job_id, xai_type)`; the explanation worker drives each row
//! through the same CAS discipline as jobs.

use chrono::Utc;
use codegauge_protocol::{JobStatus, TaskId, XaiType};
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::XaiResultRow;
use crate::pool::DbPool;

#[derive(Clone)]
pub struct XaiRepository {
    pool: DbPool,
}

impl XaiRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<XaiResultRow>> {
        let row = sqlx::query_as::<_, XaiResultRow>("SELECT * FROM cg_xai_results WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_required(&self, id: i64) -> Result<XaiResultRow> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("xai result {}", id)))
    }

    /// Create a pending row for `(inference_job_id, xai_type)` unless one
    /// already exists. Returns `(id, created)`.
    pub async fn create_pending(
        &self,
        inference_job_id: i64,
        xai_type: XaiType,
    ) -> Result<(i64, bool)> {
        let now = Utc::now().to_rfc3339();
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO cg_xai_results
                (inference_job_id, xai_type, status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            ON CONFLICT(inference_job_id, xai_type) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(inference_job_id)
        .bind(xai_type.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT id FROM cg_xai_results WHERE inference_job_id = ? AND xai_type = ?",
        )
        .bind(inference_job_id)
        .bind(xai_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok((existing, false))
    }

    pub async fn set_task_id(&self, id: i64, task_id: &TaskId) -> Result<()> {
        sqlx::query("UPDATE cg_xai_results SET broker_task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bulk-mark rows whose dispatch failed.
    pub async fn mark_failed_bulk(&self, ids: &[i64], message: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE cg_xai_results \
             SET status = 'failed', status_message = ?, completed_at = ?, updated_at = ? \
             WHERE id IN ({}) AND status IN ('pending', 'running')",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(message).bind(&now).bind(&now);
        for id in ids {
            query = query.bind(id);
        }
        let affected = query.execute(&self.pool).await?.rows_affected();
        info!("Marked {} XAI results failed: {}", affected, message);
        Ok(affected as usize)
    }

    /// CAS on the XAI row status machine (same shape as jobs).
    pub async fn try_transition(
        &self,
        id: i64,
        expected: JobStatus,
        next: JobStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(DbError::illegal_transition(format!(
                "xai result {}: {} -> {}",
                id, expected, next
            )));
        }

        let now = Utc::now().to_rfc3339();
        let set_started = next == JobStatus::Running;
        let set_completed = next.is_terminal();

        let affected = sqlx::query(
            r#"
            UPDATE cg_xai_results
            SET status = ?,
                status_message = COALESCE(?, status_message),
                started_at = CASE WHEN ? THEN COALESCE(started_at, ?) ELSE started_at END,
                completed_at = CASE WHEN ? THEN ? ELSE completed_at END,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(message)
        .bind(set_started)
        .bind(&now)
        .bind(set_completed)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Terminal success CAS writing the typed result object.
    pub async fn complete_success(
        &self,
        id: i64,
        result: &serde_json::Value,
        message: &str,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            UPDATE cg_xai_results
            SET status = 'success', status_message = ?, result = ?,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(message)
        .bind(serde_json::to_string(result)?)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn list_for_inference(&self, inference_job_id: i64) -> Result<Vec<XaiResultRow>> {
        let rows = sqlx::query_as::<_, XaiResultRow>(
            "SELECT * FROM cg_xai_results WHERE inference_job_id = ? ORDER BY id ASC",
        )
        .bind(inference_job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
