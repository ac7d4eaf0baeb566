//! Commit detail repository with the ingestion sub-state machine.

use chrono::{DateTime, Utc};
use codegauge_protocol::IngestionStatus;
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::{CommitDetailRow, FileDiffRow};
use crate::pool::DbPool;

#[derive(Clone)]
pub struct CommitRepository {
    pool: DbPool,
}

/// Upsert payload for a commit detail row.
#[derive(Debug, Clone, Default)]
pub struct CommitDetailUpsert {
    pub commit_hash: String,
    pub message: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// One per-file diff attached to a commit detail row.
#[derive(Debug, Clone, Default)]
pub struct FileDiffUpsert {
    pub file_path: String,
    pub change_type: Option<String>,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub diff_text: Option<String>,
}

impl CommitRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<Option<CommitDetailRow>> {
        let row = sqlx::query_as::<_, CommitDetailRow>(
            "SELECT * FROM cg_commit_details WHERE repository_id = ? AND commit_hash = ?",
        )
        .bind(repository_id)
        .bind(commit_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Upsert the detail row and replace its file diffs in one transaction.
    pub async fn upsert_with_diffs(
        &self,
        repository_id: i64,
        detail: &CommitDetailUpsert,
        diffs: &[FileDiffUpsert],
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_commit_details
                (repository_id, commit_hash, message, author_name, author_email,
                 committed_at, ingestion_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'running', ?, ?)
            ON CONFLICT(repository_id, commit_hash) DO UPDATE SET
                message = excluded.message,
                author_name = excluded.author_name,
                author_email = excluded.author_email,
                committed_at = excluded.committed_at,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(&detail.commit_hash)
        .bind(&detail.message)
        .bind(&detail.author_name)
        .bind(&detail.author_email)
        .bind(detail.committed_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM cg_commit_file_diffs WHERE commit_detail_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for diff in diffs {
            sqlx::query(
                r#"
                INSERT INTO cg_commit_file_diffs
                    (commit_detail_id, file_path, change_type, lines_added, lines_deleted, diff_text)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&diff.file_path)
            .bind(&diff.change_type)
            .bind(diff.lines_added)
            .bind(diff.lines_deleted)
            .bind(&diff.diff_text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            "Upserted commit detail {} ({} diffs) for repository {}",
            id,
            diffs.len(),
            repository_id
        );
        Ok(id)
    }

    /// Create a placeholder detail row in `pending` ingestion state, if one
    /// does not already exist.
    pub async fn mark_ingestion_pending(
        &self,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_commit_details
                (repository_id, commit_hash, ingestion_status, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?)
            ON CONFLICT(repository_id, commit_hash) DO UPDATE SET
                ingestion_status = CASE
                    WHEN cg_commit_details.ingestion_status IN ('not_ingested', 'failed')
                    THEN 'pending' ELSE cg_commit_details.ingestion_status END,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(commit_hash)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// CAS on the ingestion sub-machine.
    pub async fn try_ingestion_transition(
        &self,
        repository_id: i64,
        commit_hash: &str,
        expected: IngestionStatus,
        next: IngestionStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE cg_commit_details
            SET ingestion_status = ?, status_message = COALESCE(?, status_message), updated_at = ?
            WHERE repository_id = ? AND commit_hash = ? AND ingestion_status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(repository_id)
        .bind(commit_hash)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn diffs_for(&self, commit_detail_id: i64) -> Result<Vec<FileDiffRow>> {
        let rows = sqlx::query_as::<_, FileDiffRow>(
            "SELECT * FROM cg_commit_file_diffs WHERE commit_detail_id = ? ORDER BY id ASC",
        )
        .bind(commit_detail_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_required(
        &self,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<CommitDetailRow> {
        self.get(repository_id, commit_hash).await?.ok_or_else(|| {
            DbError::not_found(format!("commit {}@{}", repository_id, commit_hash))
        })
    }
}
