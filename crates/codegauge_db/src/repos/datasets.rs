//! Dataset repository.

use chrono::Utc;
use codegauge_protocol::DatasetStatus;
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::{DatasetConfig, DatasetRow};
use crate::pool::DbPool;

#[derive(Clone)]
pub struct DatasetRepository {
    pool: DbPool,
}

impl DatasetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        repository_id: i64,
        name: &str,
        config: &DatasetConfig,
    ) -> Result<DatasetRow> {
        let now = Utc::now().to_rfc3339();
        let config_json = serde_json::to_string(config)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_datasets (repository_id, name, status, config, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(repository_id)
        .bind(name)
        .bind(&config_json)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        info!("Created dataset {} for repository {}", id, repository_id);
        self.get_required(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<DatasetRow>> {
        let row = sqlx::query_as::<_, DatasetRow>("SELECT * FROM cg_datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_required(&self, id: i64) -> Result<DatasetRow> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("dataset {}", id)))
    }

    /// CAS on the dataset sub-machine (`pending -> generating -> ready|failed`).
    pub async fn try_transition(
        &self,
        id: i64,
        expected: DatasetStatus,
        next: DatasetStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE cg_datasets
            SET status = ?, status_message = COALESCE(?, status_message), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Terminal `ready` write: status, both URIs and the row count together.
    pub async fn mark_ready(
        &self,
        id: i64,
        storage_uri: &str,
        background_sample_uri: Option<&str>,
        num_rows: i64,
        message: &str,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE cg_datasets
            SET status = 'ready',
                status_message = ?,
                storage_uri = ?,
                background_sample_uri = ?,
                num_rows = ?,
                updated_at = ?
            WHERE id = ? AND status = 'generating'
            "#,
        )
        .bind(message)
        .bind(storage_uri)
        .bind(background_sample_uri)
        .bind(num_rows)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cg_datasets
            SET status = 'failed', status_message = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'generating')
            "#,
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a rewritten config (feature selection narrows the columns).
    pub async fn update_config(&self, id: i64, config: &DatasetConfig) -> Result<()> {
        sqlx::query("UPDATE cg_datasets SET config = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(config)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_for_repository(&self, repository_id: i64) -> Result<Vec<DatasetRow>> {
        let rows = sqlx::query_as::<_, DatasetRow>(
            "SELECT * FROM cg_datasets WHERE repository_id = ? ORDER BY id DESC",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM cg_datasets GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}
