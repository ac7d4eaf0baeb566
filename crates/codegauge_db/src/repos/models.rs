//! Model repository.
//!
//! A model row is created without an artifact URI; the URI is written only
//! after the artifact store has acknowledged the write. A row without a URI
//! is never eligible for inference.

use chrono::Utc;
use codegauge_protocol::ConfigMap;
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::ModelRow;
use crate::pool::DbPool;

#[derive(Clone)]
pub struct ModelRepository {
    pool: DbPool,
}

/// Fields for a new model row.
#[derive(Debug, Clone, Default)]
pub struct NewModel {
    pub name: String,
    pub model_type: String,
    pub dataset_id: Option<i64>,
    pub training_job_id: Option<i64>,
    pub hp_search_job_id: Option<i64>,
    pub hyperparameters: ConfigMap,
    pub performance_metrics: ConfigMap,
}

impl ModelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Next version for a model name: `max_existing_version + 1`.
    pub async fn next_version(&self, name: &str) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM cg_models WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    /// Create a model row at the next free version. The unique index on
    /// `(name, version)` turns a concurrent insert race into a constraint
    /// error rather than a duplicate.
    pub async fn create(&self, new: &NewModel) -> Result<ModelRow> {
        let version = self.next_version(&new.name).await?;
        let now = Utc::now().to_rfc3339();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_models
                (name, version, model_type, dataset_id, training_job_id, hp_search_job_id,
                 hyperparameters, performance_metrics, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&new.name)
        .bind(version)
        .bind(&new.model_type)
        .bind(new.dataset_id)
        .bind(new.training_job_id)
        .bind(new.hp_search_job_id)
        .bind(serde_json::to_string(&new.hyperparameters)?)
        .bind(serde_json::to_string(&new.performance_metrics)?)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::constraint(format!("model ({}, v{}) already exists", new.name, version))
            }
            _ => DbError::from(e),
        })?;

        info!("Created model row {} ({} v{})", id, new.name, version);
        self.get_required(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<ModelRow>> {
        let row = sqlx::query_as::<_, ModelRow>("SELECT * FROM cg_models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_required(&self, id: i64) -> Result<ModelRow> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("model {}", id)))
    }

    /// Record the artifact URI after the artifact write acknowledged.
    pub async fn set_artifact_uri(&self, id: i64, uri: &str) -> Result<()> {
        sqlx::query("UPDATE cg_models SET artifact_uri = ?, updated_at = ? WHERE id = ?")
            .bind(uri)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update evaluation metrics (hp-search retrain path).
    pub async fn set_performance_metrics(&self, id: i64, metrics: &ConfigMap) -> Result<()> {
        sqlx::query("UPDATE cg_models SET performance_metrics = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(metrics)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ModelRow>> {
        let rows = sqlx::query_as::<_, ModelRow>("SELECT * FROM cg_models ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cg_models")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
