//! Job repository: the only mutator of `cg_jobs`.
//!
//! Every status change goes through a compare-and-set
//! (`UPDATE ... WHERE id = ? AND status = ?`); zero rows affected means
//! another actor transitioned first and the caller reloads and decides
//! whether to ignore, adopt, or abort.

use chrono::Utc;
use codegauge_protocol::{JobKind, JobStatus, PredictionPackage, TaskId};
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::JobRow;
use crate::pool::DbPool;

#[derive(Clone)]
pub struct JobRepository {
    pool: DbPool,
}

/// Fields for a new `pending` job row.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub kind: Option<JobKind>,
    pub config: serde_json::Value,
    pub dataset_id: Option<i64>,
    pub model_id: Option<i64>,
    pub input_reference: Option<serde_json::Value>,
    pub study_name: Option<String>,
    pub inference_job_id: Option<i64>,
    pub repository_id: Option<i64>,
}

impl NewJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind: Some(kind),
            config: serde_json::json!({}),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_dataset(mut self, dataset_id: i64) -> Self {
        self.dataset_id = Some(dataset_id);
        self
    }

    pub fn with_model(mut self, model_id: i64) -> Self {
        self.model_id = Some(model_id);
        self
    }

    pub fn with_repository(mut self, repository_id: i64) -> Self {
        self.repository_id = Some(repository_id);
        self
    }
}

/// Structured results written together with the terminal CAS.
#[derive(Debug, Clone, Default)]
pub struct TerminalResults {
    pub prediction_result: Option<PredictionPackage>,
    pub best_trial_id: Option<i64>,
    pub best_params: Option<serde_json::Value>,
    pub best_value: Option<f64>,
    /// Links the created model onto the job row (training / hp-search).
    pub model_id: Option<i64>,
}

impl JobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewJob) -> Result<JobRow> {
        let kind = new
            .kind
            .ok_or_else(|| DbError::constraint("job kind is required"))?;
        let now = Utc::now().to_rfc3339();
        let config = serde_json::to_string(&new.config)?;
        let input_reference = new
            .input_reference
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cg_jobs
                (kind, status, config, dataset_id, model_id, input_reference,
                 study_name, inference_job_id, repository_id, created_at, updated_at)
            VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(&config)
        .bind(new.dataset_id)
        .bind(new.model_id)
        .bind(&input_reference)
        .bind(&new.study_name)
        .bind(new.inference_job_id)
        .bind(new.repository_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        info!("Created {} job {}", kind, id);
        self.get_required(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM cg_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_required(&self, id: i64) -> Result<JobRow> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {}", id)))
    }

    /// Record the broker task id assigned at publish time.
    pub async fn set_task_id(&self, id: i64, task_id: &TaskId) -> Result<()> {
        sqlx::query("UPDATE cg_jobs SET broker_task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Adopt a running job under a new task id (re-delivery takeover).
    pub async fn adopt_task(&self, id: i64, task_id: &TaskId) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE cg_jobs
            SET broker_task_id = ?, status_message = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(task_id.as_str())
        .bind(format!("Processing taken over by task {}", task_id))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Compare-and-set status transition.
    ///
    /// Returns `Ok(false)` when another actor transitioned first. Illegal
    /// edges are rejected before the query is issued.
    pub async fn try_transition(
        &self,
        id: i64,
        expected: JobStatus,
        next: JobStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(DbError::illegal_transition(format!(
                "job {}: {} -> {}",
                id, expected, next
            )));
        }

        let now = Utc::now().to_rfc3339();
        let set_started = next == JobStatus::Running;
        let set_completed = next.is_terminal();

        let affected = sqlx::query(
            r#"
            UPDATE cg_jobs
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

        if affected == 1 {
            info!("Job {} transitioned {} -> {}", id, expected, next);
        }
        Ok(affected == 1)
    }

    /// Mark a running job as running under the given task id, stamping
    /// `started_at`. CAS from `pending`.
    pub async fn mark_running(&self, id: i64, task_id: &TaskId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            UPDATE cg_jobs
            SET status = 'running',
                broker_task_id = ?,
                started_at = COALESCE(started_at, ?),
                updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(task_id.as_str())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Terminal CAS from `running`, writing structured results in the same
    /// statement so a crash cannot leave a successful row without them.
    pub async fn complete(
        &self,
        id: i64,
        next: JobStatus,
        message: &str,
        results: &TerminalResults,
    ) -> Result<bool> {
        if !JobStatus::Running.can_transition_to(next) {
            return Err(DbError::illegal_transition(format!(
                "job {}: running -> {}",
                id, next
            )));
        }

        let now = Utc::now().to_rfc3339();
        let prediction = results
            .prediction_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let best_params = results
            .best_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = sqlx::query(
            r#"
            UPDATE cg_jobs
            SET status = ?,
                status_message = ?,
                prediction_result = COALESCE(?, prediction_result),
                best_trial_id = COALESCE(?, best_trial_id),
                best_params = COALESCE(?, best_params),
                best_value = COALESCE(?, best_value),
                model_id = COALESCE(?, model_id),
                completed_at = ?,
                updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(next.as_str())
        .bind(message)
        .bind(&prediction)
        .bind(results.best_trial_id)
        .bind(&best_params)
        .bind(results.best_value)
        .bind(results.model_id)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            info!("Job {} completed as {}", id, next);
        }
        Ok(affected == 1)
    }

    /// Atomically claim the oldest dispatchable pending job for one of the
    /// given kinds. The job stays `pending` until its handler CASes it to
    /// `running`; `dispatched_at` keeps the dispatcher from handing the same
    /// row to two workers.
    pub async fn claim_next_for_dispatch(&self, kinds: &[JobKind]) -> Result<Option<JobRow>> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let select = format!(
            "SELECT id FROM cg_jobs \
             WHERE status = 'pending' AND dispatched_at IS NULL AND kind IN ({}) \
             ORDER BY id ASC LIMIT 1",
            placeholders
        );
        let mut query = sqlx::query_scalar::<_, i64>(&select);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let job_id: Option<i64> = query.fetch_optional(&mut *tx).await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let affected = sqlx::query(
            "UPDATE cg_jobs SET dispatched_at = ? WHERE id = ? AND dispatched_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            // Claimed by another dispatcher thread
            tx.commit().await?;
            return Ok(None);
        }

        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM cg_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    /// Hold a pending job back from dispatch until an upstream job hands it
    /// off (`requeue_dispatch` is the release).
    pub async fn park_dispatch(&self, id: i64) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE cg_jobs SET dispatched_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending' AND dispatched_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 1 {
            info!("Job {} parked pending an upstream hand-off", id);
        }
        Ok(affected == 1)
    }

    /// Return a dispatched-but-still-pending job to the queue (worker loss,
    /// or an upstream hand-off releasing a parked job).
    pub async fn requeue_dispatch(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE cg_jobs SET dispatched_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        info!("Job {} returned to dispatch queue", id);
        Ok(())
    }

    pub async fn find_by_task_id(&self, task_id: &TaskId) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM cg_jobs WHERE broker_task_id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// All jobs attached to a named HP-search study, oldest first.
    pub async fn find_by_study(&self, study_name: &str) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM cg_jobs WHERE study_name = ? ORDER BY id ASC",
        )
        .bind(study_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_recent(&self, kind: Option<JobKind>, limit: i64) -> Result<Vec<JobRow>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM cg_jobs WHERE kind = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(kind.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>("SELECT * FROM cg_jobs ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Job counts by status, for the dashboard.
    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM cg_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}
