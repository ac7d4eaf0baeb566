//! Submission service.
//!
//! One method per submittable job kind. Each performs cross-entity checks,
//! writes the pending job row, publishes to the broker and records the
//! returned task id. A publish failure flips the row to `failed`
//! (best-effort, logged when the compensation itself fails).

use std::collections::BTreeMap;

use codegauge_db::{
    BotPatternType, DatasetConfig, DbError, DbPool, JobRepository, JobRow, MetricRepository,
    ModelRepository, NewJob, RegistryKind, RegistryRepository, RepoRepository, XaiRepository,
};
use codegauge_db::{CommitRepository, DatasetRepository};
use codegauge_protocol::{
    validate_params, DatasetStatus, HyperparameterSpec, JobKind, JobStatus, TaskId,
};
use thiserror::Error;
use tracing::{error, info};

use crate::api::{HpSearchSubmission, TrainingSubmission};
use crate::broker::BrokerHandle;
use crate::status::TaskStatusStore;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl From<DbError> for SubmitError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(msg) => SubmitError::NotFound(msg),
            DbError::Constraint(msg) => SubmitError::Conflict(msg),
            other => SubmitError::Internal(other.to_string()),
        }
    }
}

pub type SubmitResult = Result<(i64, TaskId), SubmitError>;

#[derive(Clone)]
pub struct SubmissionService {
    pub jobs: JobRepository,
    pub datasets: DatasetRepository,
    pub models: ModelRepository,
    pub repositories: RepoRepository,
    pub commits: CommitRepository,
    pub metrics: MetricRepository,
    pub registries: RegistryRepository,
    pub xai: XaiRepository,
    broker: BrokerHandle,
    status: TaskStatusStore,
}

impl SubmissionService {
    pub fn new(pool: DbPool, broker: BrokerHandle, status: TaskStatusStore) -> Self {
        Self {
            jobs: JobRepository::new(pool.clone()),
            datasets: DatasetRepository::new(pool.clone()),
            models: ModelRepository::new(pool.clone()),
            repositories: RepoRepository::new(pool.clone()),
            commits: CommitRepository::new(pool.clone()),
            metrics: MetricRepository::new(pool.clone()),
            registries: RegistryRepository::new(pool.clone()),
            xai: XaiRepository::new(pool),
            broker,
            status,
        }
    }

    // ------------------------------------------------------------------
    // Entity management
    // ------------------------------------------------------------------

    pub async fn create_repository(&self, git_url: &str) -> Result<(i64, String), SubmitError> {
        if git_url.trim().is_empty() {
            return Err(SubmitError::Validation("git_url must not be empty".into()));
        }
        let row = self.repositories.create(git_url).await?;
        Ok((row.id, row.name))
    }

    pub async fn add_bot_pattern(
        &self,
        repository_id: Option<i64>,
        pattern: &str,
        pattern_type: &str,
        is_exclusion: bool,
    ) -> Result<i64, SubmitError> {
        let pattern_type = BotPatternType::parse(pattern_type).ok_or_else(|| {
            SubmitError::Validation(format!(
                "pattern_type must be exact, wildcard or regex, got '{}'",
                pattern_type
            ))
        })?;
        if let Some(repo_id) = repository_id {
            self.repositories.get_required(repo_id).await?;
        }
        Ok(self
            .repositories
            .add_bot_pattern(repository_id, pattern, pattern_type, is_exclusion)
            .await?)
    }

    /// Create a dataset definition, validating its configured plug-ins
    /// against the capability registries.
    pub async fn create_dataset(
        &self,
        repository_id: i64,
        name: &str,
        config: &DatasetConfig,
    ) -> Result<i64, SubmitError> {
        self.repositories.get_required(repository_id).await?;
        if config.feature_columns.is_empty() {
            return Err(SubmitError::Validation(
                "feature_columns must not be empty".into(),
            ));
        }
        if config.target_column.is_empty() {
            return Err(SubmitError::Validation(
                "target_column must not be empty".into(),
            ));
        }

        for rule in config.cleaning_rules.iter().filter(|r| r.enabled) {
            let row = self
                .registries
                .get(RegistryKind::CleaningRules, &rule.name)
                .await?;
            let implemented = row.map(|r| r.is_implemented).unwrap_or(false);
            if !implemented {
                return Err(SubmitError::Validation(format!(
                    "unsupported cleaning rule '{}'",
                    rule.name
                )));
            }
        }
        if let Some(selection) = &config.feature_selection {
            let row = self
                .registries
                .get(RegistryKind::FeatureSelection, &selection.name)
                .await?;
            if !row.map(|r| r.is_implemented).unwrap_or(false) {
                return Err(SubmitError::Validation(format!(
                    "unsupported feature selection algorithm '{}'",
                    selection.name
                )));
            }
        }

        let row = self.datasets.create(repository_id, name, config).await?;
        Ok(row.id)
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    pub async fn submit_dataset_generation(&self, dataset_id: i64) -> SubmitResult {
        let dataset = self.datasets.get_required(dataset_id).await?;
        match dataset.status() {
            DatasetStatus::Pending => {}
            DatasetStatus::Generating => {
                return Err(SubmitError::Conflict(format!(
                    "dataset {} is already generating",
                    dataset_id
                )))
            }
            other => {
                return Err(SubmitError::Conflict(format!(
                    "dataset {} is {}, not pending",
                    dataset_id, other
                )))
            }
        }

        let job = self
            .jobs
            .create(
                &NewJob::new(JobKind::DatasetGeneration)
                    .with_dataset(dataset_id)
                    .with_repository(dataset.repository_id),
            )
            .await?;
        self.publish(&job).await
    }

    pub async fn ingest_commit(
        &self,
        repository_id: i64,
        commit_hash: &str,
        payload: &serde_json::Value,
        inference_job_id: Option<i64>,
    ) -> SubmitResult {
        self.repositories.get_required(repository_id).await?;
        if commit_hash.trim().is_empty() {
            return Err(SubmitError::Validation("commit_hash must not be empty".into()));
        }

        let mut config = match payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(SubmitError::Validation(
                    "ingestion payload must be an object".into(),
                ))
            }
        };
        config.insert(
            "commit_hash".to_string(),
            serde_json::Value::String(commit_hash.to_string()),
        );

        // Triggered on behalf of an inference job: validate the chain and
        // park the job so it dispatches only after ingestion hands it off.
        if let Some(inference_id) = inference_job_id {
            self.park_chained_inference(inference_id, repository_id, commit_hash)
                .await?;
        }

        self.commits
            .mark_ingestion_pending(repository_id, commit_hash)
            .await?;

        let new_job = NewJob {
            kind: Some(JobKind::CommitIngestion),
            config: serde_json::Value::Object(config),
            repository_id: Some(repository_id),
            inference_job_id,
            ..Default::default()
        };
        let job = self.jobs.create(&new_job).await?;
        self.publish(&job).await
    }

    /// Check a chained inference job matches this ingestion and hold it back
    /// from dispatch until the hand-off.
    async fn park_chained_inference(
        &self,
        inference_id: i64,
        repository_id: i64,
        commit_hash: &str,
    ) -> Result<(), SubmitError> {
        let inference = self.jobs.get_required(inference_id).await?;
        if inference.kind() != Some(JobKind::Inference) {
            return Err(SubmitError::Validation(format!(
                "job {} is a {} job, not an inference job",
                inference_id, inference.kind
            )));
        }
        if inference.status() != JobStatus::Pending {
            return Err(SubmitError::Conflict(format!(
                "inference job {} is {}, not pending",
                inference_id,
                inference.status()
            )));
        }
        let reference = inference.input_reference_json().unwrap_or_default();
        let same_target = reference.get("repo_id").and_then(|v| v.as_i64())
            == Some(repository_id)
            && reference.get("commit_hash").and_then(|v| v.as_str()) == Some(commit_hash);
        if !same_target {
            return Err(SubmitError::Validation(format!(
                "inference job {} targets a different repository or commit",
                inference_id
            )));
        }

        if !self.jobs.park_dispatch(inference_id).await? {
            return Err(SubmitError::Conflict(format!(
                "inference job {} is already queued for dispatch",
                inference_id
            )));
        }
        Ok(())
    }

    pub async fn submit_training(
        &self,
        dataset_id: i64,
        submission: &TrainingSubmission,
    ) -> SubmitResult {
        let dataset = self.ready_dataset(dataset_id).await?;
        self.validate_model_submission(
            &submission.model_type,
            &submission.hyperparameters,
            &submission.feature_columns,
            &submission.target_column,
        )
        .await?;
        if submission.model_name.trim().is_empty() {
            return Err(SubmitError::Validation("model_name must not be empty".into()));
        }

        let config = serde_json::json!({
            "model_name": submission.model_name,
            "model_type": submission.model_type,
            "hyperparameters": submission.hyperparameters,
            "feature_columns": submission.feature_columns,
            "target_column": submission.target_column,
            "random_seed": submission.random_seed.unwrap_or(42),
            "eval_test_split_size": submission.eval_test_split_size,
        });

        let job = self
            .jobs
            .create(
                &NewJob::new(JobKind::Training)
                    .with_dataset(dataset.id)
                    .with_config(config),
            )
            .await?;
        self.publish(&job).await
    }

    pub async fn submit_hp_search(
        &self,
        dataset_id: i64,
        study_name: &str,
        continue_if_exists: bool,
        submission: &HpSearchSubmission,
    ) -> SubmitResult {
        let dataset = self.ready_dataset(dataset_id).await?;
        if study_name.trim().is_empty() {
            return Err(SubmitError::Validation("study_name must not be empty".into()));
        }
        self.model_type_schema(&submission.model_type).await?;
        if submission.hp_space.is_empty() {
            return Err(SubmitError::Validation("hp_space must not be empty".into()));
        }
        for dim in &submission.hp_space {
            dim.validate().map_err(SubmitError::Validation)?;
        }
        if submission.retrain_best && submission.model_name.is_none() {
            return Err(SubmitError::Validation(
                "model_name is required when retrain_best is set".into(),
            ));
        }

        // Study re-use rule: an existing study may only be continued when
        // explicitly requested AND dataset and model type match.
        let existing = self.jobs.find_by_study(study_name).await?;
        if let Some(first) = existing.first() {
            if !continue_if_exists {
                return Err(SubmitError::Conflict(format!(
                    "study '{}' already exists",
                    study_name
                )));
            }
            if first.dataset_id != Some(dataset_id) {
                return Err(SubmitError::Conflict(format!(
                    "study '{}' is attached to a different dataset",
                    study_name
                )));
            }
            let existing_model_type = first
                .config_map()
                .ok()
                .and_then(|c| c.get("model_type").cloned())
                .and_then(|v| v.as_str().map(str::to_string));
            if existing_model_type.as_deref() != Some(submission.model_type.as_str()) {
                return Err(SubmitError::Conflict(format!(
                    "study '{}' uses a different model type",
                    study_name
                )));
            }
            info!("Continuing existing study '{}'", study_name);
        }

        let config = serde_json::json!({
            "model_type": submission.model_type,
            "feature_columns": submission.feature_columns,
            "target_column": submission.target_column,
            "hp_space": submission.hp_space,
            "n_trials": submission.n_trials.unwrap_or(20),
            "objective_metric": submission.objective_metric.as_deref().unwrap_or("f1_weighted"),
            "cv_folds": submission.cv_folds.unwrap_or(3),
            "pruner": submission.pruner.as_deref().unwrap_or("median"),
            "random_seed": submission.random_seed.unwrap_or(42),
            "retrain_best": submission.retrain_best,
            "model_name": submission.model_name,
        });

        let new_job = NewJob {
            kind: Some(JobKind::HpSearch),
            config,
            dataset_id: Some(dataset_id),
            study_name: Some(study_name.to_string()),
            ..Default::default()
        };
        let job = self.jobs.create(&new_job).await?;
        self.publish(&job).await
    }

    pub async fn submit_inference(
        &self,
        model_id: i64,
        input_reference: &serde_json::Value,
    ) -> SubmitResult {
        let model = self.models.get_required(model_id).await?;
        if model.artifact_uri.is_none() {
            // Invariant: a model row without URI is invalid for inference.
            return Err(SubmitError::Conflict(format!(
                "model {} has no artifact",
                model_id
            )));
        }

        let repo_id = input_reference.get("repo_id").and_then(|v| v.as_i64());
        let commit_hash = input_reference.get("commit_hash").and_then(|v| v.as_str());
        let repo_id = match (repo_id, commit_hash) {
            (Some(r), Some(c)) if !c.is_empty() => r,
            _ => {
                return Err(SubmitError::Validation(
                    "input_reference must contain repo_id and commit_hash".into(),
                ))
            }
        };
        self.repositories.get_required(repo_id).await?;

        let new_job = NewJob {
            kind: Some(JobKind::Inference),
            config: serde_json::json!({}),
            model_id: Some(model_id),
            input_reference: Some(input_reference.clone()),
            ..Default::default()
        };
        let job = self.jobs.create(&new_job).await?;
        self.publish(&job).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn ready_dataset(&self, dataset_id: i64) -> Result<codegauge_db::DatasetRow, SubmitError> {
        let dataset = self.datasets.get_required(dataset_id).await?;
        if dataset.status() != DatasetStatus::Ready {
            return Err(SubmitError::Conflict(format!(
                "dataset {} is {}, not ready",
                dataset_id,
                dataset.status()
            )));
        }
        Ok(dataset)
    }

    /// Look up a model type's HP schema in the registry; unknown or
    /// unimplemented types are rejected.
    async fn model_type_schema(
        &self,
        model_type: &str,
    ) -> Result<Vec<HyperparameterSpec>, SubmitError> {
        let row = self
            .registries
            .get(RegistryKind::ModelTypes, model_type)
            .await?
            .filter(|r| r.is_implemented)
            .ok_or_else(|| {
                SubmitError::Validation(format!("unsupported model type '{}'", model_type))
            })?;
        serde_json::from_str(&row.parameter_schema).map_err(|e| {
            SubmitError::Internal(format!(
                "registry schema for '{}' is unreadable: {}",
                model_type, e
            ))
        })
    }

    async fn validate_model_submission(
        &self,
        model_type: &str,
        hyperparameters: &codegauge_protocol::ConfigMap,
        feature_columns: &[String],
        target_column: &str,
    ) -> Result<(), SubmitError> {
        if feature_columns.is_empty() {
            return Err(SubmitError::Validation(
                "feature_columns must not be empty".into(),
            ));
        }
        if target_column.is_empty() {
            return Err(SubmitError::Validation(
                "target_column must not be empty".into(),
            ));
        }

        let schema = self.model_type_schema(model_type).await?;
        let params: BTreeMap<String, serde_json::Value> = hyperparameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        validate_params(&schema, &params)
            .map_err(|e| SubmitError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Publish a pending job to the broker and record its task id. On
    /// publish failure the row is flipped to `failed` best-effort.
    async fn publish(&self, job: &JobRow) -> SubmitResult {
        match self.broker.publish(job.id) {
            Ok(task_id) => {
                self.jobs.set_task_id(job.id, &task_id).await?;
                self.status.on_published(&task_id);
                info!("Job {} published as task {}", job.id, task_id);
                Ok((job.id, task_id))
            }
            Err(e) => {
                let message = format!("Failed to publish job to broker: {}", e);
                error!("Job {}: {}", job.id, message);
                match self
                    .jobs
                    .try_transition(job.id, JobStatus::Pending, JobStatus::Failed, Some(&message))
                    .await
                {
                    Ok(_) => {}
                    Err(db_err) => error!(
                        "CRITICAL: compensation for job {} failed: {}",
                        job.id, db_err
                    ),
                }
                Err(SubmitError::Internal(message))
            }
        }
    }
}
