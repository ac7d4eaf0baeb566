//! Control API envelopes.
//!
//! The control plane serves a REP socket speaking JSON-encoded
//! `ControlRequest`/`ControlResponse`. The HTTP adapter (out of scope here)
//! maps routes onto these envelopes one-to-one and translates `ErrorCode`
//! into status codes: Validation -> 400, NotFound -> 404, Conflict -> 409,
//! Internal -> 500.

use codegauge_db::{DatasetConfig, JobRow, ModelRow, XaiResultRow};
use codegauge_protocol::{ConfigMap, SearchSpaceParam, TaskId, TaskState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlRequest {
    /// Ping/health check
    Ping,

    // --- Entity management ---
    CreateRepository {
        git_url: String,
    },
    AddBotPattern {
        repository_id: Option<i64>,
        pattern: String,
        pattern_type: String,
        is_exclusion: bool,
    },
    CreateDataset {
        repository_id: i64,
        name: String,
        config: DatasetConfig,
    },

    // --- Submissions ---
    SubmitDatasetGeneration {
        dataset_id: i64,
    },
    IngestCommit {
        repository_id: i64,
        commit_hash: String,
        /// Pre-extracted analysis payload (see the ingestion handler).
        payload: serde_json::Value,
        /// Pending inference job this ingestion was triggered on behalf of;
        /// it is held back and handed off once ingestion completes.
        #[serde(default)]
        inference_job_id: Option<i64>,
    },
    SubmitTraining {
        dataset_id: i64,
        config: TrainingSubmission,
    },
    SubmitHpSearch {
        dataset_id: i64,
        study_name: String,
        #[serde(default)]
        continue_if_exists: bool,
        config: HpSearchSubmission,
    },
    SubmitInference {
        model_id: i64,
        input_reference: serde_json::Value,
    },

    // --- Reads ---
    GetJob {
        job_id: i64,
    },
    GetModel {
        model_id: i64,
    },
    GetCommit {
        repository_id: i64,
        commit_hash: String,
    },
    GetXaiResults {
        inference_job_id: i64,
    },
    GetXaiResult {
        id: i64,
    },
    GetTask {
        task_id: TaskId,
    },

    // --- Control ---
    Revoke {
        task_id: TaskId,
        #[serde(default)]
        terminate: bool,
        #[serde(default)]
        signal: Option<String>,
    },

    // --- Aggregations & registries ---
    Dashboard,
    ListCleaningRules,
    ListFeatureSelectionAlgorithms,
    ListModelTypes,
}

/// Training submission body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSubmission {
    pub model_name: String,
    pub model_type: String,
    #[serde(default)]
    pub hyperparameters: ConfigMap,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub eval_test_split_size: Option<f64>,
}

/// HP-search submission body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpSearchSubmission {
    pub model_type: String,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    pub hp_space: Vec<SearchSpaceParam>,
    #[serde(default)]
    pub n_trials: Option<usize>,
    #[serde(default)]
    pub objective_metric: Option<String>,
    #[serde(default)]
    pub cv_folds: Option<usize>,
    #[serde(default)]
    pub pruner: Option<String>,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub retrain_best: bool,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlResponse {
    Pong,
    Ack,
    RepositoryCreated {
        id: i64,
        name: String,
    },
    BotPatternAdded {
        id: i64,
    },
    DatasetCreated {
        id: i64,
    },
    /// Submission accepted: the pair every submit returns.
    JobSubmitted {
        job_id: i64,
        task_id: TaskId,
    },
    Job(Box<JobView>),
    Model(Box<ModelView>),
    Commit(CommitView),
    XaiResults(Vec<XaiResultView>),
    XaiResult(Box<XaiResultView>),
    Task(TaskStatusView),
    RevokeAccepted,
    Dashboard(DashboardView),
    Registry(Vec<CapabilityView>),
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ControlResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub status_message: Option<String>,
    pub broker_task_id: Option<String>,
    pub config: serde_json::Value,
    pub dataset_id: Option<i64>,
    pub model_id: Option<i64>,
    pub input_reference: Option<serde_json::Value>,
    pub prediction_result: Option<serde_json::Value>,
    pub study_name: Option<String>,
    pub best_trial_id: Option<i64>,
    pub best_params: Option<serde_json::Value>,
    pub best_value: Option<f64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    /// Nested model record, populated when the job has one and is complete.
    pub model: Option<ModelView>,
}

impl JobView {
    pub fn from_row(row: &JobRow, model: Option<ModelView>) -> Self {
        Self {
            id: row.id,
            kind: row.kind.clone(),
            status: row.status.clone(),
            status_message: row.status_message.clone(),
            broker_task_id: row.broker_task_id.clone(),
            config: serde_json::from_str(&row.config).unwrap_or(serde_json::Value::Null),
            dataset_id: row.dataset_id,
            model_id: row.model_id,
            input_reference: row.input_reference_json(),
            prediction_result: row
                .prediction_result
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            study_name: row.study_name.clone(),
            best_trial_id: row.best_trial_id,
            best_params: row
                .best_params
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            best_value: row.best_value,
            started_at: row.started_at.map(|t| t.to_rfc3339()),
            completed_at: row.completed_at.map(|t| t.to_rfc3339()),
            created_at: row.created_at.to_rfc3339(),
            model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelView {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub model_type: String,
    pub artifact_uri: Option<String>,
    pub dataset_id: Option<i64>,
    pub hyperparameters: serde_json::Value,
    pub performance_metrics: serde_json::Value,
}

impl ModelView {
    pub fn from_row(row: &ModelRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            version: row.version,
            model_type: row.model_type.clone(),
            artifact_uri: row.artifact_uri.clone(),
            dataset_id: row.dataset_id,
            hyperparameters: serde_json::from_str(&row.hyperparameters)
                .unwrap_or(serde_json::Value::Null),
            performance_metrics: serde_json::from_str(&row.performance_metrics)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitView {
    pub repository_id: i64,
    pub commit_hash: String,
    pub ingestion_status: String,
    pub status_message: Option<String>,
    pub message: Option<String>,
    pub author_name: Option<String>,
    pub file_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XaiResultView {
    pub id: i64,
    pub inference_job_id: i64,
    pub xai_type: String,
    pub status: String,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl XaiResultView {
    pub fn from_row(row: &XaiResultRow) -> Self {
        Self {
            id: row.id,
            inference_job_id: row.inference_job_id,
            xai_type: row.xai_type.clone(),
            status: row.status.clone(),
            status_message: row.status_message.clone(),
            result: row.result_json(),
        }
    }
}

/// Wire-observable task status, merged from the broker status channel over
/// the authoritative job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskState,
    pub progress: u8,
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardView {
    pub jobs_by_status: Vec<(String, i64)>,
    pub datasets_by_status: Vec<(String, i64)>,
    pub model_count: i64,
    pub recent_jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityView {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub parameter_schema: serde_json::Value,
    pub last_updated_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = ControlRequest::SubmitInference {
            model_id: 3,
            input_reference: serde_json::json!({"repo_id": 1, "commit_hash": "abc"}),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("SubmitInference"));
        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlRequest::SubmitInference { model_id, .. } => assert_eq!(model_id, 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_error_response() {
        let resp = ControlResponse::error(ErrorCode::Conflict, "study exists");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("conflict"));
        assert!(json.contains("study exists"));
    }

    #[test]
    fn test_submission_defaults() {
        let json = r#"{
            "model_type": "random_forest",
            "feature_columns": ["la"],
            "target_column": "is_buggy",
            "hp_space": [{"param_name": "max_depth", "suggest_type": "int", "low": 2, "high": 8}]
        }"#;
        let parsed: HpSearchSubmission = serde_json::from_str(json).unwrap();
        assert!(!parsed.retrain_best);
        assert!(parsed.n_trials.is_none());
    }
}
