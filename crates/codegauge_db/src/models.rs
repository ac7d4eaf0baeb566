//! Database models.
//!
//! Rows keep status/kind columns as TEXT and expose typed accessors that
//! parse into the canonical protocol enums; writes always go through
//! `as_str()` so the database never sees a value outside the enum set.

use chrono::{DateTime, Utc};
use codegauge_protocol::{
    ConfigMap, DatasetStatus, IngestionStatus, JobKind, JobStatus, PredictionPackage, XaiType,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub git_url: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Bot-pattern matching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotPatternType {
    Exact,
    Wildcard,
    Regex,
}

impl BotPatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotPatternType::Exact => "exact",
            BotPatternType::Wildcard => "wildcard",
            BotPatternType::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(BotPatternType::Exact),
            "wildcard" => Some(BotPatternType::Wildcard),
            "regex" => Some(BotPatternType::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BotPatternRow {
    pub id: i64,
    pub repository_id: Option<i64>,
    pub pattern: String,
    pub pattern_type: String,
    pub is_exclusion: bool,
}

impl BotPatternRow {
    pub fn pattern_type(&self) -> Option<BotPatternType> {
        BotPatternType::parse(&self.pattern_type)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DatasetRow {
    pub id: i64,
    pub repository_id: i64,
    pub name: String,
    pub status: String,
    pub status_message: Option<String>,
    pub storage_uri: Option<String>,
    pub background_sample_uri: Option<String>,
    pub num_rows: Option<i64>,
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetRow {
    pub fn status(&self) -> DatasetStatus {
        self.status.parse().unwrap_or(DatasetStatus::Pending)
    }

    pub fn config(&self) -> Result<DatasetConfig, serde_json::Error> {
        serde_json::from_str(&self.config)
    }
}

/// Dataset generation configuration, stored as JSON on the dataset row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatasetConfig {
    pub feature_columns: Vec<String>,
    pub target_column: String,
    #[serde(default)]
    pub cleaning_rules: Vec<CleaningRuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_selection: Option<FeatureSelectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningRuleConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: ConfigMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSelectionConfig {
    pub name: String,
    #[serde(default)]
    pub params: ConfigMap,
}

#[derive(Debug, Clone, FromRow)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub model_type: String,
    pub artifact_uri: Option<String>,
    pub dataset_id: Option<i64>,
    pub training_job_id: Option<i64>,
    pub hp_search_job_id: Option<i64>,
    pub hyperparameters: String,
    pub performance_metrics: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRow {
    pub fn hyperparameters(&self) -> Result<ConfigMap, serde_json::Error> {
        serde_json::from_str(&self.hyperparameters)
    }

    pub fn performance_metrics(&self) -> Result<ConfigMap, serde_json::Error> {
        serde_json::from_str(&self.performance_metrics)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub status_message: Option<String>,
    pub broker_task_id: Option<String>,
    pub config: String,
    pub dataset_id: Option<i64>,
    pub model_id: Option<i64>,
    pub input_reference: Option<String>,
    pub prediction_result: Option<String>,
    pub study_name: Option<String>,
    pub best_trial_id: Option<i64>,
    pub best_params: Option<String>,
    pub best_value: Option<f64>,
    pub inference_job_id: Option<i64>,
    pub repository_id: Option<i64>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn kind(&self) -> Option<JobKind> {
        self.kind.parse().ok()
    }

    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Pending)
    }

    pub fn config_map(&self) -> Result<ConfigMap, serde_json::Error> {
        serde_json::from_str(&self.config)
    }

    pub fn input_reference_json(&self) -> Option<serde_json::Value> {
        self.input_reference
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn prediction(&self) -> Option<PredictionPackage> {
        self.prediction_result
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct XaiResultRow {
    pub id: i64,
    pub inference_job_id: i64,
    pub xai_type: String,
    pub status: String,
    pub status_message: Option<String>,
    pub broker_task_id: Option<String>,
    pub result: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl XaiResultRow {
    pub fn xai_type(&self) -> Option<XaiType> {
        self.xai_type.parse().ok()
    }

    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Pending)
    }

    pub fn result_json(&self) -> Option<serde_json::Value> {
        self.result
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommitMetricRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_hash: String,
    pub parent_hashes: Option<String>,
    pub author_name: Option<String>,
    pub author_date_ts: Option<i64>,
    pub is_merge: bool,
    pub files_churned: Option<i64>,
    pub la: Option<f64>,
    pub ld: Option<f64>,
    pub ns: Option<f64>,
    pub nd: Option<f64>,
    pub nf: Option<f64>,
    pub entropy: Option<f64>,
    pub ndev: Option<f64>,
    pub age: Option<f64>,
    pub nuc: Option<f64>,
    pub exp: Option<f64>,
    pub rexp: Option<f64>,
    pub sexp: Option<f64>,
    pub is_buggy: Option<bool>,
}

impl CommitMetricRow {
    /// First parent hash, if any. Parent hashes are space separated.
    pub fn first_parent(&self) -> Option<&str> {
        self.parent_hashes
            .as_deref()
            .and_then(|p| p.split_whitespace().next())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CkMetricRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_hash: String,
    pub file_path: String,
    pub class_name: String,
    pub cbo: Option<f64>,
    pub wmc: Option<f64>,
    pub dit: Option<f64>,
    pub rfc: Option<f64>,
    pub lcom: Option<f64>,
    pub loc: Option<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CommitDetailRow {
    pub id: i64,
    pub repository_id: i64,
    pub commit_hash: String,
    pub message: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    pub ingestion_status: String,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommitDetailRow {
    pub fn ingestion_status(&self) -> IngestionStatus {
        self.ingestion_status
            .parse()
            .unwrap_or(IngestionStatus::NotIngested)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileDiffRow {
    pub id: i64,
    pub commit_detail_id: i64,
    pub file_path: String,
    pub change_type: Option<String>,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub diff_text: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CapabilityRow {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub parameter_schema: String,
    pub is_implemented: bool,
    pub last_updated_by: String,
    pub updated_at: DateTime<Utc>,
}
