//! Canonical identifiers, enums and broker payload types.
//!
//! Every crate in the workspace speaks these types; the database layer maps
//! them to TEXT columns via `as_str`/`FromStr`, the broker ships them as JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Canonical job identifier across the system (row id in `cg_jobs`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn to_i64(self) -> Result<i64, JobIdError> {
        i64::try_from(self.0).map_err(|_| JobIdError::Overflow(self.0))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for JobId {
    type Error = JobIdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(JobIdError::Negative(value));
        }
        Ok(JobId::new(value as u64))
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|_| JobIdError::Parse(s.to_string()))?;
        Ok(JobId::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id cannot be negative: {0}")]
    Negative(i64),
    #[error("job id does not fit in i64: {0}")]
    Overflow(u64),
    #[error("invalid job id: {0}")]
    Parse(String),
}

/// Broker task identifier. Opaque string (uuid v4), assigned at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Job kind & status (canonical state machine)
// ============================================================================

/// Every job kind the platform dispatches. One broker queue per kind; a
/// worker's capability list is a subset of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Training,
    HpSearch,
    Inference,
    XaiOrchestration,
    XaiResult,
    CommitIngestion,
    DatasetGeneration,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[
        JobKind::Training,
        JobKind::HpSearch,
        JobKind::Inference,
        JobKind::XaiOrchestration,
        JobKind::XaiResult,
        JobKind::CommitIngestion,
        JobKind::DatasetGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Training => "training",
            JobKind::HpSearch => "hp_search",
            JobKind::Inference => "inference",
            JobKind::XaiOrchestration => "xai_orchestration",
            JobKind::XaiResult => "xai_result",
            JobKind::CommitIngestion => "commit_ingestion",
            JobKind::DatasetGeneration => "dataset_generation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobKind::Training),
            "hp_search" => Ok(JobKind::HpSearch),
            "inference" => Ok(JobKind::Inference),
            "xai_orchestration" => Ok(JobKind::XaiOrchestration),
            "xai_result" => Ok(JobKind::XaiResult),
            "commit_ingestion" => Ok(JobKind::CommitIngestion),
            "dataset_generation" => Ok(JobKind::DatasetGeneration),
            _ => Err(format!("Invalid job kind: '{}'", s)),
        }
    }
}

/// Job lifecycle status. Transitions are monotonic; the only legal paths are
/// prefixes of `pending -> running -> {success|failed|revoked}` plus the
/// direct `pending -> failed` compensation used when a publish fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Revoked,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Revoked
        )
    }

    /// Table-driven transition checker. Every CAS path consults this before
    /// touching the database, so an illegal edge can never reach a row.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Revoked)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Revoked)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "revoked" => Ok(JobStatus::Revoked),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

// ============================================================================
// Secondary state machines
// ============================================================================

/// Dataset lifecycle. `Ready` requires a recorded storage URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    #[default]
    Pending,
    Generating,
    Ready,
    Failed,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Pending => "pending",
            DatasetStatus::Generating => "generating",
            DatasetStatus::Ready => "ready",
            DatasetStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DatasetStatus::Ready | DatasetStatus::Failed)
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DatasetStatus::Pending),
            "generating" => Ok(DatasetStatus::Generating),
            "ready" => Ok(DatasetStatus::Ready),
            "failed" => Ok(DatasetStatus::Failed),
            _ => Err(format!("Invalid dataset status: '{}'", s)),
        }
    }
}

/// Commit ingestion sub-state, tracked on `cg_commit_details`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    #[default]
    NotIngested,
    Pending,
    Running,
    Complete,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::NotIngested => "not_ingested",
            IngestionStatus::Pending => "pending",
            IngestionStatus::Running => "running",
            IngestionStatus::Complete => "complete",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_ingested" => Ok(IngestionStatus::NotIngested),
            "pending" => Ok(IngestionStatus::Pending),
            "running" => Ok(IngestionStatus::Running),
            "complete" => Ok(IngestionStatus::Complete),
            "failed" => Ok(IngestionStatus::Failed),
            _ => Err(format!("Invalid ingestion status: '{}'", s)),
        }
    }
}

/// Explanation families produced by the fan-out after a successful inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XaiType {
    Shap,
    Lime,
    FeatureImportance,
    Counterfactuals,
    DecisionPath,
}

impl XaiType {
    pub const ALL: &'static [XaiType] = &[
        XaiType::Shap,
        XaiType::Lime,
        XaiType::FeatureImportance,
        XaiType::Counterfactuals,
        XaiType::DecisionPath,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            XaiType::Shap => "shap",
            XaiType::Lime => "lime",
            XaiType::FeatureImportance => "feature_importance",
            XaiType::Counterfactuals => "counterfactuals",
            XaiType::DecisionPath => "decision_path",
        }
    }
}

impl fmt::Display for XaiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for XaiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shap" => Ok(XaiType::Shap),
            "lime" => Ok(XaiType::Lime),
            "feature_importance" => Ok(XaiType::FeatureImportance),
            "counterfactuals" => Ok(XaiType::Counterfactuals),
            "decision_path" => Ok(XaiType::DecisionPath),
            _ => Err(format!("Invalid XAI type: '{}'", s)),
        }
    }
}

// ============================================================================
// Wire-observable task state
// ============================================================================

/// Broker task state as seen by the status channel. This is what callers of
/// the task endpoint observe; it is never the source of truth for job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Received,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Received => "received",
            TaskState::Started => "started",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
            TaskState::Retry => "retry",
            TaskState::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Broker payloads
// ============================================================================

/// Worker -> Control: handshake listing the job kinds this worker handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub worker_id: String,
    pub capabilities: Vec<JobKind>,
}

/// Control -> Worker: run this job. The job id is the only business datum;
/// the handler reloads everything else from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub job_id: JobId,
    pub kind: JobKind,
    pub task_id: TaskId,
}

/// Control -> Worker: revoke the task. `terminate` asks for a hard stop of
/// the in-flight handler rather than a boundary-checked wind-down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortCommand {
    pub task_id: TaskId,
    #[serde(default)]
    pub terminate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Worker -> Control: progress event for the status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub task_id: TaskId,
    pub state: TaskState,
    pub progress: u8,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Worker -> Control: terminal receipt for a dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReceipt {
    pub task_id: TaskId,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobReceipt {
    pub fn success(task_id: TaskId, result: Option<serde_json::Value>) -> Self {
        Self {
            task_id,
            status: TaskState::Success,
            error_message: None,
            result,
        }
    }

    pub fn failure(task_id: TaskId, error: impl fmt::Display) -> Self {
        Self {
            task_id,
            status: TaskState::Failure,
            error_message: Some(truncate_error(&error.to_string())),
            result: None,
        }
    }

    pub fn revoked(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskState::Revoked,
            error_message: None,
            result: None,
        }
    }
}

/// Worker -> Control: keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
}

/// Bidirectional error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Capability descriptor pushed into a registry table at worker startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// Parameter schema, serialized `Vec<HyperparameterSpec>`.
    pub parameter_schema: serde_json::Value,
}

/// Maximum length of an error string carried on a receipt or job row.
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate an error message to the wire limit, preserving a whole prefix.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Render an error as `Type: message`, truncated to the wire limit.
pub fn format_error(kind: &str, error: &dyn fmt::Display) -> String {
    truncate_error(&format!("{}: {}", kind, error))
}

/// Free-form config bag, kind-specific. Kept ordered so serialized configs
/// are stable across round-trips.
pub type ConfigMap = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Revoked));

        // No backward or lateral edges
        assert!(!Running.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Running));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Revoked.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
    }

    #[test]
    fn test_every_path_is_prefix_of_legal_machine() {
        // Exhaustively walk the table: any reachable sequence ends terminal
        // or at running, never revisits a terminal state.
        for start in JobStatus::ALL {
            for next in JobStatus::ALL {
                if start.is_terminal() {
                    assert!(!start.can_transition_to(*next));
                }
            }
        }
    }

    #[test]
    fn test_job_kind_roundtrip() {
        for kind in JobKind::ALL {
            let parsed: JobKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
        assert!("nope".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobKind::DatasetGeneration).unwrap(),
            "\"dataset_generation\""
        );
        assert_eq!(
            serde_json::to_string(&XaiType::FeatureImportance).unwrap(),
            "\"feature_importance\""
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Failure).unwrap(),
            "\"failure\""
        );
    }

    #[test]
    fn test_truncate_error() {
        let short = "ValueError: bad input";
        assert_eq!(truncate_error(short), short);

        let long = "x".repeat(900);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_receipt_failure_truncates() {
        let err = "e".repeat(1000);
        let receipt = JobReceipt::failure(TaskId::from("t-1"), err);
        assert_eq!(receipt.status, TaskState::Failure);
        assert_eq!(receipt.error_message.unwrap().len(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_dispatch_command_roundtrip() {
        let cmd = DispatchCommand {
            job_id: JobId::new(7),
            kind: JobKind::Training,
            task_id: TaskId::from("abc"),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: DispatchCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.job_id, JobId::new(7));
        assert_eq!(parsed.kind, JobKind::Training);
        assert_eq!(parsed.task_id.as_str(), "abc");
    }
}
