//! Job handlers.
//!
//! Every dispatched job runs through the same template: load the row and
//! CAS it to `running` (adopting re-deliveries), run the kind's handler,
//! then commit exactly one terminal transition. The broker receipt mirrors
//! the DB outcome; the DB row is always authoritative.

pub mod dataset_generation;
pub mod hp_search;
pub mod inference;
pub mod ingestion;
pub mod training;
pub mod xai_orchestration;
pub mod xai_worker;

use std::sync::Arc;

use codegauge_db::{DbError, JobRow, NewJob, TerminalResults};
use codegauge_ml::MlError;
use codegauge_pipeline::{CancellationToken, Dependencies, PipelineError, ProgressSink};
use codegauge_protocol::{
    format_error, truncate_error, DispatchCommand, JobKind, JobReceipt, JobStatus, TaskId,
    TaskState,
};
use tracing::{error, info, warn};

/// Successful handler outcome: the terminal message plus the structured
/// results written in the same CAS.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub message: String,
    pub results: TerminalResults,
    /// Payload echoed on the broker receipt.
    pub receipt_result: Option<serde_json::Value>,
}

impl HandlerOutcome {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Failed handler outcome, labeled with the abstract error kind and carrying
/// any structured results that must still land on the row (e.g. an empty
/// prediction package).
#[derive(Debug)]
pub struct HandlerFailure {
    pub label: &'static str,
    pub message: String,
    pub results: TerminalResults,
    pub cancelled: bool,
}

impl HandlerFailure {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            label: "ValidationError",
            message: message.into(),
            results: TerminalResults::default(),
            cancelled: false,
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self {
            label: "DependencyError",
            message: message.into(),
            results: TerminalResults::default(),
            cancelled: false,
        }
    }

    fn db_message(&self) -> String {
        truncate_error(&format!("{}: {}", self.label, self.message))
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.label, self.message)
    }
}

impl From<PipelineError> for HandlerFailure {
    fn from(e: PipelineError) -> Self {
        let (label, cancelled) = match &e {
            PipelineError::Cancelled => ("CancellationError", true),
            PipelineError::Validation(_) | PipelineError::Serialization(_) => {
                ("ValidationError", false)
            }
            PipelineError::Db(DbError::NotFound(_)) | PipelineError::Db(DbError::Constraint(_)) => {
                ("DependencyError", false)
            }
            PipelineError::Db(_) => ("TransientError", false),
            PipelineError::Store(_) => ("ArtifactError", false),
            PipelineError::Step { .. } | PipelineError::Frame(_) | PipelineError::Arrow(_) => {
                ("PipelineStepError", false)
            }
        };
        Self {
            label,
            message: e.to_string(),
            results: TerminalResults::default(),
            cancelled,
        }
    }
}

impl From<DbError> for HandlerFailure {
    fn from(e: DbError) -> Self {
        HandlerFailure::from(PipelineError::Db(e))
    }
}

impl From<codegauge_store::StoreError> for HandlerFailure {
    fn from(e: codegauge_store::StoreError) -> Self {
        HandlerFailure::from(PipelineError::Store(e))
    }
}

impl From<MlError> for HandlerFailure {
    fn from(e: MlError) -> Self {
        let label = match &e {
            MlError::Artifact(_) => "ArtifactError",
            MlError::NotFitted => "DependencyError",
            _ => "ValidationError",
        };
        Self {
            label,
            message: e.to_string(),
            results: TerminalResults::default(),
            cancelled: false,
        }
    }
}

impl From<serde_json::Error> for HandlerFailure {
    fn from(e: serde_json::Error) -> Self {
        HandlerFailure::validation(format!("invalid config: {}", e))
    }
}

pub type HandlerResult = std::result::Result<HandlerOutcome, HandlerFailure>;

/// Run one dispatched job end to end and produce the broker receipt.
pub async fn run_dispatched_job(
    cmd: &DispatchCommand,
    deps: &Dependencies,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> JobReceipt {
    let task_id = cmd.task_id.clone();
    match drive(cmd, deps, progress, cancel).await {
        Ok(receipt) => receipt,
        Err(e) => {
            error!("Job {} driver error: {}", cmd.job_id, e);
            JobReceipt::failure(task_id, e)
        }
    }
}

async fn drive(
    cmd: &DispatchCommand,
    deps: &Dependencies,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> Result<JobReceipt, HandlerFailure> {
    let job_id = cmd
        .job_id
        .to_i64()
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;

    let Some(job) = deps.jobs.get(job_id).await? else {
        // Deleted between dispatch and execution; nothing to transition.
        warn!("Job {} not found in database, ignoring dispatch", job_id);
        return Ok(JobReceipt::failure(
            cmd.task_id.clone(),
            format!("job {} not found", job_id),
        ));
    };

    // Terminal rows are never touched again: at most one successful
    // terminal transition per job.
    let status = job.status();
    if status.is_terminal() {
        info!("Job {} already terminal ({}), ignoring dispatch", job_id, status);
        return Ok(terminal_receipt(&cmd.task_id, &job));
    }

    let job = claim_job(job, cmd, deps).await?;

    progress.report(0, "Starting", Some("Job claimed"));
    let result = dispatch_by_kind(&job, deps, &progress, &cancel).await;

    match result {
        Ok(outcome) => {
            let committed = deps
                .jobs
                .complete(job_id, JobStatus::Success, &outcome.message, &outcome.results)
                .await?;
            if !committed {
                // Lost the terminal race; report whatever won.
                let row = deps.jobs.get_required(job_id).await?;
                warn!(
                    "Job {} terminal CAS lost, row is {}",
                    job_id,
                    row.status()
                );
                return Ok(terminal_receipt(&cmd.task_id, &row));
            }

            emit_downstream(&job, deps).await;
            progress.report(100, "Completed", Some(&outcome.message));
            Ok(JobReceipt::success(cmd.task_id.clone(), outcome.receipt_result))
        }
        Err(failure) if failure.cancelled => {
            let committed = deps
                .jobs
                .complete(
                    job_id,
                    JobStatus::Revoked,
                    "Job revoked by request",
                    &failure.results,
                )
                .await?;
            if !committed {
                let row = deps.jobs.get_required(job_id).await?;
                return Ok(terminal_receipt(&cmd.task_id, &row));
            }
            info!("Job {} revoked", job_id);
            Ok(JobReceipt::revoked(cmd.task_id.clone()))
        }
        Err(failure) => {
            let message = failure.db_message();
            let committed = deps
                .jobs
                .complete(job_id, JobStatus::Failed, &message, &failure.results)
                .await?;
            if !committed {
                let row = deps.jobs.get_required(job_id).await?;
                return Ok(terminal_receipt(&cmd.task_id, &row));
            }
            error!("Job {} failed: {}", job_id, message);
            Ok(JobReceipt::failure(cmd.task_id.clone(), &message))
        }
    }
}

/// Move the row to `running` under our task id, or adopt a row already
/// running under a stale task id.
async fn claim_job(
    job: JobRow,
    cmd: &DispatchCommand,
    deps: &Dependencies,
) -> Result<JobRow, HandlerFailure> {
    let job_id = job.id;
    match job.status() {
        JobStatus::Running => {
            if job.broker_task_id.as_deref() != Some(cmd.task_id.as_str()) {
                warn!(
                    "Job {} already running under task {:?}; adopting task {}",
                    job_id, job.broker_task_id, cmd.task_id
                );
                deps.jobs.adopt_task(job_id, &cmd.task_id).await?;
            }
            Ok(deps.jobs.get_required(job_id).await?)
        }
        JobStatus::Pending => {
            let claimed = deps.jobs.mark_running(job_id, &cmd.task_id).await?;
            if !claimed {
                // Someone else transitioned first: reload and re-decide once.
                let row = deps.jobs.get_required(job_id).await?;
                if row.status() == JobStatus::Running {
                    deps.jobs.adopt_task(job_id, &cmd.task_id).await?;
                    return Ok(deps.jobs.get_required(job_id).await?);
                }
                return Err(HandlerFailure::dependency(format!(
                    "job {} moved to {} before this worker could claim it",
                    job_id,
                    row.status()
                )));
            }
            Ok(deps.jobs.get_required(job_id).await?)
        }
        other => Err(HandlerFailure::dependency(format!(
            "job {} is {}, not claimable",
            job_id, other
        ))),
    }
}

async fn dispatch_by_kind(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let Some(kind) = job.kind() else {
        return Err(HandlerFailure::validation(format!(
            "job {} has unknown kind '{}'",
            job.id, job.kind
        )));
    };

    match kind {
        JobKind::Training => training::run(job, deps, progress, cancel).await,
        JobKind::HpSearch => hp_search::run(job, deps, progress, cancel).await,
        JobKind::Inference => inference::run(job, deps, progress, cancel).await,
        JobKind::XaiOrchestration => xai_orchestration::run(job, deps, progress, cancel).await,
        JobKind::XaiResult => xai_worker::run(job, deps, progress, cancel).await,
        JobKind::CommitIngestion => ingestion::run(job, deps, progress, cancel).await,
        JobKind::DatasetGeneration => dataset_generation::run(job, deps, progress, cancel).await,
    }
}

/// After a successful inference, enqueue the explanation-orchestration job.
/// The submission happens-after the terminal CAS, so its handler observes a
/// terminal upstream row.
async fn emit_downstream(job: &JobRow, deps: &Dependencies) {
    if job.kind() != Some(JobKind::Inference) {
        return;
    }

    let new_job = NewJob::new(JobKind::XaiOrchestration)
        .with_config(serde_json::json!({ "inference_job_id": job.id }));
    match deps.jobs.create(&new_job).await {
        Ok(row) => {
            let task_id = TaskId::generate();
            if let Err(e) = deps.jobs.set_task_id(row.id, &task_id).await {
                warn!(
                    "Failed to record task id for explanation orchestration job {}: {}",
                    row.id, e
                );
            }
            info!(
                "Enqueued explanation orchestration job {} for inference {}",
                row.id, job.id
            );
        }
        Err(e) => {
            // The inference result stands; fan-out can be resubmitted.
            error!(
                "Failed to enqueue explanation orchestration for inference {}: {}",
                job.id, e
            );
        }
    }
}

fn terminal_receipt(task_id: &TaskId, job: &JobRow) -> JobReceipt {
    match job.status() {
        JobStatus::Success => JobReceipt {
            task_id: task_id.clone(),
            status: TaskState::Success,
            error_message: None,
            result: None,
        },
        JobStatus::Revoked => JobReceipt::revoked(task_id.clone()),
        _ => JobReceipt::failure(
            task_id.clone(),
            job.status_message.as_deref().unwrap_or("job failed"),
        ),
    }
}

/// Map a raw error into the terminal failure message format used on rows.
pub(crate) fn artifact_failure(context: &str, e: impl std::fmt::Display) -> HandlerFailure {
    HandlerFailure {
        label: "ArtifactError",
        message: format_error(context, &e),
        results: TerminalResults::default(),
        cancelled: false,
    }
}
