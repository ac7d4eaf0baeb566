//! Control API request handling.
//!
//! Pure mapping from [`ControlRequest`] to [`ControlResponse`] over the
//! submission service, the task status store and the broker handle. The
//! HTTP adapter in front of this is a thin serializer.

use codegauge_db::RegistryKind;
use codegauge_protocol::{JobStatus, TaskId, TaskState};
use tracing::warn;

use crate::api::{
    CapabilityView, CommitView, ControlRequest, ControlResponse, ErrorCode, JobView, ModelView,
    TaskStatusView, XaiResultView,
};
use crate::broker::BrokerHandle;
use crate::dashboard::build_dashboard;
use crate::status::TaskStatusStore;
use crate::submit::{SubmissionService, SubmitError};

impl From<SubmitError> for ControlResponse {
    fn from(e: SubmitError) -> Self {
        let code = match &e {
            SubmitError::Validation(_) => ErrorCode::Validation,
            SubmitError::NotFound(_) => ErrorCode::NotFound,
            SubmitError::Conflict(_) => ErrorCode::Conflict,
            SubmitError::Internal(_) => ErrorCode::Internal,
        };
        ControlResponse::error(code, e.to_string())
    }
}

pub async fn handle_request(
    service: &SubmissionService,
    status: &TaskStatusStore,
    broker: &BrokerHandle,
    request: ControlRequest,
) -> ControlResponse {
    match dispatch(service, status, broker, request).await {
        Ok(response) => response,
        Err(e) => e.into(),
    }
}

async fn dispatch(
    service: &SubmissionService,
    status: &TaskStatusStore,
    broker: &BrokerHandle,
    request: ControlRequest,
) -> Result<ControlResponse, SubmitError> {
    match request {
        ControlRequest::Ping => Ok(ControlResponse::Pong),

        ControlRequest::CreateRepository { git_url } => {
            let (id, name) = service.create_repository(&git_url).await?;
            Ok(ControlResponse::RepositoryCreated { id, name })
        }
        ControlRequest::AddBotPattern {
            repository_id,
            pattern,
            pattern_type,
            is_exclusion,
        } => {
            let id = service
                .add_bot_pattern(repository_id, &pattern, &pattern_type, is_exclusion)
                .await?;
            Ok(ControlResponse::BotPatternAdded { id })
        }
        ControlRequest::CreateDataset {
            repository_id,
            name,
            config,
        } => {
            let id = service.create_dataset(repository_id, &name, &config).await?;
            Ok(ControlResponse::DatasetCreated { id })
        }

        ControlRequest::SubmitDatasetGeneration { dataset_id } => {
            let (job_id, task_id) = service.submit_dataset_generation(dataset_id).await?;
            Ok(ControlResponse::JobSubmitted { job_id, task_id })
        }
        ControlRequest::IngestCommit {
            repository_id,
            commit_hash,
            payload,
            inference_job_id,
        } => {
            let (job_id, task_id) = service
                .ingest_commit(repository_id, &commit_hash, &payload, inference_job_id)
                .await?;
            Ok(ControlResponse::JobSubmitted { job_id, task_id })
        }
        ControlRequest::SubmitTraining { dataset_id, config } => {
            let (job_id, task_id) = service.submit_training(dataset_id, &config).await?;
            Ok(ControlResponse::JobSubmitted { job_id, task_id })
        }
        ControlRequest::SubmitHpSearch {
            dataset_id,
            study_name,
            continue_if_exists,
            config,
        } => {
            let (job_id, task_id) = service
                .submit_hp_search(dataset_id, &study_name, continue_if_exists, &config)
                .await?;
            Ok(ControlResponse::JobSubmitted { job_id, task_id })
        }
        ControlRequest::SubmitInference {
            model_id,
            input_reference,
        } => {
            let (job_id, task_id) = service
                .submit_inference(model_id, &input_reference)
                .await?;
            Ok(ControlResponse::JobSubmitted { job_id, task_id })
        }

        ControlRequest::GetJob { job_id } => {
            let job = service.jobs.get_required(job_id).await?;
            let model = match (job.model_id, job.status() == JobStatus::Success) {
                (Some(model_id), true) => service
                    .models
                    .get(model_id)
                    .await?
                    .as_ref()
                    .map(ModelView::from_row),
                _ => None,
            };
            Ok(ControlResponse::Job(Box::new(JobView::from_row(&job, model))))
        }
        ControlRequest::GetModel { model_id } => {
            let model = service.models.get_required(model_id).await?;
            Ok(ControlResponse::Model(Box::new(ModelView::from_row(&model))))
        }
        ControlRequest::GetCommit {
            repository_id,
            commit_hash,
        } => {
            let Some(detail) = service.commits.get(repository_id, &commit_hash).await? else {
                return Ok(ControlResponse::Commit(CommitView {
                    repository_id,
                    commit_hash,
                    ingestion_status: "not_ingested".to_string(),
                    status_message: None,
                    message: None,
                    author_name: None,
                    file_count: 0,
                }));
            };
            let diffs = service.commits.diffs_for(detail.id).await?;
            Ok(ControlResponse::Commit(CommitView {
                repository_id,
                commit_hash: detail.commit_hash,
                ingestion_status: detail.ingestion_status,
                status_message: detail.status_message,
                message: detail.message,
                author_name: detail.author_name,
                file_count: diffs.len(),
            }))
        }
        ControlRequest::GetXaiResults { inference_job_id } => {
            service.jobs.get_required(inference_job_id).await?;
            let rows = service.xai.list_for_inference(inference_job_id).await?;
            Ok(ControlResponse::XaiResults(
                rows.iter().map(XaiResultView::from_row).collect(),
            ))
        }
        ControlRequest::GetXaiResult { id } => {
            let row = service.xai.get_required(id).await?;
            Ok(ControlResponse::XaiResult(Box::new(XaiResultView::from_row(
                &row,
            ))))
        }

        ControlRequest::GetTask { task_id } => {
            Ok(ControlResponse::Task(task_view(service, status, &task_id).await?))
        }

        ControlRequest::Revoke {
            task_id,
            terminate,
            signal,
        } => {
            broker
                .revoke(task_id, terminate, signal)
                .map_err(|e| SubmitError::Internal(e.to_string()))?;
            Ok(ControlResponse::RevokeAccepted)
        }

        ControlRequest::Dashboard => {
            let view =
                build_dashboard(&service.jobs, &service.datasets, &service.models).await?;
            Ok(ControlResponse::Dashboard(view))
        }

        ControlRequest::ListCleaningRules => registry_view(service, RegistryKind::CleaningRules).await,
        ControlRequest::ListFeatureSelectionAlgorithms => {
            registry_view(service, RegistryKind::FeatureSelection).await
        }
        ControlRequest::ListModelTypes => registry_view(service, RegistryKind::ModelTypes).await,
    }
}

/// Merge the authoritative job row with the broker status overlay.
async fn task_view(
    service: &SubmissionService,
    status: &TaskStatusStore,
    task_id: &TaskId,
) -> Result<TaskStatusView, SubmitError> {
    let mut view = status.view(task_id);

    if let Some(job) = service.jobs.find_by_task_id(task_id).await? {
        // The row decides the terminal truth; the overlay only contributes
        // progress and intermediate messages.
        let row_state = match job.status() {
            JobStatus::Pending => view.status, // pending or received
            JobStatus::Running => {
                if view.status.is_terminal() {
                    view.status
                } else {
                    TaskState::Started
                }
            }
            JobStatus::Success => TaskState::Success,
            JobStatus::Failed => TaskState::Failure,
            JobStatus::Revoked => TaskState::Revoked,
        };
        view.status = row_state;
        if row_state == TaskState::Success {
            view.progress = 100;
        }
        if row_state == TaskState::Failure && view.error.is_none() {
            view.error = job.status_message.clone();
        }
        if view.status_message.is_none() {
            view.status_message = job.status_message.clone();
        }
    } else if view.status == TaskState::Pending && view.progress == 0 {
        warn!("Task {} has no job row and no status entry", task_id);
    }

    Ok(view)
}

async fn registry_view(
    service: &SubmissionService,
    kind: RegistryKind,
) -> Result<ControlResponse, SubmitError> {
    let rows = service.registries.list_implemented(kind).await?;
    Ok(ControlResponse::Registry(
        rows.iter()
            .map(|row| CapabilityView {
                name: row.name.clone(),
                display_name: row.display_name.clone(),
                description: row.description.clone(),
                parameter_schema: serde_json::from_str(&row.parameter_schema)
                    .unwrap_or(serde_json::Value::Null),
                last_updated_by: row.last_updated_by.clone(),
            })
            .collect(),
    ))
}
