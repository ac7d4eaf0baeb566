//! Commit-ingestion handler.
//!
//! Consumes a pre-extracted analysis payload (commit details, per-file
//! diffs, commit-level and class-level metrics), bulk-upserts it and drives
//! the commit's ingestion sub-state machine. The analysis tools that produce
//! the payload live outside the platform.
//!
//! An ingestion triggered on behalf of an inference job carries that job's
//! id; on completion the parked inference job is handed to the dispatcher,
//! so it always observes its features. A failed ingestion fails the chained
//! job instead of leaving it parked.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use codegauge_db::{
    CkMetricUpsert, CommitDetailUpsert, CommitMetricUpsert, FileDiffUpsert, JobRow,
};
use codegauge_pipeline::{CancellationToken, Dependencies, ProgressSink};
use codegauge_protocol::{ConfigMap, IngestionStatus, JobStatus, TaskId};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};

#[derive(Debug, Clone, Deserialize)]
struct IngestionConfig {
    commit_hash: String,
    #[serde(default)]
    commit: CommitPayload,
    #[serde(default)]
    diffs: Vec<DiffPayload>,
    #[serde(default)]
    commit_metrics: Option<MetricPayload>,
    #[serde(default)]
    ck_metrics: Vec<CkPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CommitPayload {
    message: Option<String>,
    author_name: Option<String>,
    author_email: Option<String>,
    committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiffPayload {
    file_path: String,
    change_type: Option<String>,
    #[serde(default)]
    lines_added: i64,
    #[serde(default)]
    lines_deleted: i64,
    diff_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MetricPayload {
    #[serde(default)]
    parent_hashes: Option<String>,
    #[serde(default)]
    author_date_ts: Option<i64>,
    #[serde(default)]
    is_merge: bool,
    #[serde(default)]
    files_churned: Option<i64>,
    #[serde(default)]
    values: ConfigMap,
    #[serde(default)]
    is_buggy: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct CkPayload {
    file_path: String,
    #[serde(default)]
    class_name: String,
    cbo: Option<f64>,
    wmc: Option<f64>,
    dit: Option<f64>,
    rfc: Option<f64>,
    lcom: Option<f64>,
    loc: Option<f64>,
}

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let config: IngestionConfig = serde_json::from_str(&job.config)?;
    let repository_id = job
        .repository_id
        .ok_or_else(|| HandlerFailure::validation("job has no repository id"))?;
    deps.repositories.get_required(repository_id).await?;

    // Move the sub-state machine to running; accept a fresh pending row or
    // an adopted re-run.
    deps.commits
        .mark_ingestion_pending(repository_id, &config.commit_hash)
        .await?;
    deps.commits
        .try_ingestion_transition(
            repository_id,
            &config.commit_hash,
            IngestionStatus::Pending,
            IngestionStatus::Running,
            Some("Ingestion started"),
        )
        .await?;

    let result = ingest(&config, repository_id, deps, progress, cancel).await;

    match result {
        Ok(mut outcome) => {
            deps.commits
                .try_ingestion_transition(
                    repository_id,
                    &config.commit_hash,
                    IngestionStatus::Running,
                    IngestionStatus::Complete,
                    Some(&outcome.message),
                )
                .await?;
            // Triggered on behalf of an inference job: the features now
            // exist, so hand the parked job to the dispatcher.
            if let Some(inference_id) = job.inference_job_id {
                hand_off_inference(inference_id, deps, &mut outcome).await;
            }
            Ok(outcome)
        }
        Err(failure) => {
            // Failed (revoked included) leaves the commit re-ingestable.
            let _ = deps
                .commits
                .try_ingestion_transition(
                    repository_id,
                    &config.commit_hash,
                    IngestionStatus::Running,
                    IngestionStatus::Failed,
                    Some(&failure.to_string()),
                )
                .await;
            if let Some(inference_id) = job.inference_job_id {
                fail_chained_inference(inference_id, deps, &failure).await;
            }
            Err(failure)
        }
    }
}

/// Release a chained inference job for dispatch: make sure it carries a
/// broker task id, then clear its park marker so the dispatcher claims it.
async fn hand_off_inference(
    inference_id: i64,
    deps: &Dependencies,
    outcome: &mut HandlerOutcome,
) {
    let inference = match deps.jobs.get(inference_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            warn!("Chained inference job {} no longer exists", inference_id);
            return;
        }
        Err(e) => {
            error!("Lookup of chained inference job {} failed: {}", inference_id, e);
            return;
        }
    };
    if inference.status() != JobStatus::Pending {
        warn!(
            "Chained inference job {} is {}, not handing off",
            inference_id,
            inference.status()
        );
        return;
    }

    if inference.broker_task_id.is_none() {
        let task_id = TaskId::generate();
        if let Err(e) = deps.jobs.set_task_id(inference_id, &task_id).await {
            error!(
                "Failed to record task id for chained inference job {}: {}",
                inference_id, e
            );
            return;
        }
    }
    match deps.jobs.requeue_dispatch(inference_id).await {
        Ok(()) => {
            info!("Handed off chained inference job {}", inference_id);
            outcome
                .message
                .push_str(&format!(" Inference job {} released.", inference_id));
        }
        Err(e) => error!(
            "Failed to release chained inference job {}: {}",
            inference_id, e
        ),
    }
}

/// A failed ingestion means the chained inference can never see its
/// features; surface that instead of leaving the job parked forever.
async fn fail_chained_inference(
    inference_id: i64,
    deps: &Dependencies,
    failure: &HandlerFailure,
) {
    let message = format!("Upstream ingestion failed: {}", failure);
    match deps
        .jobs
        .try_transition(
            inference_id,
            JobStatus::Pending,
            JobStatus::Failed,
            Some(&message),
        )
        .await
    {
        Ok(true) => warn!("Chained inference job {} marked failed", inference_id),
        Ok(false) => warn!(
            "Chained inference job {} already left pending, not touched",
            inference_id
        ),
        Err(e) => error!(
            "Failed to mark chained inference job {} failed: {}",
            inference_id, e
        ),
    }
}

async fn ingest(
    config: &IngestionConfig,
    repository_id: i64,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    progress.report(25, "Writing commit details", None);
    let detail = CommitDetailUpsert {
        commit_hash: config.commit_hash.clone(),
        message: config.commit.message.clone(),
        author_name: config.commit.author_name.clone(),
        author_email: config.commit.author_email.clone(),
        committed_at: config.commit.committed_at,
    };
    let diffs: Vec<FileDiffUpsert> = config
        .diffs
        .iter()
        .map(|d| FileDiffUpsert {
            file_path: d.file_path.clone(),
            change_type: d.change_type.clone(),
            lines_added: d.lines_added,
            lines_deleted: d.lines_deleted,
            diff_text: d.diff_text.clone(),
        })
        .collect();
    deps.commits
        .upsert_with_diffs(repository_id, &detail, &diffs)
        .await?;
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    progress.report(55, "Upserting commit metrics", None);
    let mut metric_rows = 0usize;
    if let Some(metrics) = &config.commit_metrics {
        let upsert = CommitMetricUpsert {
            commit_hash: config.commit_hash.clone(),
            parent_hashes: metrics.parent_hashes.clone(),
            author_name: config.commit.author_name.clone(),
            author_date_ts: metrics.author_date_ts,
            is_merge: metrics.is_merge,
            files_churned: metrics.files_churned,
            values: metrics.values.clone(),
            is_buggy: metrics.is_buggy,
        };
        metric_rows += deps
            .metrics
            .upsert_commit_metrics(repository_id, &[upsert])
            .await?;
    }

    progress.report(80, "Upserting class metrics", None);
    let ck_rows: Vec<CkMetricUpsert> = config
        .ck_metrics
        .iter()
        .map(|ck| CkMetricUpsert {
            commit_hash: config.commit_hash.clone(),
            file_path: ck.file_path.clone(),
            class_name: ck.class_name.clone(),
            cbo: ck.cbo,
            wmc: ck.wmc,
            dit: ck.dit,
            rfc: ck.rfc,
            lcom: ck.lcom,
            loc: ck.loc,
        })
        .collect();
    if !ck_rows.is_empty() {
        metric_rows += deps.metrics.upsert_ck_metrics(repository_id, &ck_rows).await?;
    }

    info!(
        "Ingested commit {} for repository {}: {} diffs, {} metric rows",
        config.commit_hash,
        repository_id,
        config.diffs.len(),
        metric_rows
    );
    Ok(HandlerOutcome {
        message: format!(
            "Commit {} ingested ({} diffs, {} metric rows).",
            config.commit_hash,
            config.diffs.len(),
            metric_rows
        ),
        receipt_result: Some(serde_json::json!({
            "commit_hash": config.commit_hash,
            "diffs": config.diffs.len(),
            "metric_rows": metric_rows,
        })),
        ..Default::default()
    })
}
