//! Explanation-orchestration handler.
//!
//! After a successful inference: decide the applicable XAI types for the
//! model, create one pending XAIResult per type (idempotent on
//! `(inference_job_id, xai_type)`), enqueue one explanation job per created
//! row, and bulk-fail rows whose dispatch could not be recorded.

use std::sync::Arc;

use codegauge_ml::{applicable_xai_types, is_tree_based};
use codegauge_pipeline::{CancellationToken, Dependencies, ProgressSink};
use codegauge_protocol::{JobKind, JobStatus, TaskId};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use codegauge_db::{JobRow, NewJob};

#[derive(Debug, Clone, Deserialize)]
struct OrchestrationConfig {
    inference_job_id: i64,
}

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let config: OrchestrationConfig = serde_json::from_str(&job.config)?;
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    let inference = deps.jobs.get_required(config.inference_job_id).await?;
    if inference.status() != JobStatus::Success {
        return Err(HandlerFailure::dependency(format!(
            "inference job {} is {}, not success",
            inference.id,
            inference.status()
        )));
    }
    let model_id = inference
        .model_id
        .ok_or_else(|| HandlerFailure::dependency("inference job has no model id"))?;
    let model = deps.models.get_required(model_id).await?;

    let xai_types = applicable_xai_types(is_tree_based(&model.model_type));
    info!(
        "Job {}: orchestrating {} explanation types for inference {} (model type '{}')",
        job.id,
        xai_types.len(),
        inference.id,
        model.model_type
    );

    progress.report(30, "Creating explanation records", None);
    let mut created = Vec::new();
    let mut skipped = 0usize;
    for xai_type in xai_types {
        let (xai_result_id, was_created) = deps
            .xai
            .create_pending(inference.id, xai_type)
            .await?;
        if was_created {
            created.push((xai_result_id, xai_type));
        } else {
            skipped += 1;
            warn!(
                "XAIResult ({}, {}) already exists as {}, skipping",
                inference.id, xai_type, xai_result_id
            );
        }
    }

    progress.report(60, "Dispatching explanation jobs", None);
    let mut dispatched = 0usize;
    let mut failed_dispatches = Vec::new();
    for (xai_result_id, xai_type) in &created {
        let new_job = NewJob {
            kind: Some(JobKind::XaiResult),
            config: serde_json::json!({ "xai_result_id": xai_result_id }),
            inference_job_id: Some(inference.id),
            ..Default::default()
        };
        match deps.jobs.create(&new_job).await {
            Ok(row) => {
                let task_id = TaskId::generate();
                let recorded = deps.jobs.set_task_id(row.id, &task_id).await;
                let linked = deps.xai.set_task_id(*xai_result_id, &task_id).await;
                if recorded.is_err() || linked.is_err() {
                    error!(
                        "Failed to record task id for XAIResult {} ({})",
                        xai_result_id, xai_type
                    );
                    failed_dispatches.push(*xai_result_id);
                } else {
                    dispatched += 1;
                }
            }
            Err(e) => {
                error!(
                    "Failed to enqueue explanation job for XAIResult {} ({}): {}",
                    xai_result_id, xai_type, e
                );
                failed_dispatches.push(*xai_result_id);
            }
        }
    }

    if !failed_dispatches.is_empty() {
        deps.xai
            .mark_failed_bulk(&failed_dispatches, "Explanation dispatch failed")
            .await?;
    }

    let message = format!(
        "Explanation orchestration complete. Dispatched: {}, existing: {}, failed dispatches: {}.",
        dispatched,
        skipped,
        failed_dispatches.len()
    );
    Ok(HandlerOutcome {
        message: message.clone(),
        receipt_result: Some(serde_json::json!({
            "dispatched": dispatched,
            "existing": skipped,
            "failed_dispatches": failed_dispatches.len(),
        })),
        ..Default::default()
    })
}
