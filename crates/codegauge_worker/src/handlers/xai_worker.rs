//! Explanation worker handler.
//!
//! Loads the model artifact and the inference features, resolves a
//! background sample (dataset background artifact, falling back to a sample
//! of the inference features), runs the strategy for the row's XAI type and
//! drives the XAIResult row to terminal alongside the job.

use std::sync::Arc;

use codegauge_ml::{
    create_xai_strategy, is_tree_based, load_strategy, ExplanationRequest, RowIdent,
    MAX_EXPLAINED_ROWS,
};
use codegauge_pipeline::{CancellationToken, Dependencies, Frame, ProgressSink};
use codegauge_protocol::JobStatus;
use serde::Deserialize;
use tracing::{info, warn};

use crate::dataio::{fetch_artifact, load_dataset_frame, load_inference_features};
use crate::handlers::inference::InputReference;
use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use codegauge_db::JobRow;

#[derive(Debug, Clone, Deserialize)]
struct XaiWorkerConfig {
    xai_result_id: i64,
}

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let config: XaiWorkerConfig = serde_json::from_str(&job.config)?;
    let row = deps.xai.get_required(config.xai_result_id).await?;

    if row.status().is_terminal() {
        return Ok(HandlerOutcome::message(format!(
            "XAIResult {} already terminal ({})",
            row.id,
            row.status()
        )));
    }

    let moved = deps
        .xai
        .try_transition(row.id, JobStatus::Pending, JobStatus::Running, None)
        .await?;
    if !moved && deps.xai.get_required(row.id).await?.status() != JobStatus::Running {
        return Err(HandlerFailure::dependency(format!(
            "XAIResult {} could not be claimed",
            row.id
        )));
    }

    let result = explain(&row, deps, progress, cancel).await;

    match result {
        Ok((value, message)) => {
            let committed = deps.xai.complete_success(row.id, &value, &message).await?;
            if !committed {
                warn!("XAIResult {} terminal CAS lost", row.id);
            }
            Ok(HandlerOutcome {
                message,
                receipt_result: Some(serde_json::json!({ "xai_result_id": row.id })),
                ..Default::default()
            })
        }
        Err(failure) => {
            let next = if failure.cancelled {
                JobStatus::Revoked
            } else {
                JobStatus::Failed
            };
            let _ = deps
                .xai
                .try_transition(row.id, JobStatus::Running, next, Some(&failure.to_string()))
                .await;
            Err(failure)
        }
    }
}

async fn explain(
    row: &codegauge_db::XaiResultRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Result<(serde_json::Value, String), HandlerFailure> {
    let xai_type = row
        .xai_type()
        .ok_or_else(|| HandlerFailure::validation(format!("unknown XAI type '{}'", row.xai_type)))?;

    let inference = deps.jobs.get_required(row.inference_job_id).await?;
    if inference.status() != JobStatus::Success {
        return Err(HandlerFailure::dependency(format!(
            "inference job {} is {}, not success",
            inference.id,
            inference.status()
        )));
    }
    let input: InputReference = serde_json::from_str(
        inference
            .input_reference
            .as_deref()
            .ok_or_else(|| HandlerFailure::dependency("inference job has no input reference"))?,
    )?;

    let model_row = deps
        .models
        .get_required(
            inference
                .model_id
                .ok_or_else(|| HandlerFailure::dependency("inference job has no model id"))?,
        )
        .await?;
    let artifact_uri = model_row
        .artifact_uri
        .as_deref()
        .ok_or_else(|| HandlerFailure::dependency("model has no artifact URI"))?;

    progress.report(20, "Loading model artifact", None);
    let model = load_strategy(&fetch_artifact(deps.store.as_ref(), artifact_uri).await?)?;
    let feature_names = model.feature_names().to_vec();

    progress.report(40, "Loading features", None);
    let frame = load_inference_features(&deps.metrics, input.repo_id, &input.commit_hash)
        .await
        .map_err(HandlerFailure::from)?;
    if frame.is_empty() {
        return Err(HandlerFailure::dependency(format!(
            "no features for repository {} commit {}",
            input.repo_id, input.commit_hash
        )));
    }
    let features = frame
        .to_matrix(feature_names.as_slice())
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    let identifiers = row_identifiers(&frame);
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    progress.report(55, "Resolving background sample", None);
    let background = load_background(deps, &model_row, &feature_names, &features).await?;

    progress.report(70, "Generating explanation", None);
    let strategy = create_xai_strategy(xai_type, is_tree_based(&model_row.model_type))?;
    let request = ExplanationRequest {
        model: model.as_ref(),
        feature_names: &feature_names,
        features: &features,
        background: &background,
        identifiers: &identifiers,
    };
    let value = strategy.explain(&request)?;
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    info!(
        "XAIResult {}: {} explanation generated over {} rows",
        row.id,
        xai_type,
        features.len().min(MAX_EXPLAINED_ROWS)
    );
    Ok((
        value,
        format!("{} explanation generated", xai_type),
    ))
}

fn row_identifiers(frame: &Frame) -> Vec<RowIdent> {
    let files = frame.column("file");
    let classes = frame.column("class_name");
    (0..frame.num_rows())
        .map(|row| RowIdent {
            file: files
                .and_then(|c| c.as_str(row))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            class_name: classes
                .and_then(|c| c.as_str(row))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
        .collect()
}

/// Dataset background sample when present, else a deterministic sample of
/// the inference features themselves.
async fn load_background(
    deps: &Dependencies,
    model_row: &codegauge_db::ModelRow,
    feature_names: &[String],
    features: &[Vec<f64>],
) -> Result<Vec<Vec<f64>>, HandlerFailure> {
    if let Some(dataset_id) = model_row.dataset_id {
        let dataset = deps.datasets.get_required(dataset_id).await?;
        if let Some(uri) = dataset.background_sample_uri.as_deref() {
            match load_dataset_frame(deps.store.as_ref(), uri).await {
                Ok(frame) => match frame.to_matrix(feature_names) {
                    Ok(matrix) if !matrix.is_empty() => return Ok(matrix),
                    Ok(_) => warn!("Background sample at {} is empty", uri),
                    Err(e) => warn!("Background sample at {} unusable: {}", uri, e),
                },
                Err(e) => warn!("Failed to load background sample {}: {}", uri, e),
            }
        }
    }

    // Fallback: sample of the inference features.
    let cap = features.len().min(100);
    Ok(features[..cap].to_vec())
}
