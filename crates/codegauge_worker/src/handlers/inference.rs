//! Inference handler.
//!
//! Separates identifier columns from features, validates the feature set
//! against the model's expected list, predicts per row and aggregates into
//! the commit-level prediction package.

use std::sync::Arc;

use codegauge_db::{ModelRow, TerminalResults};
use codegauge_ml::load_strategy;
use codegauge_pipeline::{CancellationToken, Dependencies, Frame, ProgressSink};
use codegauge_protocol::{FilePrediction, PredictionPackage};
use serde::Deserialize;
use tracing::info;

use crate::dataio::{fetch_artifact, load_inference_features};
use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use codegauge_db::JobRow;

/// Identifier columns never fed to the model.
const IDENTIFIER_COLUMNS: &[&str] = &["commit_hash", "parent_hash", "file", "class_name", "author_name"];

#[derive(Debug, Clone, Deserialize)]
pub struct InputReference {
    pub repo_id: i64,
    pub commit_hash: String,
}

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let input = parse_input_reference(job)?;
    let model_row = load_model(job, deps).await?;

    progress.report(20, "Loading model artifact", None);
    let artifact_uri = model_row
        .artifact_uri
        .as_deref()
        .ok_or_else(|| HandlerFailure::dependency("model has no artifact URI"))?;
    let artifact = fetch_artifact(deps.store.as_ref(), artifact_uri).await?;
    let model = load_strategy(&artifact)?;

    progress.report(40, "Loading features", None);
    let frame = load_inference_features(&deps.metrics, input.repo_id, &input.commit_hash)
        .await
        .map_err(HandlerFailure::from)?;
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    if frame.is_empty() {
        // Boundary contract: zero feature rows is a failed job carrying an
        // empty package, not a silent success.
        let package = PredictionPackage::empty("no features");
        let results = TerminalResults {
            prediction_result: Some(package),
            ..Default::default()
        };
        return Err(HandlerFailure {
            label: "DependencyError",
            message: format!(
                "no features for repository {} commit {}",
                input.repo_id, input.commit_hash
            ),
            results,
            cancelled: false,
        });
    }

    let expected = model.feature_names().to_vec();
    validate_feature_columns(&frame, &expected)?;

    progress.report(60, "Predicting", None);
    let x = frame
        .to_matrix(&expected)
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    let predictions = model.predict(&x)?;
    let probabilities = if model.supports_proba() {
        model.predict_proba(&x)?
    } else {
        predictions.clone()
    };

    let details = build_details(&frame, &predictions, &probabilities);
    let package = PredictionPackage::from_details(details);
    info!(
        "Job {}: {} files analyzed, commit prediction {}",
        job.id, package.num_files_analyzed, package.commit_prediction
    );

    let receipt = serde_json::to_value(&package)?;
    let results = TerminalResults {
        prediction_result: Some(package.clone()),
        ..Default::default()
    };

    Ok(HandlerOutcome {
        message: format!(
            "Inference completed: {} files analyzed, commit prediction {}.",
            package.num_files_analyzed, package.commit_prediction
        ),
        results,
        receipt_result: Some(receipt),
    })
}

fn parse_input_reference(job: &JobRow) -> Result<InputReference, HandlerFailure> {
    let raw = job
        .input_reference
        .as_deref()
        .ok_or_else(|| HandlerFailure::validation("job has no input reference"))?;
    serde_json::from_str(raw).map_err(|e| {
        HandlerFailure::validation(format!(
            "input_reference must contain repo_id and commit_hash: {}",
            e
        ))
    })
}

async fn load_model(job: &JobRow, deps: &Dependencies) -> Result<ModelRow, HandlerFailure> {
    let model_id = job
        .model_id
        .ok_or_else(|| HandlerFailure::validation("job has no model id"))?;
    Ok(deps.models.get_required(model_id).await?)
}

fn validate_feature_columns(frame: &Frame, expected: &[String]) -> Result<(), HandlerFailure> {
    let missing: Vec<&str> = expected
        .iter()
        .filter(|name| !frame.has_column(name))
        .map(|s| s.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(HandlerFailure::dependency(format!(
            "feature rows are missing model columns: {}",
            missing.join(", ")
        )));
    }
    for ident in IDENTIFIER_COLUMNS {
        if expected.iter().any(|e| e == ident) {
            return Err(HandlerFailure::validation(format!(
                "model feature list contains identifier column '{}'",
                ident
            )));
        }
    }
    Ok(())
}

fn build_details(frame: &Frame, predictions: &[f64], probabilities: &[f64]) -> Vec<FilePrediction> {
    let files = frame.column("file");
    let classes = frame.column("class_name");

    (0..frame.num_rows())
        .map(|row| {
            let class = classes
                .and_then(|c| c.as_str(row))
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            FilePrediction {
                file: files
                    .and_then(|c| c.as_str(row))
                    .unwrap_or_default()
                    .to_string(),
                class,
                prediction: predictions[row].round() as i32,
                probability: probabilities[row],
            }
        })
        .collect()
}
