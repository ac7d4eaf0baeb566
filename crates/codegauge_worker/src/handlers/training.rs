//! Training handler.
//!
//! load dataset -> prepare (X, y) -> construct model strategy -> fit (with
//! optional held-out split) -> persist artifact and register the Model row.
//! The artifact URI is written only after the store acknowledges the write;
//! a Model row without a URI is never selectable for inference.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use codegauge_db::{DatasetRow, NewModel, TerminalResults};
use codegauge_ml::{
    accuracy, f1_weighted, precision_weighted, recall_weighted, roc_auc, save_strategy,
    supported_model_types, ModelStrategy,
};
use codegauge_pipeline::{CancellationToken, ColumnData, Dependencies, Frame, ProgressSink};
use codegauge_protocol::{validate_params, ConfigMap, DatasetStatus};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{error, info};

use crate::dataio::load_dataset_frame;
use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use codegauge_db::JobRow;

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub model_name: String,
    pub model_type: String,
    #[serde(default)]
    pub hyperparameters: ConfigMap,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Held-out fraction for evaluation metrics; None trains on everything
    /// and reports training-set metrics.
    #[serde(default)]
    pub eval_test_split_size: Option<f64>,
}

fn default_seed() -> u64 {
    42
}

pub async fn run(
    job: &JobRow,
    deps: &Dependencies,
    progress: &Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> HandlerResult {
    let config: TrainingConfig = serde_json::from_str(&job.config)?;
    validate_model_config(&config)?;

    let dataset = load_ready_dataset(job, deps).await?;

    progress.report(15, "Loading data", None);
    let storage_uri = dataset
        .storage_uri
        .as_deref()
        .ok_or_else(|| HandlerFailure::dependency("dataset has no storage URI"))?;
    let frame = load_dataset_frame(deps.store.as_ref(), storage_uri).await?;
    info!(
        "Job {}: loaded dataset {} ({} rows)",
        job.id,
        dataset.id,
        frame.num_rows()
    );

    progress.report(35, "Preparing data", None);
    let x = frame
        .to_matrix(&config.feature_columns)
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    let y = prepare_labels(&frame, &config.target_column)?;
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    progress.report(45, "Training model", None);
    let (model, metrics, training_seconds) = fit_and_evaluate(&config, x, y, cancel)?;

    progress.report(90, "Persisting artifact", None);
    let (model_id, version, artifact_uri) =
        persist_model(job, deps, &config, model.as_ref(), &metrics, training_seconds).await?;

    let mut results = TerminalResults::default();
    results.model_id = Some(model_id);

    Ok(HandlerOutcome {
        message: format!(
            "Training completed. Model '{}' v{} registered.",
            config.model_name, version
        ),
        results,
        receipt_result: Some(serde_json::json!({
            "model_id": model_id,
            "version": version,
            "artifact_uri": artifact_uri,
            "metrics": metrics,
        })),
    })
}

fn validate_model_config(config: &TrainingConfig) -> Result<(), HandlerFailure> {
    if config.model_name.is_empty() {
        return Err(HandlerFailure::validation("model_name must not be empty"));
    }
    if config.feature_columns.is_empty() {
        return Err(HandlerFailure::validation("feature_columns must not be empty"));
    }

    let info = supported_model_types()
        .into_iter()
        .find(|t| t.name == config.model_type)
        .ok_or_else(|| {
            HandlerFailure::validation(format!("unsupported model type '{}'", config.model_type))
        })?;

    let params: BTreeMap<String, serde_json::Value> = config
        .hyperparameters
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    validate_params(&info.schema, &params)
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    Ok(())
}

async fn load_ready_dataset(
    job: &JobRow,
    deps: &Dependencies,
) -> Result<DatasetRow, HandlerFailure> {
    let dataset_id = job
        .dataset_id
        .ok_or_else(|| HandlerFailure::validation("job has no dataset id"))?;
    let dataset = deps.datasets.get_required(dataset_id).await?;
    if dataset.status() != DatasetStatus::Ready {
        return Err(HandlerFailure::dependency(format!(
            "dataset {} is {}, not ready",
            dataset_id,
            dataset.status()
        )));
    }
    Ok(dataset)
}

/// Extract binary labels, target-encoding a string column when necessary.
pub(crate) fn prepare_labels(frame: &Frame, target: &str) -> Result<Vec<f64>, HandlerFailure> {
    let column = frame
        .column(target)
        .ok_or_else(|| HandlerFailure::validation(format!("missing target column '{}'", target)))?;

    if let ColumnData::Str(values) = column {
        let mut distinct: Vec<&str> = values
            .iter()
            .map(|v| v.as_deref().unwrap_or(""))
            .collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != 2 {
            return Err(HandlerFailure::validation(format!(
                "target column '{}' has {} distinct values, expected 2",
                target,
                distinct.len()
            )));
        }
        let positive = distinct[1];
        return Ok(values
            .iter()
            .map(|v| f64::from(v.as_deref() == Some(positive)))
            .collect());
    }

    let labels = frame
        .to_vector(target)
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    if labels
        .iter()
        .any(|&l| (l - 0.0).abs() > 1e-9 && (l - 1.0).abs() > 1e-9)
    {
        return Err(HandlerFailure::validation(format!(
            "target column '{}' must be binary (0/1)",
            target
        )));
    }
    Ok(labels)
}

type FitResult = (Box<dyn ModelStrategy>, ConfigMap, f64);

fn fit_and_evaluate(
    config: &TrainingConfig,
    x: Vec<Vec<f64>>,
    y: Vec<f64>,
    cancel: &CancellationToken,
) -> Result<FitResult, HandlerFailure> {
    let (train_x, train_y, test_x, test_y) = split_train_test(
        x,
        y,
        config.eval_test_split_size,
        config.random_seed,
    )?;

    let mut model = codegauge_ml::create_strategy(
        &config.model_type,
        &config.hyperparameters,
        config.feature_columns.clone(),
    )?;

    let started = Instant::now();
    model.fit(&train_x, &train_y)?;
    let training_seconds = started.elapsed().as_secs_f64();
    cancel.ensure_active().map_err(HandlerFailure::from)?;

    let (eval_x, eval_y) = match (&test_x, &test_y) {
        (Some(x), Some(y)) => (x.as_slice(), y.as_slice()),
        _ => (train_x.as_slice(), train_y.as_slice()),
    };

    let pred = model.predict(eval_x)?;
    let mut metrics = ConfigMap::new();
    metrics.insert("accuracy".into(), json_metric(accuracy(eval_y, &pred))?);
    metrics.insert(
        "precision_weighted".into(),
        json_metric(precision_weighted(eval_y, &pred))?,
    );
    metrics.insert(
        "recall_weighted".into(),
        json_metric(recall_weighted(eval_y, &pred))?,
    );
    metrics.insert("f1_weighted".into(), json_metric(f1_weighted(eval_y, &pred))?);
    if model.supports_proba() {
        let proba = model.predict_proba(eval_x)?;
        if let Ok(auc) = roc_auc(eval_y, &proba) {
            metrics.insert("auc".into(), serde_json::json!(auc));
        }
    }
    metrics.insert(
        "training_time_seconds".into(),
        serde_json::json!(training_seconds),
    );

    Ok((model, metrics, training_seconds))
}

fn json_metric(value: codegauge_ml::Result<f64>) -> Result<serde_json::Value, HandlerFailure> {
    Ok(serde_json::json!(value?))
}

type SplitResult = (
    Vec<Vec<f64>>,
    Vec<f64>,
    Option<Vec<Vec<f64>>>,
    Option<Vec<f64>>,
);

fn split_train_test(
    x: Vec<Vec<f64>>,
    y: Vec<f64>,
    split: Option<f64>,
    seed: u64,
) -> Result<SplitResult, HandlerFailure> {
    let Some(split) = split else {
        return Ok((x, y, None, None));
    };
    if !(0.0..1.0).contains(&split) {
        return Err(HandlerFailure::validation(
            "eval_test_split_size must be in [0, 1)",
        ));
    }
    if split == 0.0 {
        return Ok((x, y, None, None));
    }

    let n = x.len();
    let test_count = ((n as f64) * split).round() as usize;
    if test_count == 0 || test_count >= n {
        return Ok((x, y, None, None));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let (test_idx, train_idx) = indices.split_at(test_count);
    let train_x: Vec<Vec<f64>> = train_idx.iter().map(|&i| x[i].clone()).collect();
    let train_y: Vec<f64> = train_idx.iter().map(|&i| y[i]).collect();
    let test_x: Vec<Vec<f64>> = test_idx.iter().map(|&i| x[i].clone()).collect();
    let test_y: Vec<f64> = test_idx.iter().map(|&i| y[i]).collect();
    Ok((train_x, train_y, Some(test_x), Some(test_y)))
}

/// Create the Model row, write the artifact, then record the URI. A write
/// failure after row creation leaves the row URI-less and is logged as a
/// critical inconsistency; no automatic row deletion.
pub(crate) async fn persist_model(
    job: &JobRow,
    deps: &Dependencies,
    config: &TrainingConfig,
    model: &dyn ModelStrategy,
    metrics: &ConfigMap,
    _training_seconds: f64,
) -> Result<(i64, i64, String), HandlerFailure> {
    let new_model = NewModel {
        name: config.model_name.clone(),
        model_type: config.model_type.clone(),
        dataset_id: job.dataset_id,
        training_job_id: (job.kind == "training").then_some(job.id),
        hp_search_job_id: (job.kind == "hp_search").then_some(job.id),
        hyperparameters: config.hyperparameters.clone(),
        performance_metrics: metrics.clone(),
    };
    let row = deps.models.create(&new_model).await?;

    let uri = codegauge_store::model_uri(
        &deps.artifact_scheme,
        &deps.artifact_bucket,
        &config.model_name,
        row.version,
        "json",
    );

    let bytes = save_strategy(model)?;
    // Guard against stale artifacts from an adopted re-run: overwrite.
    if deps.store.exists(&uri).unwrap_or(false) {
        info!("Artifact already present at {}, overwriting", uri);
    }
    if let Err(e) = deps.store.put_bytes(&uri, &bytes) {
        error!(
            "CRITICAL: model row {} created but artifact write to {} failed: {}",
            row.id, uri, e
        );
        return Err(crate::handlers::artifact_failure("ArtifactWrite", e));
    }

    deps.models.set_artifact_uri(row.id, &uri).await?;
    info!(
        "Model '{}' v{} registered with artifact {}",
        config.model_name, row.version, uri
    );
    Ok((row.id, row.version, uri))
}
