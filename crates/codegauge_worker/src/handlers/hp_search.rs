//! Hyper-parameter search handler.
//!
//! Outer trial loop over a typed search space: sample -> k-fold
//! cross-validate under the objective metric -> prune or record. The best
//! trial's params land on the job row; optionally the best configuration is
//! retrained end-to-end and registered as a Model (same artifact protocol as
//! training).

use std::sync::Arc;

use codegauge_db::TerminalResults;
use codegauge_ml::{cross_validate, ObjectiveMetric, Pruner, PrunerKind, RandomSampler, Trial};
use codegauge_pipeline::{CancellationToken, Dependencies, ProgressSink};
use codegauge_protocol::{ConfigMap, DatasetStatus, SearchSpaceParam};
use serde::Deserialize;
use tracing::{debug, info};

use crate::dataio::load_dataset_frame;
use crate::handlers::training::{persist_model, prepare_labels, TrainingConfig};
use crate::handlers::{HandlerFailure, HandlerOutcome, HandlerResult};
use codegauge_db::JobRow;

#[derive(Debug, Clone, Deserialize)]
pub struct HpSearchConfig {
    pub model_type: String,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    #[serde(default)]
    pub hp_space: Vec<SearchSpaceParam>,
    #[serde(default = "default_trials")]
    pub n_trials: usize,
    #[serde(default)]
    pub objective_metric: ObjectiveMetric,
    #[serde(default = "default_folds")]
    pub cv_folds: usize,
    #[serde(default)]
    pub pruner: PrunerKind,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Retrain the best configuration on the full dataset and register a
    /// Model row.
    #[serde(default)]
    pub retrain_best: bool,
    #[serde(default)]
    pub model_name: Option<String>,
}

fn default_trials() -> usize {
    20
}

fn default_folds() -> usize {
    3
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
    let config: HpSearchConfig = serde_json::from_str(&job.config)?;
    validate_config(&config)?;

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

    progress.report(10, "Loading data", None);
    let storage_uri = dataset
        .storage_uri
        .as_deref()
        .ok_or_else(|| HandlerFailure::dependency("dataset has no storage URI"))?;
    let frame = load_dataset_frame(deps.store.as_ref(), storage_uri).await?;
    let x = frame
        .to_matrix(&config.feature_columns)
        .map_err(|e| HandlerFailure::validation(e.to_string()))?;
    let y = prepare_labels(&frame, &config.target_column)?;

    let study = job.study_name.as_deref().unwrap_or("unnamed");
    info!(
        "Job {}: study '{}' over {} rows, {} trials of {}-fold CV on {}",
        job.id,
        study,
        x.len(),
        config.n_trials,
        config.cv_folds,
        config.objective_metric
    );

    let mut sampler = RandomSampler::new(config.random_seed);
    let pruner = Pruner::new(config.pruner);
    let mut trials: Vec<Trial> = Vec::with_capacity(config.n_trials);
    let mut best: Option<(i64, ConfigMap, f64)> = None;

    for number in 0..config.n_trials {
        cancel.ensure_active().map_err(HandlerFailure::from)?;

        let params = sampler.suggest(&config.hp_space)?;
        debug!("Trial {}: params {:?}", number, params);

        let scores = cross_validate(
            &config.model_type,
            &params,
            &config.feature_columns,
            &x,
            &y,
            config.cv_folds,
            config.objective_metric,
            config.random_seed,
            |fold, running_mean| !pruner.should_prune(&trials, fold, running_mean),
        )?;

        let trial = match scores {
            None => {
                debug!("Trial {} pruned", number);
                Trial {
                    number: number as i64,
                    params,
                    value: None,
                    pruned: true,
                }
            }
            Some(scores) => {
                let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                if best.as_ref().map_or(true, |(_, _, b)| mean > *b) {
                    best = Some((number as i64, params.clone(), mean));
                }
                Trial {
                    number: number as i64,
                    params,
                    value: Some(mean),
                    pruned: false,
                }
            }
        };
        trials.push(trial);

        let percent = 10 + (70.0 * (number + 1) as f64 / config.n_trials as f64) as u8;
        progress.report(
            percent,
            "Running trials",
            Some(&format!("Trial {}/{}", number + 1, config.n_trials)),
        );
    }

    let Some((best_trial, best_params, best_value)) = best else {
        return Err(HandlerFailure {
            label: "PipelineStepError",
            message: "all trials pruned or failed; no best configuration".into(),
            results: TerminalResults::default(),
            cancelled: false,
        });
    };
    let pruned = trials.iter().filter(|t| t.pruned).count();
    info!(
        "Job {}: best trial {} with {}={:.4} ({} pruned)",
        job.id, best_trial, config.objective_metric, best_value, pruned
    );

    let mut results = TerminalResults {
        best_trial_id: Some(best_trial),
        best_params: Some(serde_json::to_value(&best_params)?),
        best_value: Some(best_value),
        ..Default::default()
    };

    let mut registered_model = None;
    if config.retrain_best {
        progress.report(85, "Retraining best configuration", None);
        cancel.ensure_active().map_err(HandlerFailure::from)?;

        let model_name = config.model_name.clone().ok_or_else(|| {
            HandlerFailure::validation("model_name is required when retrain_best is set")
        })?;
        let training_config = TrainingConfig {
            model_name,
            model_type: config.model_type.clone(),
            hyperparameters: best_params.clone(),
            feature_columns: config.feature_columns.clone(),
            target_column: config.target_column.clone(),
            random_seed: config.random_seed,
            eval_test_split_size: None,
        };

        let mut model = codegauge_ml::create_strategy(
            &config.model_type,
            &best_params,
            config.feature_columns.clone(),
        )?;
        let started = std::time::Instant::now();
        model.fit(&x, &y)?;
        let training_seconds = started.elapsed().as_secs_f64();

        let mut metrics = ConfigMap::new();
        metrics.insert(
            config.objective_metric.as_str().to_string(),
            serde_json::json!(best_value),
        );
        metrics.insert(
            "training_time_seconds".into(),
            serde_json::json!(training_seconds),
        );

        let (model_id, version, _uri) = persist_model(
            job,
            deps,
            &training_config,
            model.as_ref(),
            &metrics,
            training_seconds,
        )
        .await?;
        results.model_id = Some(model_id);
        registered_model = Some(serde_json::json!({
            "model_id": model_id,
            "version": version,
        }));
    }

    Ok(HandlerOutcome {
        message: format!(
            "HP search completed: best {}={:.4} at trial {} ({} trials, {} pruned).",
            config.objective_metric, best_value, best_trial, config.n_trials, pruned
        ),
        results,
        receipt_result: Some(serde_json::json!({
            "best_trial": best_trial,
            "best_value": best_value,
            "best_params": best_params,
            "n_trials": config.n_trials,
            "pruned": pruned,
            "registered_model": registered_model,
        })),
    })
}

fn validate_config(config: &HpSearchConfig) -> Result<(), HandlerFailure> {
    if config.n_trials == 0 {
        return Err(HandlerFailure::validation("n_trials must be at least 1"));
    }
    if config.hp_space.is_empty() {
        return Err(HandlerFailure::validation("hp_space must not be empty"));
    }
    if codegauge_ml::supported_model_types()
        .iter()
        .all(|t| t.name != config.model_type)
    {
        return Err(HandlerFailure::validation(format!(
            "unsupported model type '{}'",
            config.model_type
        )));
    }
    for dim in &config.hp_space {
        dim.validate().map_err(HandlerFailure::validation)?;
    }
    if config.retrain_best && config.model_name.is_none() {
        return Err(HandlerFailure::validation(
            "model_name is required when retrain_best is set",
        ));
    }
    Ok(())
}
