//! Dataset-generation step catalogue.
//!
//! The strategy is: LoadConfiguration -> StreamAndProcessBatches ->
//! ProcessGlobally -> SelectFinalColumns -> WriteOutput. The batch and
//! global orchestrators run inner strategies of their own; the inner lists
//! are ordinary [`codegauge_pipeline::Strategy`] values.

pub mod batch_steps;

use std::sync::Arc;

use async_trait::async_trait;
use codegauge_pipeline::{
    Context, Dependencies, Frame, PipelineError, Result, Step, Strategy,
};
use codegauge_protocol::DatasetStatus;
use codegauge_store::{background_sample_uri, batches_to_parquet, dataset_uri};
use tracing::{debug, error, info, warn};

use crate::cleaning::{apply_rule, find_rule};
use crate::dataio::DataLoader;
use crate::features::find_algorithm;
use self::batch_steps::batch_strategy;

/// Commits per streamed batch when the dataset config does not override it.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Background sampling thresholds: no sample under the minimum, capped at
/// the target size above it.
const BACKGROUND_MIN_ROWS: usize = 50;
const BACKGROUND_TARGET_ROWS: usize = 500;
const BACKGROUND_SAMPLE_SEED: u64 = 42;

/// Identifier columns carried through to the output alongside features.
const IDENTIFIER_COLUMNS: &[&str] = &["commit_hash", "file", "class_name"];

/// The dataset-generation strategy.
pub fn dataset_generation_strategy() -> Strategy {
    vec![
        Arc::new(LoadConfigurationStep),
        Arc::new(StreamAndProcessBatchesStep),
        Arc::new(ProcessGloballyStep),
        Arc::new(SelectFinalColumnsStep),
        Arc::new(WriteOutputStep),
    ]
}

// ============================================================================
// LoadConfiguration
// ============================================================================

/// Resolve the dataset, its repository, config and bot patterns into the
/// context, and move the dataset to `generating`.
pub struct LoadConfigurationStep;

#[async_trait]
impl Step for LoadConfigurationStep {
    fn name(&self) -> &'static str {
        "Load Configuration"
    }

    async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()> {
        let dataset_id = ctx
            .dataset_id
            .ok_or_else(|| PipelineError::validation("job has no dataset id"))?;

        let dataset = deps.datasets.get_required(dataset_id).await?;
        let config = dataset
            .config()
            .map_err(|e| PipelineError::validation(format!("invalid dataset config: {}", e)))?;
        if config.feature_columns.is_empty() {
            return Err(PipelineError::validation("no feature columns configured"));
        }
        if config.target_column.is_empty() {
            return Err(PipelineError::validation("no target column configured"));
        }

        // Validate configured plug-ins up front so a typo fails before any
        // data is streamed.
        for rule in config.cleaning_rules.iter().filter(|r| r.enabled) {
            if find_rule(&rule.name).is_none() {
                return Err(PipelineError::validation(format!(
                    "unknown cleaning rule '{}'",
                    rule.name
                )));
            }
        }
        if let Some(selection) = &config.feature_selection {
            if find_algorithm(&selection.name).is_none() {
                return Err(PipelineError::validation(format!(
                    "unknown feature selection algorithm '{}'",
                    selection.name
                )));
            }
        }

        let repository = deps
            .repositories
            .get_required(dataset.repository_id)
            .await?;
        let bot_patterns = deps.repositories.bot_patterns_for(repository.id).await?;

        let moved = deps
            .datasets
            .try_transition(
                dataset_id,
                DatasetStatus::Pending,
                DatasetStatus::Generating,
                Some("Dataset generation started"),
            )
            .await?;
        if !moved && dataset.status() != DatasetStatus::Generating {
            return Err(PipelineError::validation(format!(
                "dataset {} is {}, not pending",
                dataset_id,
                dataset.status()
            )));
        }

        info!(
            "Dataset {}: configuration loaded ({} features, {} bot patterns)",
            dataset_id,
            config.feature_columns.len(),
            bot_patterns.len()
        );
        ctx.repository = Some(repository);
        ctx.dataset = Some(dataset);
        ctx.dataset_config = Some(config);
        ctx.bot_patterns = bot_patterns;
        Ok(())
    }
}

// ============================================================================
// StreamAndProcessBatches
// ============================================================================

/// Batch orchestrator: streams labeled metric rows in fixed-size commit
/// batches and runs the inner batch strategy over a per-batch sub-context.
pub struct StreamAndProcessBatchesStep;

#[async_trait]
impl Step for StreamAndProcessBatchesStep {
    fn name(&self) -> &'static str {
        "Stream and Process Batches"
    }

    async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()> {
        let repository_id = ctx
            .repository
            .as_ref()
            .map(|r| r.id)
            .ok_or_else(|| PipelineError::validation("repository missing in context"))?;
        let batch_size = ctx
            .config_required()?
            .batch_size
            .unwrap_or(DEFAULT_BATCH_SIZE) as i64;

        let loader = DataLoader::new(deps.metrics.clone(), repository_id);
        ctx.estimated_total_rows = loader.estimate_total_commits().await?;
        info!(
            "Dataset {:?}: streaming ~{} labeled commits in batches of {}",
            ctx.dataset_id, ctx.estimated_total_rows, batch_size
        );

        let sub_steps = batch_strategy();
        let mut offset = 0i64;
        let mut batch_num = 0usize;
        let mut kept_rows = 0usize;

        loop {
            // Batch boundary: the only place a long stream can be revoked.
            ctx.cancel.ensure_active()?;

            let batch = loader.fetch_batch(offset, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            offset += batch_size;
            batch_num += 1;
            debug!("Batch {}: {} rows loaded", batch_num, batch.num_rows());

            let mut batch_ctx = ctx.batch_child(batch);
            for sub_step in &sub_steps {
                if batch_ctx.frame.as_ref().map_or(true, Frame::is_empty) {
                    debug!(
                        "Batch {} became empty before [{}], skipping remaining sub-steps",
                        batch_num,
                        sub_step.name()
                    );
                    break;
                }
                sub_step.run(&mut batch_ctx, deps).await.map_err(|e| {
                    PipelineError::Step {
                        step: sub_step.name().to_string(),
                        message: e.to_string(),
                    }
                })?;
            }

            ctx.warnings.extend(batch_ctx.warnings.drain(..));
            if let Some(frame) = batch_ctx.frame {
                if !frame.is_empty() {
                    kept_rows += frame.num_rows();
                    ctx.processed_batches.push(frame);
                }
            }

            let progress = if ctx.estimated_total_rows > 0 {
                let seen = (offset as f64).min(ctx.estimated_total_rows as f64);
                5 + (45.0 * seen / ctx.estimated_total_rows as f64) as u8
            } else {
                50
            };
            ctx.progress.report(
                progress.min(50),
                self.name(),
                Some(&format!("Processing batch {}", batch_num)),
            );
        }

        info!(
            "Processed {} batches, {} rows kept",
            batch_num, kept_rows
        );
        if ctx.processed_batches.is_empty() {
            ctx.warn("No rows survived batch processing".to_string());
            ctx.early_exit = true;
        }
        Ok(())
    }
}

// ============================================================================
// ProcessGlobally
// ============================================================================

/// Global orchestrator: concatenates per-batch outputs, applies the rules
/// that are not batch safe, then feature selection.
pub struct ProcessGloballyStep;

#[async_trait]
impl Step for ProcessGloballyStep {
    fn name(&self) -> &'static str {
        "Process Globally"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        if ctx.early_exit {
            return Ok(());
        }
        let config = ctx.config_required()?.clone();

        let mut combined = Frame::concat(&ctx.processed_batches)?;
        ctx.processed_batches.clear();
        info!("Global stage: {} combined rows", combined.num_rows());

        for rule_config in config.cleaning_rules.iter().filter(|r| r.enabled) {
            let Some(rule) = find_rule(&rule_config.name) else {
                return Err(PipelineError::validation(format!(
                    "unknown cleaning rule '{}'",
                    rule_config.name
                )));
            };
            if rule.is_batch_safe() {
                continue; // already ran in the batch stage
            }
            ctx.cancel.ensure_active()?;
            combined = apply_rule(
                rule.as_ref(),
                &combined,
                &rule_config.params,
                &config.target_column,
            )?;
        }

        if combined.is_empty() {
            ctx.warn("No rows survived global cleaning".to_string());
            ctx.early_exit = true;
            ctx.frame = Some(combined);
            return Ok(());
        }

        if let Some(selection) = &config.feature_selection {
            let algorithm = find_algorithm(&selection.name).ok_or_else(|| {
                PipelineError::validation(format!(
                    "unknown feature selection algorithm '{}'",
                    selection.name
                ))
            })?;
            let present: Vec<String> = config
                .feature_columns
                .iter()
                .filter(|c| combined.has_column(c))
                .cloned()
                .collect();
            let kept = algorithm.select(
                &combined,
                &present,
                &config.target_column,
                &selection.params,
            )?;
            info!(
                "Feature selection '{}' kept {}/{} features",
                selection.name,
                kept.len(),
                present.len()
            );
            ctx.selected_features = Some(kept);
        }

        ctx.frame = Some(combined);
        Ok(())
    }
}

// ============================================================================
// SelectFinalColumns
// ============================================================================

/// Enforce that every configured (or selected) feature column and the target
/// exist, then project the output frame.
pub struct SelectFinalColumnsStep;

#[async_trait]
impl Step for SelectFinalColumnsStep {
    fn name(&self) -> &'static str {
        "Select Final Columns"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        if ctx.early_exit {
            return Ok(());
        }
        let config = ctx.config_required()?.clone();
        let frame = ctx.frame_required()?;

        let features: Vec<String> = ctx
            .selected_features
            .clone()
            .unwrap_or_else(|| config.feature_columns.clone());

        let mut missing: Vec<&String> = features
            .iter()
            .filter(|c| !frame.has_column(c))
            .collect();
        if !frame.has_column(&config.target_column) {
            missing.push(&config.target_column);
        }
        if !missing.is_empty() {
            return Err(PipelineError::validation(format!(
                "missing required columns: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut columns: Vec<String> = IDENTIFIER_COLUMNS
            .iter()
            .filter(|c| frame.has_column(c))
            .map(|s| s.to_string())
            .collect();
        columns.extend(features.iter().cloned());
        columns.push(config.target_column.clone());

        let selected = frame.select(&columns)?;
        ctx.final_frame = Some(selected);
        Ok(())
    }
}

// ============================================================================
// WriteOutput
// ============================================================================

/// Write the main artifact and the background sample, then move the dataset
/// to `ready`. Any failure marks the dataset `failed` and best-effort cleans
/// both URIs.
pub struct WriteOutputStep;

#[async_trait]
impl Step for WriteOutputStep {
    fn name(&self) -> &'static str {
        "Write Output"
    }

    async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()> {
        let dataset_id = ctx
            .dataset_id
            .ok_or_else(|| PipelineError::validation("job has no dataset id"))?;

        if ctx.early_exit {
            let msg = "No rows to write; dataset generation produced an empty result";
            deps.datasets.mark_failed(dataset_id, msg).await?;
            return Err(PipelineError::validation(msg));
        }

        let frame = ctx
            .final_frame
            .clone()
            .ok_or_else(|| PipelineError::Frame("no final frame to write".to_string()))?;
        ctx.rows_written = frame.num_rows();

        let main_uri = dataset_uri(&deps.artifact_scheme, &deps.artifact_bucket, dataset_id);
        let sample_uri =
            background_sample_uri(&deps.artifact_scheme, &deps.artifact_bucket, dataset_id);

        let result = self
            .write_artifacts(ctx, deps, frame, &main_uri, &sample_uri)
            .await;

        match result {
            Ok(background_written) => {
                let background = background_written.then_some(sample_uri.as_str());
                let mut message = format!("Dataset generated ({} rows).", ctx.rows_written);
                message.push_str(if background.is_some() {
                    " Background sample created."
                } else {
                    " Background sample skipped."
                });

                self.persist_selected_features(ctx, deps, dataset_id).await;

                let updated = deps
                    .datasets
                    .mark_ready(dataset_id, &main_uri, background, ctx.rows_written as i64, &message)
                    .await?;
                if !updated {
                    // The artifact exists but the row refused the transition.
                    error!(
                        "CRITICAL: dataset {} artifact written but status not updated to ready",
                        dataset_id
                    );
                    ctx.warn("CRITICAL: failed to update dataset status to ready".to_string());
                }
                ctx.output_storage_uri = Some(main_uri);
                ctx.background_sample_uri = background.map(str::to_string);
                Ok(())
            }
            Err(e) => {
                let fail_msg = format!("Failed during output write: {}", e);
                deps.datasets.mark_failed(dataset_id, &fail_msg).await?;
                if let Err(cleanup) = deps.store.delete(&main_uri) {
                    warn!("Cleanup of {} failed: {}", main_uri, cleanup);
                }
                if let Err(cleanup) = deps.store.delete(&sample_uri) {
                    warn!("Cleanup of {} failed: {}", sample_uri, cleanup);
                }
                Err(e)
            }
        }
    }
}

impl WriteOutputStep {
    /// Write main + background artifacts. Returns whether the background
    /// sample was written.
    async fn write_artifacts(
        &self,
        ctx: &mut Context,
        deps: &Dependencies,
        frame: Frame,
        main_uri: &str,
        sample_uri: &str,
    ) -> Result<bool> {
        // Clear pre-existing objects so a re-run never appends.
        deps.store.delete(main_uri)?;
        deps.store.delete(sample_uri)?;

        let batch = frame.to_record_batch()?;
        let bytes = batches_to_parquet(&[batch])?;
        deps.store.put_bytes(main_uri, &bytes)?;
        info!("Main dataset written to {}", main_uri);

        if frame.num_rows() < BACKGROUND_MIN_ROWS {
            warn!(
                "Dataset too small ({} rows) for background sampling (min: {})",
                frame.num_rows(),
                BACKGROUND_MIN_ROWS
            );
            return Ok(false);
        }

        let sample = frame.sample(BACKGROUND_TARGET_ROWS, BACKGROUND_SAMPLE_SEED)?;
        match frame_to_store(deps, &sample, sample_uri) {
            Ok(()) => {
                info!(
                    "Background sample ({} rows) written to {}",
                    sample.num_rows(),
                    sample_uri
                );
                Ok(true)
            }
            Err(e) => {
                // Main artifact is good; a missing sample degrades XAI only.
                warn!("Background sample write failed: {}", e);
                ctx.warn(format!("Background sample write failed: {}", e));
                Ok(false)
            }
        }
    }

    /// Persist the narrowed feature set back onto the dataset config.
    async fn persist_selected_features(
        &self,
        ctx: &Context,
        deps: &Dependencies,
        dataset_id: i64,
    ) {
        let Some(selected) = &ctx.selected_features else {
            return;
        };
        let Some(config) = &ctx.dataset_config else {
            return;
        };
        if *selected == config.feature_columns {
            return;
        }
        let mut updated = config.clone();
        updated.feature_columns = selected.clone();
        if let Err(e) = deps.datasets.update_config(dataset_id, &updated).await {
            warn!(
                "Failed to persist selected feature columns for dataset {}: {}",
                dataset_id, e
            );
        } else {
            info!(
                "Dataset {} config updated with {} selected features",
                dataset_id,
                selected.len()
            );
        }
    }
}

fn frame_to_store(deps: &Dependencies, frame: &Frame, uri: &str) -> Result<()> {
    let batch = frame.to_record_batch()?;
    let bytes = batches_to_parquet(&[batch])?;
    deps.store.put_bytes(uri, &bytes)?;
    Ok(())
}
