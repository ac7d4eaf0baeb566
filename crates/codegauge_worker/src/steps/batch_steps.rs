//! Per-batch sub-steps run by the batch orchestrator.
//!
//! Each operates on the batch child context's frame. A sub-step that leaves
//! the frame empty short-circuits the rest of the batch.

use std::collections::HashMap;

use async_trait::async_trait;
use codegauge_pipeline::{ColumnData, Context, Dependencies, PipelineError, Result, Step};
use tracing::debug;

use crate::botmatch::BotMatcher;
use crate::cleaning::{apply_rule, find_rule};
use crate::dataio::CK_METRIC_COLUMNS;

/// File extensions that carry no analyzable code.
const NON_CODE_EXTENSIONS: &[&str] = &[
    ".md", ".txt", ".rst", ".json", ".yml", ".yaml", ".lock", ".svg", ".png", ".jpg", ".gif",
];

/// Drop rows authored by bots, per the repository's bot patterns.
pub struct ApplyBotPatternsStep;

#[async_trait]
impl Step for ApplyBotPatternsStep {
    fn name(&self) -> &'static str {
        "Apply Bot Patterns"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let frame = ctx.frame_required()?;
        let Some(authors) = frame.column("author_name") else {
            return Ok(());
        };
        let matcher = BotMatcher::compile(&ctx.bot_patterns);
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| !authors.as_str(row).map_or(false, |a| matcher.is_bot(a)))
            .collect();
        let filtered = frame.filter(&mask)?;
        ctx.frame = Some(filtered);
        Ok(())
    }
}

/// Drop rows for files that cannot carry defects (docs, assets, lockfiles).
pub struct ApplyFileFiltersStep;

#[async_trait]
impl Step for ApplyFileFiltersStep {
    fn name(&self) -> &'static str {
        "Apply File Filters"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let frame = ctx.frame_required()?;
        let Some(files) = frame.column("file") else {
            return Ok(());
        };
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| match files.as_str(row) {
                None => false,
                Some(path) => {
                    let lower = path.to_ascii_lowercase();
                    !NON_CODE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
                }
            })
            .collect();
        let filtered = frame.filter(&mask)?;
        ctx.frame = Some(filtered);
        Ok(())
    }
}

/// Per-row enrichment: total churn and churn per churned file.
pub struct CalculateCommitStatsStep;

#[async_trait]
impl Step for CalculateCommitStatsStep {
    fn name(&self) -> &'static str {
        "Calculate Commit Stats"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let frame = ctx.frame_required()?;
        let rows = frame.num_rows();
        let la = frame.column("la");
        let ld = frame.column("ld");
        let files = frame.column("files_churned");

        let mut churn = Vec::with_capacity(rows);
        let mut churn_per_file = Vec::with_capacity(rows);
        for row in 0..rows {
            let total = match (
                la.and_then(|c| c.as_f64(row)),
                ld.and_then(|c| c.as_f64(row)),
            ) {
                (Some(a), Some(d)) => Some(a + d),
                (Some(a), None) => Some(a),
                (None, Some(d)) => Some(d),
                (None, None) => None,
            };
            churn.push(total);
            let per_file = match (total, files.and_then(|c| c.as_f64(row))) {
                (Some(t), Some(f)) if f > 0.0 => Some(t / f),
                (Some(t), _) => Some(t),
                _ => None,
            };
            churn_per_file.push(per_file);
        }

        if let Some(frame) = ctx.frame.as_mut() {
            frame.set_column("churn", ColumnData::Float(churn))?;
            frame.set_column("churn_per_file", ColumnData::Float(churn_per_file))?;
        }
        Ok(())
    }
}

fn parent_column_name(ck: &str) -> String {
    format!("parent_{}", ck)
}

fn delta_column_name(ck: &str) -> String {
    format!("d_{}", ck)
}

/// Join each row to its parent commit's class metrics.
pub struct GetParentMetricsStep;

#[async_trait]
impl Step for GetParentMetricsStep {
    fn name(&self) -> &'static str {
        "Get Parent Metrics"
    }

    async fn run(&self, ctx: &mut Context, deps: &Dependencies) -> Result<()> {
        let repository_id = ctx
            .repository
            .as_ref()
            .map(|r| r.id)
            .ok_or_else(|| PipelineError::validation("repository missing in context"))?;
        let frame = ctx.frame_required()?;
        let rows = frame.num_rows();

        let parents = frame.column_required("parent_hash")?;
        let files = frame.column_required("file")?;
        let classes = frame.column_required("class_name")?;

        // One query per distinct parent hash in the batch.
        let mut parent_rows: HashMap<String, HashMap<(String, String), Vec<Option<f64>>>> =
            HashMap::new();
        for row in 0..rows {
            let Some(parent) = parents.as_str(row) else {
                continue;
            };
            if parent_rows.contains_key(parent) {
                continue;
            }
            let cks = deps
                .metrics
                .ck_metrics_for_commit(repository_id, parent)
                .await?;
            let mut by_key = HashMap::new();
            for ck in cks {
                by_key.insert(
                    (ck.file_path.clone(), ck.class_name.clone()),
                    vec![ck.cbo, ck.wmc, ck.dit, ck.rfc, ck.lcom, ck.loc],
                );
            }
            parent_rows.insert(parent.to_string(), by_key);
        }
        debug!("Fetched parent metrics for {} commits", parent_rows.len());

        let mut columns: Vec<Vec<Option<f64>>> =
            vec![Vec::with_capacity(rows); CK_METRIC_COLUMNS.len()];
        for row in 0..rows {
            let lookup = parents.as_str(row).and_then(|parent| {
                let file = files.as_str(row).unwrap_or("");
                let class = classes.as_str(row).unwrap_or("");
                parent_rows
                    .get(parent)
                    .and_then(|m| m.get(&(file.to_string(), class.to_string())))
            });
            for (i, col) in columns.iter_mut().enumerate() {
                col.push(lookup.and_then(|values| values[i]));
            }
        }

        if let Some(frame) = ctx.frame.as_mut() {
            for (ck, values) in CK_METRIC_COLUMNS.iter().zip(columns) {
                frame.set_column(&parent_column_name(ck), ColumnData::Float(values))?;
            }
        }
        Ok(())
    }
}

/// Delta features: current minus parent class metrics.
pub struct CalculateDeltaMetricsStep;

#[async_trait]
impl Step for CalculateDeltaMetricsStep {
    fn name(&self) -> &'static str {
        "Calculate Delta Metrics"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let frame = ctx.frame_required()?;
        let rows = frame.num_rows();

        let mut deltas = Vec::with_capacity(CK_METRIC_COLUMNS.len());
        for ck in CK_METRIC_COLUMNS {
            let current = frame.column_required(ck)?;
            let parent = frame.column_required(&parent_column_name(ck))?;
            let values: Vec<Option<f64>> = (0..rows)
                .map(|row| match (current.as_f64(row), parent.as_f64(row)) {
                    (Some(c), Some(p)) => Some(c - p),
                    _ => None,
                })
                .collect();
            deltas.push(values);
        }

        if let Some(frame) = ctx.frame.as_mut() {
            for (ck, values) in CK_METRIC_COLUMNS.iter().zip(deltas) {
                frame.set_column(&delta_column_name(ck), ColumnData::Float(values))?;
            }
        }
        Ok(())
    }
}

/// Apply the configured batch-safe cleaning rules.
pub struct ApplyBatchCleaningRulesStep;

#[async_trait]
impl Step for ApplyBatchCleaningRulesStep {
    fn name(&self) -> &'static str {
        "Apply Batch Cleaning Rules"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let config = ctx.config_required()?.clone();
        let mut frame = ctx.frame_required()?.clone();

        for rule_config in config.cleaning_rules.iter().filter(|r| r.enabled) {
            let Some(rule) = find_rule(&rule_config.name) else {
                return Err(PipelineError::validation(format!(
                    "unknown cleaning rule '{}'",
                    rule_config.name
                )));
            };
            if !rule.is_batch_safe() {
                continue; // routed to the global stage
            }
            frame = apply_rule(
                rule.as_ref(),
                &frame,
                &rule_config.params,
                &config.target_column,
            )?;
            if frame.is_empty() {
                break;
            }
        }

        ctx.frame = Some(frame);
        Ok(())
    }
}

/// Drop rows whose parent commit has no class metrics: delta features would
/// be undefined.
pub struct DropMissingParentsStep;

#[async_trait]
impl Step for DropMissingParentsStep {
    fn name(&self) -> &'static str {
        "Drop Missing Parents"
    }

    async fn run(&self, ctx: &mut Context, _deps: &Dependencies) -> Result<()> {
        let frame = ctx.frame_required()?;
        let parents = frame.column_required("parent_hash")?;
        let parent_probe = frame.column_required(&parent_column_name(CK_METRIC_COLUMNS[0]))?;

        let before = frame.num_rows();
        let mask: Vec<bool> = (0..before)
            .map(|row| parents.as_str(row).is_some() && parent_probe.as_f64(row).is_some())
            .collect();
        let filtered = frame.filter(&mask)?;
        if filtered.num_rows() < before {
            debug!(
                "Dropped {} rows with missing parent metrics",
                before - filtered.num_rows()
            );
        }
        ctx.frame = Some(filtered);
        Ok(())
    }
}

/// The inner strategy the batch orchestrator runs over every batch.
pub fn batch_strategy() -> codegauge_pipeline::Strategy {
    use std::sync::Arc;
    vec![
        Arc::new(ApplyBotPatternsStep),
        Arc::new(ApplyFileFiltersStep),
        Arc::new(CalculateCommitStatsStep),
        Arc::new(GetParentMetricsStep),
        Arc::new(CalculateDeltaMetricsStep),
        Arc::new(ApplyBatchCleaningRulesStep),
        Arc::new(DropMissingParentsStep),
    ]
}
