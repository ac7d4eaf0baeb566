//! Cleaning rules.
//!
//! Each rule is a compiled-in plug-in with a typed parameter schema; the
//! registry sync projects the set into `cg_cleaning_rule_defs` at startup.
//! `is_batch_safe` routes a rule to the batch or global stage: a rule whose
//! decision depends on rows outside the current batch must run globally.

use std::collections::BTreeMap;
use std::sync::Arc;

use codegauge_pipeline::{ColumnData, Frame, PipelineError};
use codegauge_protocol::{
    validate_params, CapabilityDescriptor, ConfigMap, HyperparameterSpec, ParamRange, ParamType,
};
use tracing::debug;

type Result<T> = std::result::Result<T, PipelineError>;

pub trait CleaningRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Whether applying the rule per batch yields the same result as
    /// applying it to the full dataset.
    fn is_batch_safe(&self) -> bool;

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        Vec::new()
    }

    /// Apply the rule, returning the filtered frame.
    fn apply(&self, frame: &Frame, params: &ConfigMap, target_column: &str) -> Result<Frame>;
}

/// All compiled-in rules, in registry order.
pub fn cleaning_rule_registry() -> Vec<Arc<dyn CleaningRule>> {
    vec![
        Arc::new(DropDuplicates),
        Arc::new(RemoveEmptyClass),
        Arc::new(RemoveNoAddedLines),
        Arc::new(RemoveMinimalChange),
        Arc::new(FilterLargeCommits),
        Arc::new(RemoveRecentCleanLastChange),
    ]
}

pub fn find_rule(name: &str) -> Option<Arc<dyn CleaningRule>> {
    cleaning_rule_registry()
        .into_iter()
        .find(|rule| rule.name() == name)
}

/// Registry descriptors for the capability sync.
pub fn cleaning_rule_descriptors() -> Vec<CapabilityDescriptor> {
    cleaning_rule_registry()
        .iter()
        .map(|rule| CapabilityDescriptor {
            name: rule.name().to_string(),
            display_name: rule.display_name().to_string(),
            description: rule.description().to_string(),
            parameter_schema: serde_json::to_value(rule.parameter_schema())
                .unwrap_or_else(|_| serde_json::json!([])),
        })
        .collect()
}

/// Validate configured params and apply one rule.
pub fn apply_rule(
    rule: &dyn CleaningRule,
    frame: &Frame,
    params: &ConfigMap,
    target_column: &str,
) -> Result<Frame> {
    let schema = rule.parameter_schema();
    let param_map: BTreeMap<String, serde_json::Value> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    validate_params(&schema, &param_map).map_err(|e| {
        PipelineError::validation(format!("cleaning rule '{}': {}", rule.name(), e))
    })?;

    let before = frame.num_rows();
    let out = rule.apply(frame, params, target_column)?;
    debug!(
        "Cleaning rule '{}' kept {}/{} rows",
        rule.name(),
        out.num_rows(),
        before
    );
    Ok(out)
}

fn param_f64(params: &ConfigMap, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

// ============================================================================
// Rules
// ============================================================================

/// Row-identity de-duplication. Depends on every other row, so it is not
/// batch safe and runs only in the global stage.
struct DropDuplicates;

impl CleaningRule for DropDuplicates {
    fn name(&self) -> &'static str {
        "drop_duplicates"
    }

    fn display_name(&self) -> &'static str {
        "Drop Duplicates"
    }

    fn description(&self) -> &'static str {
        "Removes rows duplicated on commit hash, file and class."
    }

    fn is_batch_safe(&self) -> bool {
        false
    }

    fn apply(&self, frame: &Frame, _params: &ConfigMap, _target: &str) -> Result<Frame> {
        let keys: Vec<String> = ["commit_hash", "file", "class_name"]
            .iter()
            .filter(|name| frame.has_column(name))
            .map(|s| s.to_string())
            .collect();
        if keys.is_empty() {
            return Ok(frame.clone());
        }
        frame.dedup_on(&keys)
    }
}

/// Rows with no class identity carry no class-level metrics worth learning
/// from.
struct RemoveEmptyClass;

impl CleaningRule for RemoveEmptyClass {
    fn name(&self) -> &'static str {
        "remove_empty_class"
    }

    fn display_name(&self) -> &'static str {
        "Remove Empty Class"
    }

    fn description(&self) -> &'static str {
        "Removes rows whose class name is missing or empty."
    }

    fn is_batch_safe(&self) -> bool {
        true
    }

    fn apply(&self, frame: &Frame, _params: &ConfigMap, _target: &str) -> Result<Frame> {
        let Some(col) = frame.column("class_name") else {
            return Ok(frame.clone());
        };
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| col.as_str(row).is_some_and(|s| !s.is_empty()))
            .collect();
        frame.filter(&mask)
    }
}

/// Pure deletions tell the model nothing about newly introduced defects.
struct RemoveNoAddedLines;

impl CleaningRule for RemoveNoAddedLines {
    fn name(&self) -> &'static str {
        "remove_no_added_lines"
    }

    fn display_name(&self) -> &'static str {
        "Remove No Added Lines"
    }

    fn description(&self) -> &'static str {
        "Removes rows whose commit added no lines."
    }

    fn is_batch_safe(&self) -> bool {
        true
    }

    fn apply(&self, frame: &Frame, _params: &ConfigMap, _target: &str) -> Result<Frame> {
        let Some(col) = frame.column("la") else {
            return Ok(frame.clone());
        };
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| col.as_f64(row).is_some_and(|la| la > 0.0))
            .collect();
        frame.filter(&mask)
    }
}

/// Trivial one-liner changes are noise for defect labelling.
struct RemoveMinimalChange;

impl CleaningRule for RemoveMinimalChange {
    fn name(&self) -> &'static str {
        "remove_minimal_change"
    }

    fn display_name(&self) -> &'static str {
        "Remove Minimal Change"
    }

    fn description(&self) -> &'static str {
        "Removes rows whose commit churn falls below a minimum line count."
    }

    fn is_batch_safe(&self) -> bool {
        true
    }

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        vec![HyperparameterSpec {
            name: "min_lines".into(),
            param_type: ParamType::Integer,
            default: Some(serde_json::json!(2)),
            range: Some(ParamRange {
                min: Some(1.0),
                max: Some(1000.0),
                step: Some(1.0),
                log: None,
            }),
            options: None,
            required: false,
        }]
    }

    fn apply(&self, frame: &Frame, params: &ConfigMap, _target: &str) -> Result<Frame> {
        let min_lines = param_f64(params, "min_lines", 2.0);
        let (Some(la), Some(ld)) = (frame.column("la"), frame.column("ld")) else {
            return Ok(frame.clone());
        };
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| {
                let churn = la.as_f64(row).unwrap_or(0.0) + ld.as_f64(row).unwrap_or(0.0);
                churn >= min_lines
            })
            .collect();
        frame.filter(&mask)
    }
}

/// Bulk refactors and vendored imports drown the signal of targeted changes.
struct FilterLargeCommits;

impl CleaningRule for FilterLargeCommits {
    fn name(&self) -> &'static str {
        "filter_large_commits"
    }

    fn display_name(&self) -> &'static str {
        "Filter Large Commits"
    }

    fn description(&self) -> &'static str {
        "Removes rows from commits touching more files than a threshold."
    }

    fn is_batch_safe(&self) -> bool {
        true
    }

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        vec![HyperparameterSpec {
            name: "max_files".into(),
            param_type: ParamType::Integer,
            default: Some(serde_json::json!(100)),
            range: Some(ParamRange {
                min: Some(1.0),
                max: Some(10_000.0),
                step: Some(1.0),
                log: None,
            }),
            options: None,
            required: false,
        }]
    }

    fn apply(&self, frame: &Frame, params: &ConfigMap, _target: &str) -> Result<Frame> {
        let max_files = param_f64(params, "max_files", 100.0);
        let Some(col) = frame.column("files_churned") else {
            return Ok(frame.clone());
        };
        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| col.as_f64(row).map_or(true, |files| files <= max_files))
            .collect();
        frame.filter(&mask)
    }
}

/// Recently-changed clean rows may still flip to buggy once defects surface;
/// the cutoff depends on the dataset-wide newest timestamp, so the rule is
/// global.
struct RemoveRecentCleanLastChange;

const SECONDS_PER_DAY: f64 = 86_400.0;

impl CleaningRule for RemoveRecentCleanLastChange {
    fn name(&self) -> &'static str {
        "remove_recent_clean_last_change"
    }

    fn display_name(&self) -> &'static str {
        "Remove Recent Clean Last Change"
    }

    fn description(&self) -> &'static str {
        "Removes clean rows authored within a recency window of the newest commit."
    }

    fn is_batch_safe(&self) -> bool {
        false
    }

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        vec![HyperparameterSpec {
            name: "recent_days".into(),
            param_type: ParamType::Integer,
            default: Some(serde_json::json!(90)),
            range: Some(ParamRange {
                min: Some(1.0),
                max: Some(3650.0),
                step: Some(1.0),
                log: None,
            }),
            options: None,
            required: false,
        }]
    }

    fn apply(&self, frame: &Frame, params: &ConfigMap, target: &str) -> Result<Frame> {
        let recent_days = param_f64(params, "recent_days", 90.0);
        let (Some(ts), Some(label)) = (frame.column("author_date_ts"), frame.column(target))
        else {
            return Ok(frame.clone());
        };

        let newest = (0..frame.num_rows())
            .filter_map(|row| ts.as_f64(row))
            .fold(f64::NEG_INFINITY, f64::max);
        if !newest.is_finite() {
            return Ok(frame.clone());
        }
        let cutoff = newest - recent_days * SECONDS_PER_DAY;

        let mask: Vec<bool> = (0..frame.num_rows())
            .map(|row| {
                let is_clean = label.as_f64(row).is_some_and(|l| l < 0.5);
                let is_recent = ts.as_f64(row).is_some_and(|t| t >= cutoff);
                !(is_clean && is_recent)
            })
            .collect();
        frame.filter(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_churn() -> Frame {
        let mut frame = Frame::new();
        frame
            .set_column(
                "commit_hash",
                ColumnData::Str(vec![Some("a".into()), Some("a".into()), Some("b".into())]),
            )
            .unwrap();
        frame
            .set_column(
                "file",
                ColumnData::Str(vec![Some("x".into()), Some("x".into()), Some("y".into())]),
            )
            .unwrap();
        frame
            .set_column(
                "class_name",
                ColumnData::Str(vec![Some("C".into()), Some("C".into()), Some("".into())]),
            )
            .unwrap();
        frame
            .set_column("la", ColumnData::Float(vec![Some(0.0), Some(5.0), Some(3.0)]))
            .unwrap();
        frame
            .set_column("ld", ColumnData::Float(vec![Some(1.0), Some(0.0), Some(0.0)]))
            .unwrap();
        frame
    }

    #[test]
    fn test_drop_duplicates_is_global() {
        let rule = DropDuplicates;
        assert!(!rule.is_batch_safe());
        let out = rule
            .apply(&frame_with_churn(), &ConfigMap::new(), "is_buggy")
            .unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_remove_empty_class() {
        let out = RemoveEmptyClass
            .apply(&frame_with_churn(), &ConfigMap::new(), "is_buggy")
            .unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_remove_no_added_lines() {
        let out = RemoveNoAddedLines
            .apply(&frame_with_churn(), &ConfigMap::new(), "is_buggy")
            .unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_minimal_change_param_validated() {
        let rule = RemoveMinimalChange;
        let mut params = ConfigMap::new();
        params.insert("min_lines".into(), serde_json::json!("not a number"));
        let err =
            apply_rule(&rule, &frame_with_churn(), &params, "is_buggy").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_recent_clean_rule() {
        let mut frame = Frame::new();
        let day = SECONDS_PER_DAY;
        frame
            .set_column(
                "author_date_ts",
                ColumnData::Float(vec![Some(0.0), Some(100.0 * day), Some(95.0 * day)]),
            )
            .unwrap();
        frame
            .set_column(
                "is_buggy",
                ColumnData::Float(vec![Some(0.0), Some(0.0), Some(1.0)]),
            )
            .unwrap();

        let out = RemoveRecentCleanLastChange
            .apply(&frame, &ConfigMap::new(), "is_buggy")
            .unwrap();
        // old clean row stays, recent clean row dropped, recent buggy row stays
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn test_registry_names_unique() {
        let registry = cleaning_rule_registry();
        let mut names: Vec<&str> = registry.iter().map(|r| r.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), registry.len());
    }
}
