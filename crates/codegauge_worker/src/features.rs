//! Feature-selection algorithms.
//!
//! Like cleaning rules these are compiled-in plug-ins with parameter
//! schemas, projected into `cg_feature_selection_defs` at startup. Both
//! algorithms rank features by Pearson correlation against the target.

use std::sync::Arc;

use codegauge_pipeline::{Frame, PipelineError};
use codegauge_protocol::{
    CapabilityDescriptor, ConfigMap, HyperparameterSpec, ParamRange, ParamType,
};
use tracing::debug;

type Result<T> = std::result::Result<T, PipelineError>;

pub trait FeatureSelection: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        Vec::new()
    }

    /// Return the kept feature columns, a subset of `feature_columns`.
    fn select(
        &self,
        frame: &Frame,
        feature_columns: &[String],
        target_column: &str,
        params: &ConfigMap,
    ) -> Result<Vec<String>>;
}

pub fn feature_selection_registry() -> Vec<Arc<dyn FeatureSelection>> {
    vec![Arc::new(CorrelationFilter), Arc::new(MrmrSelection)]
}

pub fn find_algorithm(name: &str) -> Option<Arc<dyn FeatureSelection>> {
    feature_selection_registry()
        .into_iter()
        .find(|algo| algo.name() == name)
}

pub fn feature_selection_descriptors() -> Vec<CapabilityDescriptor> {
    feature_selection_registry()
        .iter()
        .map(|algo| CapabilityDescriptor {
            name: algo.name().to_string(),
            display_name: algo.display_name().to_string(),
            description: algo.description().to_string(),
            parameter_schema: serde_json::to_value(algo.parameter_schema())
                .unwrap_or_else(|_| serde_json::json!([])),
        })
        .collect()
}

/// Pearson correlation between two equal-length vectors, 0.0 for degenerate
/// inputs.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a < 1e-24 || var_b < 1e-24 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

fn numeric_column(frame: &Frame, name: &str) -> Result<Vec<f64>> {
    let col = frame.column_required(name)?;
    Ok((0..frame.num_rows())
        .map(|row| col.as_f64(row).unwrap_or(0.0))
        .collect())
}

fn param_usize(params: &ConfigMap, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn param_f64(params: &ConfigMap, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

// ============================================================================
// Correlation filter (CBFS-style)
// ============================================================================

struct CorrelationFilter;

impl FeatureSelection for CorrelationFilter {
    fn name(&self) -> &'static str {
        "correlation_filter"
    }

    fn display_name(&self) -> &'static str {
        "Correlation Filter"
    }

    fn description(&self) -> &'static str {
        "Keeps features whose absolute correlation with the target clears a threshold."
    }

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        vec![HyperparameterSpec {
            name: "threshold".into(),
            param_type: ParamType::Float,
            default: Some(serde_json::json!(0.05)),
            range: Some(ParamRange {
                min: Some(0.0),
                max: Some(1.0),
                step: None,
                log: None,
            }),
            options: None,
            required: false,
        }]
    }

    fn select(
        &self,
        frame: &Frame,
        feature_columns: &[String],
        target_column: &str,
        params: &ConfigMap,
    ) -> Result<Vec<String>> {
        let threshold = param_f64(params, "threshold", 0.05);
        let target = numeric_column(frame, target_column)?;

        let mut kept = Vec::new();
        for feature in feature_columns {
            let values = numeric_column(frame, feature)?;
            let corr = pearson(&values, &target).abs();
            if corr >= threshold {
                kept.push(feature.clone());
            } else {
                debug!("Dropping '{}' (|corr|={:.4} < {:.4})", feature, corr, threshold);
            }
        }

        // Never return an empty feature set: fall back to the strongest one.
        if kept.is_empty() {
            let best = feature_columns
                .iter()
                .map(|f| {
                    let values = numeric_column(frame, f)?;
                    Ok((f.clone(), pearson(&values, &target).abs()))
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((name, _)) = best {
                kept.push(name);
            }
        }
        Ok(kept)
    }
}

// ============================================================================
// mRMR (minimum redundancy, maximum relevance)
// ============================================================================

struct MrmrSelection;

impl FeatureSelection for MrmrSelection {
    fn name(&self) -> &'static str {
        "mrmr"
    }

    fn display_name(&self) -> &'static str {
        "mRMR"
    }

    fn description(&self) -> &'static str {
        "Greedy selection maximizing target relevance minus mean redundancy."
    }

    fn parameter_schema(&self) -> Vec<HyperparameterSpec> {
        vec![HyperparameterSpec {
            name: "k".into(),
            param_type: ParamType::Integer,
            default: Some(serde_json::json!(10)),
            range: Some(ParamRange {
                min: Some(1.0),
                max: Some(500.0),
                step: Some(1.0),
                log: None,
            }),
            options: None,
            required: false,
        }]
    }

    fn select(
        &self,
        frame: &Frame,
        feature_columns: &[String],
        target_column: &str,
        params: &ConfigMap,
    ) -> Result<Vec<String>> {
        let k = param_usize(params, "k", 10).min(feature_columns.len());
        let target = numeric_column(frame, target_column)?;

        let values: Vec<Vec<f64>> = feature_columns
            .iter()
            .map(|f| numeric_column(frame, f))
            .collect::<Result<_>>()?;
        let relevance: Vec<f64> = values.iter().map(|v| pearson(v, &target).abs()).collect();

        let mut selected: Vec<usize> = Vec::with_capacity(k);
        let mut remaining: Vec<usize> = (0..feature_columns.len()).collect();

        while selected.len() < k && !remaining.is_empty() {
            let mut best: Option<(usize, f64)> = None;
            for (pos, &candidate) in remaining.iter().enumerate() {
                let redundancy = if selected.is_empty() {
                    0.0
                } else {
                    selected
                        .iter()
                        .map(|&s| pearson(&values[candidate], &values[s]).abs())
                        .sum::<f64>()
                        / selected.len() as f64
                };
                let score = relevance[candidate] - redundancy;
                if best.map_or(true, |(_, b)| score > b) {
                    best = Some((pos, score));
                }
            }
            let Some((pos, _)) = best else {
                break;
            };
            selected.push(remaining.remove(pos));
        }

        selected.sort_unstable();
        Ok(selected
            .into_iter()
            .map(|i| feature_columns[i].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegauge_pipeline::ColumnData;

    fn frame() -> (Frame, Vec<String>) {
        let mut frame = Frame::new();
        let n = 50;
        let signal: Vec<Option<f64>> = (0..n).map(|i| Some(i as f64)).collect();
        let copy: Vec<Option<f64>> = (0..n).map(|i| Some(i as f64 * 2.0)).collect();
        let noise: Vec<Option<f64>> = (0..n).map(|i| Some(((i * 37) % 11) as f64)).collect();
        let target: Vec<Option<f64>> = (0..n).map(|i| Some(f64::from(i >= 25))).collect();

        frame.set_column("signal", ColumnData::Float(signal)).unwrap();
        frame.set_column("copy", ColumnData::Float(copy)).unwrap();
        frame.set_column("noise", ColumnData::Float(noise)).unwrap();
        frame.set_column("is_buggy", ColumnData::Float(target)).unwrap();

        (
            frame,
            vec!["signal".into(), "copy".into(), "noise".into()],
        )
    }

    #[test]
    fn test_pearson_bounds() {
        let a: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..10).map(|i| i as f64 * -3.0).collect();
        assert!((pearson(&a, &a) - 1.0).abs() < 1e-9);
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-9);
        assert_eq!(pearson(&a, &vec![5.0; 10]), 0.0);
    }

    #[test]
    fn test_correlation_filter_drops_noise() {
        let (frame, features) = frame();
        let mut params = ConfigMap::new();
        params.insert("threshold".into(), serde_json::json!(0.5));
        let kept = CorrelationFilter
            .select(&frame, &features, "is_buggy", &params)
            .unwrap();
        assert!(kept.contains(&"signal".to_string()));
        assert!(!kept.contains(&"noise".to_string()));
    }

    #[test]
    fn test_correlation_filter_never_empty() {
        let (frame, features) = frame();
        let mut params = ConfigMap::new();
        params.insert("threshold".into(), serde_json::json!(1.0));
        let kept = CorrelationFilter
            .select(&frame, &features, "is_buggy", &params)
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_mrmr_avoids_redundant_copy() {
        let (frame, features) = frame();
        let mut params = ConfigMap::new();
        params.insert("k".into(), serde_json::json!(2));
        let kept = MrmrSelection
            .select(&frame, &features, "is_buggy", &params)
            .unwrap();
        assert_eq!(kept.len(), 2);
        // signal and copy are perfectly correlated; mRMR keeps one of them
        // plus the uncorrelated noise column.
        assert!(kept.contains(&"noise".to_string()));
    }

    #[test]
    fn test_registry() {
        assert!(find_algorithm("mrmr").is_some());
        assert!(find_algorithm("pca").is_none());
        assert_eq!(feature_selection_descriptors().len(), 2);
    }
}
