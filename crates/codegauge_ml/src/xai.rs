//! Explanation (XAI) strategies.
//!
//! Each strategy consumes a fitted model plus the inference feature rows and
//! a background sample, and produces a typed result object that is persisted
//! verbatim on the XAIResult row. Row counts are capped so explanation
//! payloads stay bounded regardless of commit size.

use codegauge_protocol::XaiType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::strategy::{ModelStrategy, PathStep};

/// Rows explained per job; inference frames beyond this are truncated.
pub const MAX_EXPLAINED_ROWS: usize = 50;

/// Per-row identifier carried alongside explanations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowIdent {
    pub file: Option<String>,
    pub class_name: Option<String>,
}

/// Input bundle for one explanation run.
pub struct ExplanationRequest<'a> {
    pub model: &'a dyn ModelStrategy,
    pub feature_names: &'a [String],
    /// Rows being explained (the inference features).
    pub features: &'a [Vec<f64>],
    /// Background distribution sample.
    pub background: &'a [Vec<f64>],
    pub identifiers: &'a [RowIdent],
}

impl ExplanationRequest<'_> {
    fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(MlError::invalid_input("no feature rows to explain"));
        }
        if self.background.is_empty() {
            return Err(MlError::invalid_input("empty background sample"));
        }
        Ok(())
    }

    fn capped_rows(&self) -> &[Vec<f64>] {
        &self.features[..self.features.len().min(MAX_EXPLAINED_ROWS)]
    }

    fn ident(&self, row: usize) -> RowIdent {
        self.identifiers.get(row).cloned().unwrap_or_default()
    }
}

/// Adapter over one explanation method.
pub trait XaiStrategy: Send + Sync {
    fn xai_type(&self) -> XaiType;
    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value>;
}

/// XAI types applicable to a model: the four model-agnostic families always,
/// decision paths only for tree-based models.
pub fn applicable_xai_types(tree_based: bool) -> Vec<XaiType> {
    let mut types = vec![
        XaiType::Shap,
        XaiType::Lime,
        XaiType::FeatureImportance,
        XaiType::Counterfactuals,
    ];
    if tree_based {
        types.push(XaiType::DecisionPath);
    }
    types
}

pub fn create_xai_strategy(xai_type: XaiType, tree_based: bool) -> Result<Box<dyn XaiStrategy>> {
    match xai_type {
        XaiType::Shap => Ok(Box::new(ShapStrategy)),
        XaiType::Lime => Ok(Box::new(LimeStrategy)),
        XaiType::FeatureImportance => Ok(Box::new(FeatureImportanceStrategy)),
        XaiType::Counterfactuals => Ok(Box::new(CounterfactualsStrategy)),
        XaiType::DecisionPath if tree_based => Ok(Box::new(DecisionPathStrategy)),
        XaiType::DecisionPath => {
            Err(MlError::UnsupportedXaiType("decision_path".to_string()))
        }
    }
}

fn column_means(rows: &[Vec<f64>], dims: usize) -> Vec<f64> {
    let mut means = vec![0.0; dims];
    for row in rows {
        for (m, v) in means.iter_mut().zip(row) {
            *m += v / rows.len() as f64;
        }
    }
    means
}

fn column_stds(rows: &[Vec<f64>], means: &[f64]) -> Vec<f64> {
    let mut stds = vec![0.0; means.len()];
    for row in rows {
        for ((s, v), m) in stds.iter_mut().zip(row).zip(means) {
            *s += (v - m).powi(2) / rows.len() as f64;
        }
    }
    stds.iter()
        .map(|s| {
            let s = s.sqrt();
            if s < 1e-12 {
                1.0
            } else {
                s
            }
        })
        .collect()
}

// ============================================================================
// SHAP-style additive attribution
// ============================================================================

/// Marginal-substitution attribution: a feature's value for a row is the
/// average prediction change when that feature is replaced with background
/// values. Additive in the same spirit as SHAP's single-feature marginals.
struct ShapStrategy;

#[derive(Debug, Serialize, Deserialize)]
struct ShapResult {
    base_value: f64,
    feature_names: Vec<String>,
    rows: Vec<ShapRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShapRow {
    #[serde(flatten)]
    ident: RowIdent,
    prediction: f64,
    values: Vec<f64>,
}

impl XaiStrategy for ShapStrategy {
    fn xai_type(&self) -> XaiType {
        XaiType::Shap
    }

    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value> {
        request.validate()?;
        let model = request.model;
        let rows = request.capped_rows();

        let background_proba = model.predict_proba(request.background)?;
        let base_value =
            background_proba.iter().sum::<f64>() / background_proba.len() as f64;

        let mut out_rows = Vec::with_capacity(rows.len());
        let row_proba = model.predict_proba(rows)?;
        for (row_idx, row) in rows.iter().enumerate() {
            let mut values = Vec::with_capacity(request.feature_names.len());
            for feature in 0..request.feature_names.len() {
                // Substitute this feature with each background row's value.
                let substituted: Vec<Vec<f64>> = request
                    .background
                    .iter()
                    .map(|bg| {
                        let mut v = row.clone();
                        v[feature] = bg[feature];
                        v
                    })
                    .collect();
                let sub_proba = model.predict_proba(&substituted)?;
                let mean_sub = sub_proba.iter().sum::<f64>() / sub_proba.len() as f64;
                values.push(row_proba[row_idx] - mean_sub);
            }
            out_rows.push(ShapRow {
                ident: request.ident(row_idx),
                prediction: row_proba[row_idx],
                values,
            });
        }

        Ok(serde_json::to_value(ShapResult {
            base_value,
            feature_names: request.feature_names.to_vec(),
            rows: out_rows,
        })?)
    }
}

// ============================================================================
// LIME-style local surrogate
// ============================================================================

/// Local surrogate: perturb a row, weight samples by proximity, fit a ridge
/// linear model and report its coefficients as local importances.
struct LimeStrategy;

const LIME_SAMPLES: usize = 200;
const LIME_RIDGE_LAMBDA: f64 = 1e-3;

#[derive(Debug, Serialize, Deserialize)]
struct LimeResult {
    feature_names: Vec<String>,
    rows: Vec<LimeRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LimeRow {
    #[serde(flatten)]
    ident: RowIdent,
    prediction: f64,
    intercept: f64,
    coefficients: Vec<f64>,
}

/// Solve `A x = b` by Gaussian elimination with partial pivoting. `A` is
/// small (one row/col per feature).
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(MlError::invalid_input("singular system in lime surrogate"));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in (row + 1)..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

impl XaiStrategy for LimeStrategy {
    fn xai_type(&self) -> XaiType {
        XaiType::Lime
    }

    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value> {
        request.validate()?;
        let model = request.model;
        let dims = request.feature_names.len();
        let means = column_means(request.background, dims);
        let stds = column_stds(request.background, &means);
        let mut rng = StdRng::seed_from_u64(42);

        let rows = request.capped_rows();
        let row_proba = model.predict_proba(rows)?;
        let mut out_rows = Vec::with_capacity(rows.len());

        for (row_idx, row) in rows.iter().enumerate() {
            // Perturb around the row, scaled by background spread.
            let mut samples = Vec::with_capacity(LIME_SAMPLES);
            for _ in 0..LIME_SAMPLES {
                let sample: Vec<f64> = row
                    .iter()
                    .zip(&stds)
                    .map(|(v, s)| v + rng.random_range(-1.0..=1.0) * s)
                    .collect();
                samples.push(sample);
            }
            let targets = model.predict_proba(&samples)?;

            // Proximity weights in standardized space.
            let weights: Vec<f64> = samples
                .iter()
                .map(|sample| {
                    let dist2: f64 = sample
                        .iter()
                        .zip(row)
                        .zip(&stds)
                        .map(|((s, r), sd)| ((s - r) / sd).powi(2))
                        .sum();
                    (-dist2 / dims as f64).exp()
                })
                .collect();

            // Weighted ridge regression with intercept: solve
            // (Z^T W Z + lambda I) beta = Z^T W t, Z = [1 | x].
            let cols = dims + 1;
            let mut ata = vec![vec![0.0; cols]; cols];
            let mut atb = vec![0.0; cols];
            for ((sample, &target), &w) in samples.iter().zip(&targets).zip(&weights) {
                let z: Vec<f64> = std::iter::once(1.0).chain(sample.iter().copied()).collect();
                for i in 0..cols {
                    for j in 0..cols {
                        ata[i][j] += w * z[i] * z[j];
                    }
                    atb[i] += w * z[i] * target;
                }
            }
            for (i, row_a) in ata.iter_mut().enumerate() {
                row_a[i] += LIME_RIDGE_LAMBDA;
            }

            let beta = solve_linear(ata, atb)?;
            out_rows.push(LimeRow {
                ident: request.ident(row_idx),
                prediction: row_proba[row_idx],
                intercept: beta[0],
                coefficients: beta[1..].to_vec(),
            });
        }

        Ok(serde_json::to_value(LimeResult {
            feature_names: request.feature_names.to_vec(),
            rows: out_rows,
        })?)
    }
}

// ============================================================================
// Global feature importance
// ============================================================================

/// Model-reported importances when available, permutation importance over
/// the background otherwise.
struct FeatureImportanceStrategy;

#[derive(Debug, Serialize, Deserialize)]
struct FeatureImportanceResult {
    source: String,
    feature_names: Vec<String>,
    importances: Vec<f64>,
}

impl XaiStrategy for FeatureImportanceStrategy {
    fn xai_type(&self) -> XaiType {
        XaiType::FeatureImportance
    }

    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value> {
        request.validate()?;
        let model = request.model;

        let (source, importances) = match model.feature_importances() {
            Some(importances) => ("model", importances),
            None => {
                let baseline = model.predict_proba(request.background)?;
                let mut rng = StdRng::seed_from_u64(42);
                let mut importances = Vec::with_capacity(request.feature_names.len());
                for feature in 0..request.feature_names.len() {
                    let permuted: Vec<Vec<f64>> = request
                        .background
                        .iter()
                        .map(|row| {
                            let mut v = row.clone();
                            let swap = rng.random_range(0..request.background.len());
                            v[feature] = request.background[swap][feature];
                            v
                        })
                        .collect();
                    let shuffled = model.predict_proba(&permuted)?;
                    let delta = baseline
                        .iter()
                        .zip(&shuffled)
                        .map(|(a, b)| (a - b).abs())
                        .sum::<f64>()
                        / baseline.len() as f64;
                    importances.push(delta);
                }
                ("permutation", importances)
            }
        };

        Ok(serde_json::to_value(FeatureImportanceResult {
            source: source.to_string(),
            feature_names: request.feature_names.to_vec(),
            importances,
        })?)
    }
}

// ============================================================================
// Counterfactuals
// ============================================================================

/// Greedy counterfactuals: walk each positive row's features toward the
/// background mean until the prediction flips.
struct CounterfactualsStrategy;

const COUNTERFACTUAL_STEPS: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
struct CounterfactualsResult {
    feature_names: Vec<String>,
    rows: Vec<CounterfactualRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterfactualRow {
    #[serde(flatten)]
    ident: RowIdent,
    prediction: f64,
    found: bool,
    changes: Vec<CounterfactualChange>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterfactualChange {
    feature: String,
    from: f64,
    to: f64,
}

impl XaiStrategy for CounterfactualsStrategy {
    fn xai_type(&self) -> XaiType {
        XaiType::Counterfactuals
    }

    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value> {
        request.validate()?;
        let model = request.model;
        let dims = request.feature_names.len();
        let means = column_means(request.background, dims);

        let rows = request.capped_rows();
        let row_proba = model.predict_proba(rows)?;
        let mut out_rows = Vec::with_capacity(rows.len());

        for (row_idx, row) in rows.iter().enumerate() {
            if row_proba[row_idx] < 0.5 {
                out_rows.push(CounterfactualRow {
                    ident: request.ident(row_idx),
                    prediction: row_proba[row_idx],
                    found: false,
                    changes: Vec::new(),
                });
                continue;
            }

            let mut candidate = row.clone();
            let mut changes = Vec::new();
            let mut found = false;

            // Order features by how much a full substitution helps.
            let mut gains: Vec<(usize, f64)> = Vec::with_capacity(dims);
            for feature in 0..dims {
                let mut probe = candidate.clone();
                probe[feature] = means[feature];
                let p = model.predict_proba(std::slice::from_ref(&probe))?[0];
                gains.push((feature, row_proba[row_idx] - p));
            }
            gains.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            'outer: for (feature, _) in gains {
                let start = candidate[feature];
                let target = means[feature];
                for step in 1..=COUNTERFACTUAL_STEPS {
                    let t = step as f64 / COUNTERFACTUAL_STEPS as f64;
                    candidate[feature] = start + (target - start) * t;
                    let p = model.predict_proba(std::slice::from_ref(&candidate))?[0];
                    if p < 0.5 {
                        changes.push(CounterfactualChange {
                            feature: request.feature_names[feature].clone(),
                            from: start,
                            to: candidate[feature],
                        });
                        found = true;
                        break 'outer;
                    }
                }
                if (candidate[feature] - start).abs() > 1e-12 {
                    changes.push(CounterfactualChange {
                        feature: request.feature_names[feature].clone(),
                        from: start,
                        to: candidate[feature],
                    });
                }
            }

            out_rows.push(CounterfactualRow {
                ident: request.ident(row_idx),
                prediction: row_proba[row_idx],
                found,
                changes,
            });
        }

        Ok(serde_json::to_value(CounterfactualsResult {
            feature_names: request.feature_names.to_vec(),
            rows: out_rows,
        })?)
    }
}

// ============================================================================
// Decision path (tree models only)
// ============================================================================

struct DecisionPathStrategy;

#[derive(Debug, Serialize, Deserialize)]
struct DecisionPathResult {
    rows: Vec<DecisionPathRow>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DecisionPathRow {
    #[serde(flatten)]
    ident: RowIdent,
    prediction: f64,
    path: Vec<PathStep>,
}

impl XaiStrategy for DecisionPathStrategy {
    fn xai_type(&self) -> XaiType {
        XaiType::DecisionPath
    }

    fn explain(&self, request: &ExplanationRequest<'_>) -> Result<serde_json::Value> {
        request.validate()?;
        let model = request.model;
        let rows = request.capped_rows();
        let row_proba = model.predict_proba(rows)?;

        let mut out_rows = Vec::with_capacity(rows.len());
        for (row_idx, row) in rows.iter().enumerate() {
            let path = model.decision_path(row).ok_or_else(|| {
                MlError::UnsupportedXaiType("decision_path".to_string())
            })?;
            out_rows.push(DecisionPathRow {
                ident: request.ident(row_idx),
                prediction: row_proba[row_idx],
                path,
            });
        }

        Ok(serde_json::to_value(DecisionPathResult { rows: out_rows })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{create_strategy, MODEL_TYPE_LOGISTIC, MODEL_TYPE_TREE};
    use codegauge_protocol::ConfigMap;

    fn fitted_tree() -> Box<dyn ModelStrategy> {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            x.push(vec![i as f64, (i % 4) as f64]);
            y.push(f64::from(i >= 20));
        }
        let mut model = create_strategy(
            MODEL_TYPE_TREE,
            &ConfigMap::new(),
            vec!["churn".into(), "noise".into()],
        )
        .unwrap();
        model.fit(&x, &y).unwrap();
        model
    }

    fn names() -> Vec<String> {
        vec!["churn".into(), "noise".into()]
    }

    fn background() -> Vec<Vec<f64>> {
        (0..20).map(|i| vec![i as f64, (i % 4) as f64]).collect()
    }

    #[test]
    fn test_applicable_types() {
        assert_eq!(applicable_xai_types(false).len(), 4);
        let with_tree = applicable_xai_types(true);
        assert_eq!(with_tree.len(), 5);
        assert!(with_tree.contains(&XaiType::DecisionPath));
    }

    #[test]
    fn test_decision_path_requires_tree() {
        assert!(create_xai_strategy(XaiType::DecisionPath, false).is_err());
        assert!(create_xai_strategy(XaiType::DecisionPath, true).is_ok());
    }

    #[test]
    fn test_shap_explains_high_churn() {
        let model = fitted_tree();
        let names = names();
        let features = vec![vec![35.0, 1.0]];
        let idents = vec![RowIdent {
            file: Some("a.rs".into()),
            class_name: None,
        }];
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &features,
            background: &background(),
            identifiers: &idents,
        };
        let value = ShapStrategy.explain(&request).unwrap();
        let shap_values = value["rows"][0]["values"].as_array().unwrap();
        // churn dominates the prediction
        assert!(shap_values[0].as_f64().unwrap() > shap_values[1].as_f64().unwrap());
        assert_eq!(value["rows"][0]["file"], "a.rs");
    }

    #[test]
    fn test_feature_importance_from_model() {
        let model = fitted_tree();
        let names = names();
        let features = vec![vec![35.0, 1.0]];
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &features,
            background: &background(),
            identifiers: &[],
        };
        let value = FeatureImportanceStrategy.explain(&request).unwrap();
        assert_eq!(value["source"], "model");
        assert_eq!(value["importances"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_counterfactual_flips_positive_row() {
        let model = fitted_tree();
        let names = names();
        let features = vec![vec![39.0, 0.0]];
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &features,
            background: &background(),
            identifiers: &[],
        };
        let value = CounterfactualsStrategy.explain(&request).unwrap();
        assert_eq!(value["rows"][0]["found"], true);
        assert!(!value["rows"][0]["changes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_decision_path_output() {
        let model = fitted_tree();
        let names = names();
        let features = vec![vec![5.0, 1.0]];
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &features,
            background: &background(),
            identifiers: &[],
        };
        let value = DecisionPathStrategy.explain(&request).unwrap();
        assert!(!value["rows"][0]["path"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_lime_coefficients_exist() {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            x.push(vec![i as f64, 0.0]);
            y.push(f64::from(i >= 20));
        }
        let mut model = create_strategy(MODEL_TYPE_LOGISTIC, &ConfigMap::new(), names()).unwrap();
        model.fit(&x, &y).unwrap();

        let features = vec![vec![30.0, 0.0]];
        let names = names();
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &features,
            background: &background(),
            identifiers: &[],
        };
        let value = LimeStrategy.explain(&request).unwrap();
        let coefficients = value["rows"][0]["coefficients"].as_array().unwrap();
        assert_eq!(coefficients.len(), 2);
        // the informative feature gets the positive local weight
        assert!(coefficients[0].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_empty_features_rejected() {
        let model = fitted_tree();
        let names = names();
        let request = ExplanationRequest {
            model: model.as_ref(),
            feature_names: &names,
            features: &[],
            background: &background(),
            identifiers: &[],
        };
        assert!(ShapStrategy.explain(&request).is_err());
    }
}
