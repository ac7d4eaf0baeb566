//! Uniform model strategy contract and its factory.
//!
//! A strategy adapts one learning algorithm to the platform's fit / predict /
//! save / load surface and declares the hyper-parameter schema the control
//! plane validates submissions against. Artifacts are JSON envelopes tagged
//! with the model type so `load_strategy` can dispatch without context.

use codegauge_protocol::{ConfigMap, HyperparameterSpec};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::strategies::forest::RandomForestStrategy;
use crate::strategies::logistic::LogisticRegressionStrategy;
use crate::strategies::tree::DecisionTreeStrategy;

pub const MODEL_TYPE_LOGISTIC: &str = "logistic_regression";
pub const MODEL_TYPE_TREE: &str = "decision_tree";
pub const MODEL_TYPE_FOREST: &str = "random_forest";

/// One split decision along a tree's path for a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub feature: String,
    pub threshold: f64,
    pub went_left: bool,
}

/// Adapter over one learning algorithm with a uniform contract.
pub trait ModelStrategy: Send + Sync {
    fn model_type(&self) -> &'static str;

    /// Feature columns the model expects, in training order.
    fn feature_names(&self) -> &[String];

    fn is_fitted(&self) -> bool;

    fn is_tree_based(&self) -> bool {
        false
    }

    /// Fit on a feature matrix and binary labels.
    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<()>;

    /// Hard 0/1 predictions.
    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>>;

    /// Whether `predict_proba` is meaningful for this strategy.
    fn supports_proba(&self) -> bool {
        true
    }

    /// Positive-class probabilities.
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>>;

    /// Global importances, when the algorithm provides them.
    fn feature_importances(&self) -> Option<Vec<f64>>;

    /// Splits taken for one row; tree-based strategies only.
    fn decision_path(&self, _row: &[f64]) -> Option<Vec<PathStep>> {
        None
    }

    /// Serialize the fitted model into an artifact payload.
    fn save_payload(&self) -> Result<serde_json::Value>;
}

impl std::fmt::Debug for dyn ModelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStrategy")
            .field("model_type", &self.model_type())
            .finish()
    }
}

/// JSON envelope written to object storage.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactEnvelope {
    model_type: String,
    payload: serde_json::Value,
}

/// Serialize a fitted strategy into artifact bytes.
pub fn save_strategy(strategy: &dyn ModelStrategy) -> Result<Vec<u8>> {
    if !strategy.is_fitted() {
        return Err(MlError::NotFitted);
    }
    let envelope = ArtifactEnvelope {
        model_type: strategy.model_type().to_string(),
        payload: strategy.save_payload()?,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Load a strategy from artifact bytes, dispatching on the envelope tag.
pub fn load_strategy(artifact: &[u8]) -> Result<Box<dyn ModelStrategy>> {
    let envelope: ArtifactEnvelope = serde_json::from_slice(artifact)
        .map_err(|e| MlError::Artifact(format!("invalid model artifact: {}", e)))?;
    match envelope.model_type.as_str() {
        MODEL_TYPE_LOGISTIC => Ok(Box::new(LogisticRegressionStrategy::from_payload(
            envelope.payload,
        )?)),
        MODEL_TYPE_TREE => Ok(Box::new(DecisionTreeStrategy::from_payload(
            envelope.payload,
        )?)),
        MODEL_TYPE_FOREST => Ok(Box::new(RandomForestStrategy::from_payload(
            envelope.payload,
        )?)),
        other => Err(MlError::UnsupportedModelType(other.to_string())),
    }
}

/// Construct an unfitted strategy for a model type with validated
/// hyper-parameters.
pub fn create_strategy(
    model_type: &str,
    params: &ConfigMap,
    feature_names: Vec<String>,
) -> Result<Box<dyn ModelStrategy>> {
    match model_type {
        MODEL_TYPE_LOGISTIC => Ok(Box::new(LogisticRegressionStrategy::new(
            params,
            feature_names,
        )?)),
        MODEL_TYPE_TREE => Ok(Box::new(DecisionTreeStrategy::new(params, feature_names)?)),
        MODEL_TYPE_FOREST => Ok(Box::new(RandomForestStrategy::new(params, feature_names)?)),
        other => Err(MlError::UnsupportedModelType(other.to_string())),
    }
}

/// Descriptor for one supported model type, consumed by registry sync.
#[derive(Debug, Clone)]
pub struct ModelTypeInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub schema: Vec<HyperparameterSpec>,
    pub tree_based: bool,
}

/// Every model type compiled into this worker, with its HP schema.
pub fn supported_model_types() -> Vec<ModelTypeInfo> {
    vec![
        ModelTypeInfo {
            name: MODEL_TYPE_LOGISTIC,
            display_name: "Logistic Regression",
            description: "L2-regularized logistic regression trained by gradient descent.",
            schema: LogisticRegressionStrategy::hyperparameter_schema(),
            tree_based: false,
        },
        ModelTypeInfo {
            name: MODEL_TYPE_TREE,
            display_name: "Decision Tree",
            description: "CART decision tree with gini impurity.",
            schema: DecisionTreeStrategy::hyperparameter_schema(),
            tree_based: true,
        },
        ModelTypeInfo {
            name: MODEL_TYPE_FOREST,
            display_name: "Random Forest",
            description: "Bagged decision trees with feature subsampling.",
            schema: RandomForestStrategy::hyperparameter_schema(),
            tree_based: true,
        },
    ]
}

/// Whether a model type produces decision paths (drives the Decision-Path
/// explanation fan-out).
pub fn is_tree_based(model_type: &str) -> bool {
    supported_model_types()
        .iter()
        .any(|info| info.name == model_type && info.tree_based)
}

// ---------------------------------------------------------------------
// Hyper-parameter extraction helpers shared by the strategies
// ---------------------------------------------------------------------

pub(crate) fn param_usize(params: &ConfigMap, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| MlError::invalid_input(format!("'{}' must be a positive integer", key))),
    }
}

pub(crate) fn param_f64(params: &ConfigMap, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| MlError::invalid_input(format!("'{}' must be a number", key))),
    }
}

pub(crate) fn param_u64(params: &ConfigMap, key: &str, default: u64) -> Result<u64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| MlError::invalid_input(format!("'{}' must be a positive integer", key))),
    }
}

pub(crate) fn check_training_input(
    x: &[Vec<f64>],
    y: &[f64],
    feature_names: &[String],
) -> Result<()> {
    if x.is_empty() {
        return Err(MlError::invalid_input("empty training matrix"));
    }
    if x.len() != y.len() {
        return Err(MlError::invalid_input(format!(
            "feature/label length mismatch: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    if x[0].len() != feature_names.len() {
        return Err(MlError::invalid_input(format!(
            "expected {} features, got {}",
            feature_names.len(),
            x[0].len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_types_have_schemas() {
        let types = supported_model_types();
        assert_eq!(types.len(), 3);
        for info in &types {
            assert!(!info.schema.is_empty(), "{} has no schema", info.name);
        }
    }

    #[test]
    fn test_tree_based_set() {
        assert!(is_tree_based(MODEL_TYPE_FOREST));
        assert!(is_tree_based(MODEL_TYPE_TREE));
        assert!(!is_tree_based(MODEL_TYPE_LOGISTIC));
        assert!(!is_tree_based("unknown"));
    }

    #[test]
    fn test_unknown_model_type_rejected() {
        let err = create_strategy("boosted_stumps", &ConfigMap::new(), vec![]).unwrap_err();
        assert!(matches!(err, MlError::UnsupportedModelType(_)));
    }

    #[test]
    fn test_save_requires_fit() {
        let strategy =
            create_strategy(MODEL_TYPE_TREE, &ConfigMap::new(), vec!["a".into()]).unwrap();
        assert!(matches!(
            save_strategy(strategy.as_ref()),
            Err(MlError::NotFitted)
        ));
    }
}
