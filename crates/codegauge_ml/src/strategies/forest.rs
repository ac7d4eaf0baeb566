//! Random forest strategy: bagged CART trees with feature subsampling.

use codegauge_protocol::{ConfigMap, HyperparameterSpec, ParamRange, ParamType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::strategies::tree::DecisionTreeStrategy;
use crate::strategy::{
    check_training_input, param_u64, param_usize, ModelStrategy, PathStep, MODEL_TYPE_FOREST,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestStrategy {
    feature_names: Vec<String>,
    n_estimators: usize,
    max_depth: usize,
    min_samples_split: usize,
    random_seed: u64,
    trees: Vec<DecisionTreeStrategy>,
}

impl RandomForestStrategy {
    pub fn new(params: &ConfigMap, feature_names: Vec<String>) -> Result<Self> {
        let n_estimators = param_usize(params, "n_estimators", 100)?;
        if n_estimators == 0 {
            return Err(MlError::invalid_input("'n_estimators' must be at least 1"));
        }
        Ok(Self {
            feature_names,
            n_estimators,
            max_depth: param_usize(params, "max_depth", 8)?,
            min_samples_split: param_usize(params, "min_samples_split", 2)?.max(2),
            random_seed: param_u64(params, "random_seed", 42)?,
            trees: Vec::new(),
        })
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        let strategy: Self = serde_json::from_value(payload)
            .map_err(|e| MlError::Artifact(format!("invalid forest payload: {}", e)))?;
        if strategy.trees.is_empty() {
            return Err(MlError::NotFitted);
        }
        Ok(strategy)
    }

    pub fn hyperparameter_schema() -> Vec<HyperparameterSpec> {
        vec![
            HyperparameterSpec {
                name: "n_estimators".into(),
                param_type: ParamType::Integer,
                default: Some(serde_json::json!(100)),
                range: Some(ParamRange {
                    min: Some(1.0),
                    max: Some(1000.0),
                    step: Some(1.0),
                    log: None,
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "max_depth".into(),
                param_type: ParamType::Integer,
                default: Some(serde_json::json!(8)),
                range: Some(ParamRange {
                    min: Some(1.0),
                    max: Some(64.0),
                    step: Some(1.0),
                    log: None,
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "min_samples_split".into(),
                param_type: ParamType::Integer,
                default: Some(serde_json::json!(2)),
                range: Some(ParamRange {
                    min: Some(2.0),
                    max: Some(1000.0),
                    step: Some(1.0),
                    log: None,
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "random_seed".into(),
                param_type: ParamType::Integer,
                default: Some(serde_json::json!(42)),
                range: None,
                options: None,
                required: false,
            },
        ]
    }

    fn tree_params(&self) -> ConfigMap {
        let mut params = ConfigMap::new();
        params.insert("max_depth".into(), serde_json::json!(self.max_depth));
        params.insert(
            "min_samples_split".into(),
            serde_json::json!(self.min_samples_split),
        );
        params
    }
}

impl ModelStrategy for RandomForestStrategy {
    fn model_type(&self) -> &'static str {
        MODEL_TYPE_FOREST
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    fn is_tree_based(&self) -> bool {
        true
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<()> {
        check_training_input(x, y, &self.feature_names)?;

        let n_rows = x.len();
        let n_features = self.feature_names.len();
        let subset_size = ((n_features as f64).sqrt().ceil() as usize).clamp(1, n_features);
        let mut rng = StdRng::seed_from_u64(self.random_seed);

        let mut trees = Vec::with_capacity(self.n_estimators);
        for _ in 0..self.n_estimators {
            let bootstrap: Vec<usize> = (0..n_rows).map(|_| rng.random_range(0..n_rows)).collect();

            let mut features: Vec<usize> = (0..n_features).collect();
            features.shuffle(&mut rng);
            features.truncate(subset_size);
            features.sort_unstable();

            let mut tree =
                DecisionTreeStrategy::new(&self.tree_params(), self.feature_names.clone())?;
            tree.fit_subset(x, y, &bootstrap, Some(features.as_slice()))?;
            trees.push(tree);
        }

        self.trees = trees;
        Ok(())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        let proba = self.predict_proba(x)?;
        Ok(proba.iter().map(|&p| f64::from(p >= 0.5)).collect())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        if self.trees.is_empty() {
            return Err(MlError::NotFitted);
        }
        let mut totals = vec![0.0; x.len()];
        for tree in &self.trees {
            for (total, p) in totals.iter_mut().zip(tree.predict_proba(x)?) {
                *total += p;
            }
        }
        let n = self.trees.len() as f64;
        Ok(totals.into_iter().map(|t| t / n).collect())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        if self.trees.is_empty() {
            return None;
        }
        let mut totals = vec![0.0; self.feature_names.len()];
        for tree in &self.trees {
            if let Some(importances) = tree.raw_importances() {
                for (total, v) in totals.iter_mut().zip(importances) {
                    *total += v;
                }
            }
        }
        let sum: f64 = totals.iter().sum();
        if sum > 0.0 {
            for t in &mut totals {
                *t /= sum;
            }
        }
        Some(totals)
    }

    /// Path through the first tree; representative rather than exhaustive.
    fn decision_path(&self, row: &[f64]) -> Option<Vec<PathStep>> {
        self.trees.first().and_then(|tree| tree.decision_path(row))
    }

    fn save_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..60 {
            let v = i as f64;
            x.push(vec![v, 60.0 - v, (i % 5) as f64]);
            y.push(f64::from(v >= 30.0));
        }
        (x, y)
    }

    fn params(n: usize) -> ConfigMap {
        let mut p = ConfigMap::new();
        p.insert("n_estimators".into(), serde_json::json!(n));
        p
    }

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn test_fit_predict() {
        let (x, y) = data();
        let mut forest = RandomForestStrategy::new(&params(20), names()).unwrap();
        forest.fit(&x, &y).unwrap();

        let pred = forest.predict(&x).unwrap();
        let hits = pred
            .iter()
            .zip(&y)
            .filter(|(p, t)| (**p - **t).abs() < 0.5)
            .count();
        assert!(hits as f64 / y.len() as f64 > 0.9);
    }

    #[test]
    fn test_deterministic_given_seed() {
        let (x, y) = data();
        let mut a = RandomForestStrategy::new(&params(10), names()).unwrap();
        let mut b = RandomForestStrategy::new(&params(10), names()).unwrap();
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.predict_proba(&x).unwrap(), b.predict_proba(&x).unwrap());
    }

    #[test]
    fn test_importances_sum_to_one() {
        let (x, y) = data();
        let mut forest = RandomForestStrategy::new(&params(10), names()).unwrap();
        forest.fit(&x, &y).unwrap();

        let importances = forest.feature_importances().unwrap();
        let sum: f64 = importances.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_estimators_rejected() {
        assert!(RandomForestStrategy::new(&params(0), names()).is_err());
    }

    #[test]
    fn test_payload_roundtrip() {
        let (x, y) = data();
        let mut forest = RandomForestStrategy::new(&params(5), names()).unwrap();
        forest.fit(&x, &y).unwrap();

        let restored = RandomForestStrategy::from_payload(forest.save_payload().unwrap()).unwrap();
        assert_eq!(
            forest.predict_proba(&x).unwrap(),
            restored.predict_proba(&x).unwrap()
        );
    }
}
