//! Logistic regression strategy.
//!
//! Features are standardized at fit time (means/stds stored with the model)
//! and the weights are trained by full-batch gradient descent with L2
//! regularization.

use codegauge_protocol::{ConfigMap, HyperparameterSpec, ParamRange, ParamType};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::strategy::{
    check_training_input, param_f64, param_usize, ModelStrategy, MODEL_TYPE_LOGISTIC,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FittedState {
    weights: Vec<f64>,
    bias: f64,
    means: Vec<f64>,
    stds: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegressionStrategy {
    feature_names: Vec<String>,
    learning_rate: f64,
    max_iter: usize,
    l2: f64,
    fitted: Option<FittedState>,
}

impl LogisticRegressionStrategy {
    pub fn new(params: &ConfigMap, feature_names: Vec<String>) -> Result<Self> {
        Ok(Self {
            feature_names,
            learning_rate: param_f64(params, "learning_rate", 0.1)?,
            max_iter: param_usize(params, "max_iter", 300)?,
            l2: param_f64(params, "l2", 0.01)?,
            fitted: None,
        })
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        let strategy: Self = serde_json::from_value(payload)
            .map_err(|e| MlError::Artifact(format!("invalid logistic payload: {}", e)))?;
        if strategy.fitted.is_none() {
            return Err(MlError::NotFitted);
        }
        Ok(strategy)
    }

    pub fn hyperparameter_schema() -> Vec<HyperparameterSpec> {
        vec![
            HyperparameterSpec {
                name: "learning_rate".into(),
                param_type: ParamType::Float,
                default: Some(serde_json::json!(0.1)),
                range: Some(ParamRange {
                    min: Some(1e-5),
                    max: Some(10.0),
                    step: None,
                    log: Some(true),
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "max_iter".into(),
                param_type: ParamType::Integer,
                default: Some(serde_json::json!(300)),
                range: Some(ParamRange {
                    min: Some(10.0),
                    max: Some(10_000.0),
                    step: Some(10.0),
                    log: None,
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "l2".into(),
                param_type: ParamType::Float,
                default: Some(serde_json::json!(0.01)),
                range: Some(ParamRange {
                    min: Some(0.0),
                    max: Some(100.0),
                    step: None,
                    log: None,
                }),
                options: None,
                required: false,
            },
        ]
    }

    fn standardize(&self, state: &FittedState, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(state.means.iter().zip(&state.stds))
            .map(|(v, (mean, std))| (v - mean) / std)
            .collect()
    }

    fn raw_proba(&self, state: &FittedState, row: &[f64]) -> f64 {
        let z: f64 = self
            .standardize(state, row)
            .iter()
            .zip(&state.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + state.bias;
        sigmoid(z)
    }

    fn fitted(&self) -> Result<&FittedState> {
        self.fitted.as_ref().ok_or(MlError::NotFitted)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl ModelStrategy for LogisticRegressionStrategy {
    fn model_type(&self) -> &'static str {
        MODEL_TYPE_LOGISTIC
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<()> {
        check_training_input(x, y, &self.feature_names)?;
        let n = x.len() as f64;
        let dims = self.feature_names.len();

        let mut means = vec![0.0; dims];
        for row in x {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut stds = vec![0.0; dims];
        for row in x {
            for ((s, v), m) in stds.iter_mut().zip(row).zip(&means) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in &mut stds {
            *s = s.sqrt();
            if *s < 1e-12 {
                *s = 1.0; // constant column
            }
        }

        let standardized: Vec<Vec<f64>> = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(means.iter().zip(&stds))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect();

        let mut weights = vec![0.0; dims];
        let mut bias = 0.0;
        for _ in 0..self.max_iter {
            let mut grad_w = vec![0.0; dims];
            let mut grad_b = 0.0;
            for (row, &label) in standardized.iter().zip(y) {
                let z: f64 = row.iter().zip(&weights).map(|(x, w)| x * w).sum::<f64>() + bias;
                let err = sigmoid(z) - label;
                for (g, v) in grad_w.iter_mut().zip(row) {
                    *g += err * v / n;
                }
                grad_b += err / n;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * (g + self.l2 * *w / n);
            }
            bias -= self.learning_rate * grad_b;
        }

        self.fitted = Some(FittedState {
            weights,
            bias,
            means,
            stds,
        });
        Ok(())
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        let proba = self.predict_proba(x)?;
        Ok(proba.iter().map(|&p| f64::from(p >= 0.5)).collect())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        let state = self.fitted()?;
        Ok(x.iter().map(|row| self.raw_proba(state, row)).collect())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        let state = self.fitted.as_ref()?;
        let total: f64 = state.weights.iter().map(|w| w.abs()).sum();
        if total == 0.0 {
            return Some(vec![0.0; state.weights.len()]);
        }
        Some(state.weights.iter().map(|w| w.abs() / total).collect())
    }

    fn save_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let v = i as f64 / 10.0;
            x.push(vec![v, -v]);
            y.push(f64::from(v >= 2.0));
        }
        (x, y)
    }

    #[test]
    fn test_fit_predict_separable() {
        let (x, y) = separable_data();
        let mut model =
            LogisticRegressionStrategy::new(&ConfigMap::new(), vec!["a".into(), "b".into()])
                .unwrap();
        model.fit(&x, &y).unwrap();

        let pred = model.predict(&x).unwrap();
        let hits = pred
            .iter()
            .zip(&y)
            .filter(|(p, t)| (**p - **t).abs() < 0.5)
            .count();
        assert!(hits as f64 / y.len() as f64 > 0.9);
    }

    #[test]
    fn test_payload_roundtrip() {
        let (x, y) = separable_data();
        let mut model =
            LogisticRegressionStrategy::new(&ConfigMap::new(), vec!["a".into(), "b".into()])
                .unwrap();
        model.fit(&x, &y).unwrap();

        let payload = model.save_payload().unwrap();
        let restored = LogisticRegressionStrategy::from_payload(payload).unwrap();
        assert_eq!(
            model.predict_proba(&x).unwrap(),
            restored.predict_proba(&x).unwrap()
        );
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let model =
            LogisticRegressionStrategy::new(&ConfigMap::new(), vec!["a".into()]).unwrap();
        assert!(matches!(
            model.predict(&[vec![1.0]]),
            Err(MlError::NotFitted)
        ));
    }
}
