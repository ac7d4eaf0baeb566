//! CART decision tree strategy (gini impurity).

use codegauge_protocol::{ConfigMap, HyperparameterSpec, ParamRange, ParamType};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::strategy::{
    check_training_input, param_usize, ModelStrategy, PathStep, MODEL_TYPE_TREE,
};

/// Candidate split thresholds per feature are capped; beyond this the values
/// are quantile-sampled.
const MAX_SPLIT_CANDIDATES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Node {
    Leaf {
        proba: f64,
        samples: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        samples: usize,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn proba_for(&self, row: &[f64]) -> f64 {
        match self {
            Node::Leaf { proba, .. } => *proba,
            Node::Split {
                feature,
                threshold,
                left,
                right,
                ..
            } => {
                if row[*feature] <= *threshold {
                    left.proba_for(row)
                } else {
                    right.proba_for(row)
                }
            }
        }
    }

    fn path_for(&self, row: &[f64], feature_names: &[String], out: &mut Vec<PathStep>) {
        if let Node::Split {
            feature,
            threshold,
            left,
            right,
            ..
        } = self
        {
            let went_left = row[*feature] <= *threshold;
            out.push(PathStep {
                feature: feature_names[*feature].clone(),
                threshold: *threshold,
                went_left,
            });
            if went_left {
                left.path_for(row, feature_names, out);
            } else {
                right.path_for(row, feature_names, out);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeStrategy {
    feature_names: Vec<String>,
    max_depth: usize,
    min_samples_split: usize,
    root: Option<Node>,
    importances: Option<Vec<f64>>,
}

/// Tree builder working over row indices into the training set.
struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    max_depth: usize,
    min_samples_split: usize,
    /// Accumulated impurity decrease per feature.
    importances: Vec<f64>,
    /// Feature subset to consider at each split; `None` means all.
    feature_subset: Option<&'a [usize]>,
}

fn gini(pos: f64, total: f64) -> f64 {
    if total == 0.0 {
        return 0.0;
    }
    let p = pos / total;
    2.0 * p * (1.0 - p)
}

impl<'a> TreeBuilder<'a> {
    fn build(&mut self, indices: &[usize], depth: usize) -> Node {
        let total = indices.len() as f64;
        let pos: f64 = indices.iter().map(|&i| self.y[i]).sum();
        let proba = if total == 0.0 { 0.0 } else { pos / total };
        let node_gini = gini(pos, total);

        let make_leaf = || Node::Leaf {
            proba,
            samples: indices.len(),
        };

        if depth >= self.max_depth
            || indices.len() < self.min_samples_split
            || node_gini == 0.0
        {
            return make_leaf();
        }

        let Some((feature, threshold, gain)) = self.best_split(indices, node_gini) else {
            return make_leaf();
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .copied()
            .partition(|&i| self.x[i][feature] <= threshold);
        if left.is_empty() || right.is_empty() {
            return make_leaf();
        }

        self.importances[feature] += gain * total;

        Node::Split {
            feature,
            threshold,
            samples: indices.len(),
            left: Box::new(self.build(&left, depth + 1)),
            right: Box::new(self.build(&right, depth + 1)),
        }
    }

    fn best_split(&self, indices: &[usize], parent_gini: f64) -> Option<(usize, f64, f64)> {
        let n_features = self.x[0].len();
        let all_features: Vec<usize> = (0..n_features).collect();
        let features = self.feature_subset.unwrap_or(&all_features);

        let total = indices.len() as f64;
        let mut best: Option<(usize, f64, f64)> = None;

        for &feature in features {
            let mut values: Vec<f64> = indices.iter().map(|&i| self.x[i][feature]).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            values.dedup();
            if values.len() < 2 {
                continue;
            }

            let step = (values.len() / MAX_SPLIT_CANDIDATES).max(1);
            for window in values.windows(2).step_by(step) {
                let threshold = (window[0] + window[1]) / 2.0;

                let mut left_total = 0.0;
                let mut left_pos = 0.0;
                let mut right_total = 0.0;
                let mut right_pos = 0.0;
                for &i in indices {
                    if self.x[i][feature] <= threshold {
                        left_total += 1.0;
                        left_pos += self.y[i];
                    } else {
                        right_total += 1.0;
                        right_pos += self.y[i];
                    }
                }
                if left_total == 0.0 || right_total == 0.0 {
                    continue;
                }

                let weighted = (left_total / total) * gini(left_pos, left_total)
                    + (right_total / total) * gini(right_pos, right_total);
                let gain = parent_gini - weighted;
                if gain > best.map_or(1e-12, |(_, _, g)| g) {
                    best = Some((feature, threshold, gain));
                }
            }
        }
        best
    }
}

impl DecisionTreeStrategy {
    pub fn new(params: &ConfigMap, feature_names: Vec<String>) -> Result<Self> {
        Ok(Self {
            feature_names,
            max_depth: param_usize(params, "max_depth", 8)?,
            min_samples_split: param_usize(params, "min_samples_split", 2)?.max(2),
            root: None,
            importances: None,
        })
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        let strategy: Self = serde_json::from_value(payload)
            .map_err(|e| MlError::Artifact(format!("invalid tree payload: {}", e)))?;
        if strategy.root.is_none() {
            return Err(MlError::NotFitted);
        }
        Ok(strategy)
    }

    pub fn hyperparameter_schema() -> Vec<HyperparameterSpec> {
        vec![
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
        ]
    }

    /// Fit on a subset of rows considering only a subset of features; used
    /// by the forest for bagging.
    pub(crate) fn fit_subset(
        &mut self,
        x: &[Vec<f64>],
        y: &[f64],
        indices: &[usize],
        feature_subset: Option<&[usize]>,
    ) -> Result<()> {
        if indices.is_empty() {
            return Err(MlError::invalid_input("empty training subset"));
        }
        let mut builder = TreeBuilder {
            x,
            y,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            importances: vec![0.0; self.feature_names.len()],
            feature_subset,
        };
        self.root = Some(builder.build(indices, 0));

        let total: f64 = builder.importances.iter().sum();
        self.importances = Some(if total > 0.0 {
            builder.importances.iter().map(|v| v / total).collect()
        } else {
            builder.importances
        });
        Ok(())
    }

    pub(crate) fn raw_importances(&self) -> Option<&Vec<f64>> {
        self.importances.as_ref()
    }

    fn root(&self) -> Result<&Node> {
        self.root.as_ref().ok_or(MlError::NotFitted)
    }
}

impl ModelStrategy for DecisionTreeStrategy {
    fn model_type(&self) -> &'static str {
        MODEL_TYPE_TREE
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn is_fitted(&self) -> bool {
        self.root.is_some()
    }

    fn is_tree_based(&self) -> bool {
        true
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<()> {
        check_training_input(x, y, &self.feature_names)?;
        let indices: Vec<usize> = (0..x.len()).collect();
        self.fit_subset(x, y, &indices, None)
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        let proba = self.predict_proba(x)?;
        Ok(proba.iter().map(|&p| f64::from(p >= 0.5)).collect())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        let root = self.root()?;
        Ok(x.iter().map(|row| root.proba_for(row)).collect())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        self.importances.clone()
    }

    fn decision_path(&self, row: &[f64]) -> Option<Vec<PathStep>> {
        let root = self.root.as_ref()?;
        let mut path = Vec::new();
        root.path_for(row, &self.feature_names, &mut path);
        Some(path)
    }

    fn save_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_ish_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        // Separable by a single split on the first feature.
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..30 {
            let v = i as f64;
            x.push(vec![v, (i % 3) as f64]);
            y.push(f64::from(v >= 15.0));
        }
        (x, y)
    }

    #[test]
    fn test_fit_predict() {
        let (x, y) = xor_ish_data();
        let mut tree =
            DecisionTreeStrategy::new(&ConfigMap::new(), vec!["v".into(), "noise".into()])
                .unwrap();
        tree.fit(&x, &y).unwrap();
        assert_eq!(tree.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_decision_path_names_features() {
        let (x, y) = xor_ish_data();
        let mut tree =
            DecisionTreeStrategy::new(&ConfigMap::new(), vec!["v".into(), "noise".into()])
                .unwrap();
        tree.fit(&x, &y).unwrap();

        let path = tree.decision_path(&x[0]).unwrap();
        assert!(!path.is_empty());
        assert_eq!(path[0].feature, "v");
    }

    #[test]
    fn test_importances_favor_split_feature() {
        let (x, y) = xor_ish_data();
        let mut tree =
            DecisionTreeStrategy::new(&ConfigMap::new(), vec!["v".into(), "noise".into()])
                .unwrap();
        tree.fit(&x, &y).unwrap();

        let importances = tree.feature_importances().unwrap();
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn test_payload_roundtrip() {
        let (x, y) = xor_ish_data();
        let mut tree =
            DecisionTreeStrategy::new(&ConfigMap::new(), vec!["v".into(), "noise".into()])
                .unwrap();
        tree.fit(&x, &y).unwrap();

        let restored =
            DecisionTreeStrategy::from_payload(tree.save_payload().unwrap()).unwrap();
        assert_eq!(tree.predict(&x).unwrap(), restored.predict(&x).unwrap());
    }
}
