//! Hyper-parameter search: typed search-space sampling, stratified k-fold
//! cross-validation and median pruning.
//!
//! The worker's HP-search handler drives the outer trial loop; this module
//! supplies the pieces so the loop stays a dozen lines.

use codegauge_protocol::{ConfigMap, SearchSpaceParam, SuggestType};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MlError, Result};
use crate::metrics::{evaluate, ObjectiveMetric};
use crate::strategy::create_strategy;

/// Seeded random sampler over a typed search space.
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Suggest one parameter set. The space must already be validated.
    pub fn suggest(&mut self, space: &[SearchSpaceParam]) -> Result<ConfigMap> {
        let mut params = ConfigMap::new();
        for dim in space {
            let value = match dim.suggest_type {
                SuggestType::Float => {
                    let (low, high) = bounds(dim)?;
                    let raw = if dim.log {
                        let (ll, lh) = (low.ln(), high.ln());
                        self.rng.random_range(ll..=lh).exp()
                    } else {
                        self.rng.random_range(low..=high)
                    };
                    let snapped = snap(raw, low, dim.step);
                    serde_json::json!(snapped)
                }
                SuggestType::Int => {
                    let (low, high) = bounds(dim)?;
                    let raw = if dim.log {
                        let (ll, lh) = (low.ln(), high.ln());
                        self.rng.random_range(ll..=lh).exp()
                    } else {
                        self.rng.random_range(low..=high)
                    };
                    let snapped = snap(raw, low, dim.step.or(Some(1.0)));
                    serde_json::json!(snapped.round().clamp(low, high) as i64)
                }
                SuggestType::Categorical => {
                    let choices = dim.choices.as_ref().ok_or_else(|| {
                        MlError::invalid_input(format!("'choices' required for '{}'", dim.param_name))
                    })?;
                    choices
                        .choose(&mut self.rng)
                        .cloned()
                        .ok_or_else(|| {
                            MlError::invalid_input(format!("empty choices for '{}'", dim.param_name))
                        })?
                }
            };
            params.insert(dim.param_name.clone(), value);
        }
        Ok(params)
    }
}

fn bounds(dim: &SearchSpaceParam) -> Result<(f64, f64)> {
    match (dim.low, dim.high) {
        (Some(low), Some(high)) if low <= high => Ok((low, high)),
        _ => Err(MlError::invalid_input(format!(
            "'low'/'high' required for '{}'",
            dim.param_name
        ))),
    }
}

fn snap(value: f64, low: f64, step: Option<f64>) -> f64 {
    match step {
        Some(step) if step > 0.0 => low + ((value - low) / step).round() * step,
        _ => value,
    }
}

/// One completed or pruned trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub number: i64,
    pub params: ConfigMap,
    pub value: Option<f64>,
    pub pruned: bool,
}

/// Median pruning rule: after each fold, a trial whose running mean falls
/// below the median of completed trials' final values is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrunerKind {
    #[default]
    Median,
    Nop,
}

pub struct Pruner {
    kind: PrunerKind,
    /// Folds to complete before pruning may trigger.
    warmup_folds: usize,
}

impl Pruner {
    pub fn new(kind: PrunerKind) -> Self {
        Self {
            kind,
            warmup_folds: 1,
        }
    }

    pub fn should_prune(
        &self,
        completed: &[Trial],
        fold_index: usize,
        running_mean: f64,
    ) -> bool {
        if self.kind == PrunerKind::Nop || fold_index < self.warmup_folds {
            return false;
        }
        let mut finals: Vec<f64> = completed
            .iter()
            .filter(|t| !t.pruned)
            .filter_map(|t| t.value)
            .collect();
        if finals.is_empty() {
            return false;
        }
        finals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = finals[finals.len() / 2];
        running_mean < median
    }
}

/// Stratified k-fold index split. Each class's rows are dealt round-robin
/// across folds so every fold sees both classes when possible.
pub fn stratified_kfold(y: &[f64], k: usize, seed: u64) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 {
        return Err(MlError::invalid_input("k-fold requires k >= 2"));
    }
    if y.len() < k {
        return Err(MlError::invalid_input(format!(
            "cannot split {} rows into {} folds",
            y.len(),
            k
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut positives: Vec<usize> = Vec::new();
    let mut negatives: Vec<usize> = Vec::new();
    for (i, &label) in y.iter().enumerate() {
        if label >= 0.5 {
            positives.push(i);
        } else {
            negatives.push(i);
        }
    }
    positives.shuffle(&mut rng);
    negatives.shuffle(&mut rng);

    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    for (pos, &i) in positives.iter().enumerate() {
        folds[pos % k].push(i);
    }
    for (pos, &i) in negatives.iter().enumerate() {
        folds[pos % k].push(i);
    }

    let splits = (0..k)
        .map(|fold| {
            let test: Vec<usize> = folds[fold].clone();
            let train: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(f, _)| *f != fold)
                .flat_map(|(_, idx)| idx.iter().copied())
                .collect();
            (train, test)
        })
        .collect();
    Ok(splits)
}

/// Evaluate one parameter set with k-fold CV under the objective metric.
///
/// Returns per-fold scores; the pruner callback is consulted after every
/// fold and a `None` return means the trial was pruned.
#[allow(clippy::too_many_arguments)]
pub fn cross_validate(
    model_type: &str,
    params: &ConfigMap,
    feature_names: &[String],
    x: &[Vec<f64>],
    y: &[f64],
    folds: usize,
    metric: ObjectiveMetric,
    seed: u64,
    mut on_fold: impl FnMut(usize, f64) -> bool,
) -> Result<Option<Vec<f64>>> {
    let splits = stratified_kfold(y, folds, seed)?;
    let mut scores = Vec::with_capacity(folds);

    for (fold_index, (train_idx, test_idx)) in splits.iter().enumerate() {
        let train_x: Vec<Vec<f64>> = train_idx.iter().map(|&i| x[i].clone()).collect();
        let train_y: Vec<f64> = train_idx.iter().map(|&i| y[i]).collect();
        let test_x: Vec<Vec<f64>> = test_idx.iter().map(|&i| x[i].clone()).collect();
        let test_y: Vec<f64> = test_idx.iter().map(|&i| y[i]).collect();

        let mut model = create_strategy(model_type, params, feature_names.to_vec())?;
        model.fit(&train_x, &train_y)?;

        let pred = model.predict(&test_x)?;
        let proba = if model.supports_proba() {
            Some(model.predict_proba(&test_x)?)
        } else {
            None
        };
        let score = evaluate(metric, &test_y, &pred, proba.as_deref())?;
        scores.push(score);
        debug!("fold {} score {:.4}", fold_index, score);

        let running_mean = scores.iter().sum::<f64>() / scores.len() as f64;
        if !on_fold(fold_index, running_mean) {
            return Ok(None);
        }
    }
    Ok(Some(scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::MODEL_TYPE_TREE;

    fn space() -> Vec<SearchSpaceParam> {
        vec![
            SearchSpaceParam {
                param_name: "max_depth".into(),
                suggest_type: SuggestType::Int,
                low: Some(2.0),
                high: Some(6.0),
                step: Some(1.0),
                log: false,
                choices: None,
            },
            SearchSpaceParam {
                param_name: "min_samples_split".into(),
                suggest_type: SuggestType::Int,
                low: Some(2.0),
                high: Some(8.0),
                step: Some(2.0),
                log: false,
                choices: None,
            },
        ]
    }

    #[test]
    fn test_sampler_respects_bounds() {
        let mut sampler = RandomSampler::new(7);
        for _ in 0..50 {
            let params = sampler.suggest(&space()).unwrap();
            let depth = params["max_depth"].as_i64().unwrap();
            assert!((2..=6).contains(&depth));
            let mss = params["min_samples_split"].as_i64().unwrap();
            assert!((2..=8).contains(&mss));
            assert_eq!(mss % 2, 0);
        }
    }

    #[test]
    fn test_sampler_deterministic() {
        let a: Vec<ConfigMap> = {
            let mut s = RandomSampler::new(1);
            (0..5).map(|_| s.suggest(&space()).unwrap()).collect()
        };
        let b: Vec<ConfigMap> = {
            let mut s = RandomSampler::new(1);
            (0..5).map(|_| s.suggest(&space()).unwrap()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_stratified_kfold_balance() {
        let y: Vec<f64> = (0..30).map(|i| f64::from(i % 3 == 0)).collect();
        let splits = stratified_kfold(&y, 3, 42).unwrap();
        assert_eq!(splits.len(), 3);
        for (train, test) in &splits {
            assert_eq!(train.len() + test.len(), 30);
            // every fold sees at least one positive
            assert!(test.iter().any(|&i| y[i] >= 0.5));
        }
    }

    #[test]
    fn test_cross_validate_tree() {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            x.push(vec![i as f64]);
            y.push(f64::from(i >= 20));
        }
        let scores = cross_validate(
            MODEL_TYPE_TREE,
            &ConfigMap::new(),
            &["v".to_string()],
            &x,
            &y,
            4,
            ObjectiveMetric::Accuracy,
            42,
            |_, _| true,
        )
        .unwrap()
        .unwrap();
        assert_eq!(scores.len(), 4);
        let mean = scores.iter().sum::<f64>() / 4.0;
        assert!(mean > 0.8);
    }

    #[test]
    fn test_pruner_median() {
        let completed = vec![
            Trial {
                number: 0,
                params: ConfigMap::new(),
                value: Some(0.8),
                pruned: false,
            },
            Trial {
                number: 1,
                params: ConfigMap::new(),
                value: Some(0.9),
                pruned: false,
            },
        ];
        let pruner = Pruner::new(PrunerKind::Median);
        assert!(pruner.should_prune(&completed, 1, 0.5));
        assert!(!pruner.should_prune(&completed, 1, 0.95));
        // warmup fold never prunes
        assert!(!pruner.should_prune(&completed, 0, 0.1));

        let nop = Pruner::new(PrunerKind::Nop);
        assert!(!nop.should_prune(&completed, 1, 0.0));
    }
}
