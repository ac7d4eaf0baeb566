//! Evaluation metrics for binary classifiers.
//!
//! Weighted averages weight each class by its support, so the imbalanced
//! buggy/clean split the platform trains on does not hide minority-class
//! collapse.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};

/// Objective metric for evaluation and HP search. All are maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMetric {
    #[default]
    F1Weighted,
    Auc,
    PrecisionWeighted,
    RecallWeighted,
    Accuracy,
}

impl ObjectiveMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveMetric::F1Weighted => "f1_weighted",
            ObjectiveMetric::Auc => "auc",
            ObjectiveMetric::PrecisionWeighted => "precision_weighted",
            ObjectiveMetric::RecallWeighted => "recall_weighted",
            ObjectiveMetric::Accuracy => "accuracy",
        }
    }
}

impl fmt::Display for ObjectiveMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObjectiveMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "f1_weighted" => Ok(ObjectiveMetric::F1Weighted),
            "auc" => Ok(ObjectiveMetric::Auc),
            "precision_weighted" => Ok(ObjectiveMetric::PrecisionWeighted),
            "recall_weighted" => Ok(ObjectiveMetric::RecallWeighted),
            "accuracy" => Ok(ObjectiveMetric::Accuracy),
            _ => Err(format!("Invalid objective metric: '{}'", s)),
        }
    }
}

fn check_lengths(y_true: &[f64], other: &[f64], what: &str) -> Result<()> {
    if y_true.is_empty() {
        return Err(MlError::invalid_input("empty label vector"));
    }
    if y_true.len() != other.len() {
        return Err(MlError::invalid_input(format!(
            "label/{} length mismatch: {} vs {}",
            what,
            y_true.len(),
            other.len()
        )));
    }
    Ok(())
}

pub fn accuracy(y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
    check_lengths(y_true, y_pred, "prediction")?;
    let hits = y_true
        .iter()
        .zip(y_pred)
        .filter(|(t, p)| (**t - **p).abs() < 0.5)
        .count();
    Ok(hits as f64 / y_true.len() as f64)
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounts {
    tp: usize,
    fp: usize,
    fn_: usize,
    support: usize,
}

fn per_class_counts(y_true: &[f64], y_pred: &[f64]) -> BTreeMap<i64, ClassCounts> {
    let mut counts: BTreeMap<i64, ClassCounts> = BTreeMap::new();
    for (&t, &p) in y_true.iter().zip(y_pred) {
        let t = t.round() as i64;
        let p = p.round() as i64;
        counts.entry(t).or_default().support += 1;
        if t == p {
            counts.entry(t).or_default().tp += 1;
        } else {
            counts.entry(p).or_default().fp += 1;
            counts.entry(t).or_default().fn_ += 1;
        }
    }
    counts
}

fn weighted_metric(
    y_true: &[f64],
    y_pred: &[f64],
    per_class: impl Fn(&ClassCounts) -> f64,
) -> Result<f64> {
    check_lengths(y_true, y_pred, "prediction")?;
    let counts = per_class_counts(y_true, y_pred);
    let total: usize = counts.values().map(|c| c.support).sum();
    let score = counts
        .values()
        .filter(|c| c.support > 0)
        .map(|c| per_class(c) * c.support as f64)
        .sum::<f64>()
        / total as f64;
    Ok(score)
}

pub fn precision_weighted(y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
    weighted_metric(y_true, y_pred, |c| {
        let denom = c.tp + c.fp;
        if denom == 0 {
            0.0
        } else {
            c.tp as f64 / denom as f64
        }
    })
}

pub fn recall_weighted(y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
    weighted_metric(y_true, y_pred, |c| {
        let denom = c.tp + c.fn_;
        if denom == 0 {
            0.0
        } else {
            c.tp as f64 / denom as f64
        }
    })
}

pub fn f1_weighted(y_true: &[f64], y_pred: &[f64]) -> Result<f64> {
    weighted_metric(y_true, y_pred, |c| {
        let p_denom = c.tp + c.fp;
        let r_denom = c.tp + c.fn_;
        if p_denom == 0 || r_denom == 0 {
            return 0.0;
        }
        let p = c.tp as f64 / p_denom as f64;
        let r = c.tp as f64 / r_denom as f64;
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    })
}

/// Binary ROC AUC over positive-class probabilities, with the midpoint tie
/// correction.
pub fn roc_auc(y_true: &[f64], y_proba: &[f64]) -> Result<f64> {
    check_lengths(y_true, y_proba, "probability")?;

    let positives = y_true.iter().filter(|&&t| t >= 0.5).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(MlError::invalid_input(
            "roc_auc requires both classes present",
        ));
    }

    let mut pairs: Vec<(f64, f64)> = y_proba.iter().cloned().zip(y_true.iter().cloned()).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Rank-sum (Mann-Whitney U) formulation with average ranks for ties.
    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i;
        while j < pairs.len() && pairs[j].0 == pairs[i].0 {
            j += 1;
        }
        let avg_rank = ((i + 1) + j) as f64 / 2.0;
        for pair in &pairs[i..j] {
            if pair.1 >= 0.5 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

/// Evaluate one metric. AUC needs probabilities; everything else uses hard
/// predictions.
pub fn evaluate(
    metric: ObjectiveMetric,
    y_true: &[f64],
    y_pred: &[f64],
    y_proba: Option<&[f64]>,
) -> Result<f64> {
    match metric {
        ObjectiveMetric::Accuracy => accuracy(y_true, y_pred),
        ObjectiveMetric::PrecisionWeighted => precision_weighted(y_true, y_pred),
        ObjectiveMetric::RecallWeighted => recall_weighted(y_true, y_pred),
        ObjectiveMetric::F1Weighted => f1_weighted(y_true, y_pred),
        ObjectiveMetric::Auc => {
            let proba = y_proba
                .ok_or_else(|| MlError::invalid_input("auc requires predict_proba support"))?;
            roc_auc(y_true, proba)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        let acc = accuracy(&[1.0, 0.0, 1.0, 0.0], &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!((acc - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_perfect_f1() {
        let f1 = f1_weighted(&[1.0, 0.0, 1.0], &[1.0, 0.0, 1.0]).unwrap();
        assert!((f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_precision_recall_weighted() {
        // true: [1, 1, 0, 0], pred: [1, 0, 1, 0]
        let y_true = [1.0, 1.0, 0.0, 0.0];
        let y_pred = [1.0, 0.0, 1.0, 0.0];
        let p = precision_weighted(&y_true, &y_pred).unwrap();
        let r = recall_weighted(&y_true, &y_pred).unwrap();
        assert!((p - 0.5).abs() < 1e-9);
        assert!((r - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_perfect_separation() {
        let auc = roc_auc(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert!((auc - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_random() {
        let auc = roc_auc(&[0.0, 1.0], &[0.5, 0.5]).unwrap();
        assert!((auc - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_single_class_rejected() {
        assert!(roc_auc(&[1.0, 1.0], &[0.5, 0.6]).is_err());
    }

    #[test]
    fn test_metric_roundtrip() {
        for m in [
            ObjectiveMetric::F1Weighted,
            ObjectiveMetric::Auc,
            ObjectiveMetric::PrecisionWeighted,
            ObjectiveMetric::RecallWeighted,
            ObjectiveMetric::Accuracy,
        ] {
            assert_eq!(m.as_str().parse::<ObjectiveMetric>().unwrap(), m);
        }
    }
}
