//! Commit-level prediction package.
//!
//! The inference handler aggregates per-file predictions into this record;
//! it is stored verbatim on the job row and surfaced on the wire.

use serde::{Deserialize, Serialize};

/// Per-file entry in the prediction package. `class` is the wire-level field
/// name; frames carry the same column as `class_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePrediction {
    pub file: String,
    pub class: Option<String>,
    pub prediction: i32,
    pub probability: f64,
}

/// Aggregated commit-level result of an inference job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPackage {
    /// 1 if any analyzed file is predicted buggy, 0 otherwise, -1 when no
    /// rows were available.
    pub commit_prediction: i32,
    /// Highest per-file bug probability, or -1.0 when unavailable.
    pub max_bug_probability: f64,
    pub num_files_analyzed: usize,
    pub details: Option<Vec<FilePrediction>>,
    pub error: Option<String>,
}

impl PredictionPackage {
    /// Package for an inference that found no feature rows.
    pub fn empty(error: impl Into<String>) -> Self {
        Self {
            commit_prediction: -1,
            max_bug_probability: -1.0,
            num_files_analyzed: 0,
            details: None,
            error: Some(error.into()),
        }
    }

    /// Aggregate per-file predictions into the commit-level package.
    pub fn from_details(details: Vec<FilePrediction>) -> Self {
        if details.is_empty() {
            return Self::empty("no features");
        }
        let commit_prediction = i32::from(details.iter().any(|d| d.prediction == 1));
        let max_bug_probability = details
            .iter()
            .map(|d| d.probability)
            .fold(f64::NEG_INFINITY, f64::max);
        Self {
            commit_prediction,
            max_bug_probability,
            num_files_analyzed: details.len(),
            details: Some(details),
            error: None,
        }
    }
}
