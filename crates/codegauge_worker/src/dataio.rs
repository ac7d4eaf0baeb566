//! Data loading: metric rows out of the store and into frames.
//!
//! Dataset generation streams labeled commit metrics (joined with per-class
//! CK metrics) in fixed-size commit batches; inference loads the feature
//! rows for one `(repository, commit)` pair.

use std::time::Duration;

use codegauge_db::{CkMetricRow, CommitMetricRow, MetricRepository};
use codegauge_pipeline::{ColumnData, Frame, PipelineError, Result};
use codegauge_store::{parquet_to_batches, ArtifactStore, StoreError};
use tracing::warn;

/// Commit-level metric columns copied onto every row of that commit.
pub const COMMIT_METRIC_COLUMNS: &[&str] = &[
    "la", "ld", "ns", "nd", "nf", "entropy", "ndev", "age", "nuc", "exp", "rexp", "sexp",
];

/// Class-level metric columns.
pub const CK_METRIC_COLUMNS: &[&str] = &["cbo", "wmc", "dit", "rfc", "lcom", "loc"];

/// Streams labeled metric rows for one repository in commit batches.
pub struct DataLoader {
    metrics: MetricRepository,
    repository_id: i64,
}

/// Row accumulator used while joining commit and class metrics.
#[derive(Default)]
struct FrameBuilder {
    commit_hash: Vec<Option<String>>,
    parent_hash: Vec<Option<String>>,
    file: Vec<Option<String>>,
    class_name: Vec<Option<String>>,
    author_name: Vec<Option<String>>,
    author_date_ts: Vec<Option<f64>>,
    files_churned: Vec<Option<f64>>,
    commit_values: Vec<Vec<Option<f64>>>,
    ck_values: Vec<Vec<Option<f64>>>,
    is_buggy: Vec<Option<f64>>,
}

impl FrameBuilder {
    fn new() -> Self {
        Self {
            commit_values: vec![Vec::new(); COMMIT_METRIC_COLUMNS.len()],
            ck_values: vec![Vec::new(); CK_METRIC_COLUMNS.len()],
            ..Default::default()
        }
    }

    fn push(&mut self, commit: &CommitMetricRow, ck: Option<&CkMetricRow>) {
        self.commit_hash.push(Some(commit.commit_hash.clone()));
        self.parent_hash
            .push(commit.first_parent().map(str::to_string));
        self.file.push(ck.map(|c| c.file_path.clone()).or(Some(String::new())));
        self.class_name
            .push(ck.map(|c| c.class_name.clone()).or(Some(String::new())));
        self.author_name.push(commit.author_name.clone());
        self.author_date_ts
            .push(commit.author_date_ts.map(|t| t as f64));
        self.files_churned
            .push(commit.files_churned.map(|f| f as f64));

        let commit_metrics = [
            commit.la, commit.ld, commit.ns, commit.nd, commit.nf, commit.entropy,
            commit.ndev, commit.age, commit.nuc, commit.exp, commit.rexp, commit.sexp,
        ];
        for (col, value) in self.commit_values.iter_mut().zip(commit_metrics) {
            col.push(value);
        }

        let ck_metrics = match ck {
            Some(ck) => [ck.cbo, ck.wmc, ck.dit, ck.rfc, ck.lcom, ck.loc],
            None => [None; 6],
        };
        for (col, value) in self.ck_values.iter_mut().zip(ck_metrics) {
            col.push(value);
        }

        self.is_buggy
            .push(commit.is_buggy.map(|b| if b { 1.0 } else { 0.0 }));
    }

    fn build(self) -> Result<Frame> {
        let mut frame = Frame::new();
        frame.set_column("commit_hash", ColumnData::Str(self.commit_hash))?;
        frame.set_column("parent_hash", ColumnData::Str(self.parent_hash))?;
        frame.set_column("file", ColumnData::Str(self.file))?;
        frame.set_column("class_name", ColumnData::Str(self.class_name))?;
        frame.set_column("author_name", ColumnData::Str(self.author_name))?;
        frame.set_column("author_date_ts", ColumnData::Float(self.author_date_ts))?;
        frame.set_column("files_churned", ColumnData::Float(self.files_churned))?;
        for (name, values) in COMMIT_METRIC_COLUMNS.iter().zip(self.commit_values) {
            frame.set_column(name, ColumnData::Float(values))?;
        }
        for (name, values) in CK_METRIC_COLUMNS.iter().zip(self.ck_values) {
            frame.set_column(name, ColumnData::Float(values))?;
        }
        frame.set_column("is_buggy", ColumnData::Float(self.is_buggy))?;
        Ok(frame)
    }
}

impl DataLoader {
    pub fn new(metrics: MetricRepository, repository_id: i64) -> Self {
        Self {
            metrics,
            repository_id,
        }
    }

    /// Labeled commit count, used for progress estimation.
    pub async fn estimate_total_commits(&self) -> Result<i64> {
        Ok(self.metrics.count_labeled_commits(self.repository_id).await?)
    }

    /// Fetch one batch of `limit` commits starting at `offset`, joined with
    /// their class metrics. An empty frame signals the end of the stream.
    pub async fn fetch_batch(&self, offset: i64, limit: i64) -> Result<Frame> {
        let commits = self
            .metrics
            .fetch_commit_batch(self.repository_id, offset, limit)
            .await?;

        let mut builder = FrameBuilder::new();
        for commit in &commits {
            let cks = self
                .metrics
                .ck_metrics_for_commit(self.repository_id, &commit.commit_hash)
                .await?;
            if cks.is_empty() {
                builder.push(commit, None);
            } else {
                for ck in &cks {
                    builder.push(commit, Some(ck));
                }
            }
        }
        builder.build()
    }

    /// Class metrics of the parent commit, keyed `(file, class_name)`.
    pub async fn parent_ck_metrics(
        &self,
        parent_hash: &str,
    ) -> Result<Vec<CkMetricRow>> {
        Ok(self
            .metrics
            .ck_metrics_for_commit(self.repository_id, parent_hash)
            .await?)
    }
}

/// Feature rows for one `(repository, commit)`, with identifier columns
/// `file` and `class_name` leading. Returns an empty frame when the commit
/// has no metrics.
pub async fn load_inference_features(
    metrics: &MetricRepository,
    repository_id: i64,
    commit_hash: &str,
) -> Result<Frame> {
    let Some(commit) = metrics.commit_metric(repository_id, commit_hash).await? else {
        return Ok(Frame::new());
    };
    let cks = metrics.ck_metrics_for_commit(repository_id, commit_hash).await?;

    let mut builder = FrameBuilder::new();
    if cks.is_empty() {
        builder.push(&commit, None);
    } else {
        for ck in &cks {
            builder.push(&commit, Some(ck));
        }
    }
    builder.build()
}

/// Read attempts for transient artifact failures. Reads are idempotent, so
/// a bounded local retry is safe; writes surface immediately.
const ARTIFACT_READ_ATTEMPTS: usize = 3;
const ARTIFACT_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Fetch an artifact with a small bounded retry on transient IO errors.
pub async fn fetch_artifact(store: &dyn ArtifactStore, uri: &str) -> Result<Vec<u8>> {
    let mut last_err = None;
    for attempt in 1..=ARTIFACT_READ_ATTEMPTS {
        match store.get_bytes(uri) {
            Ok(bytes) => return Ok(bytes),
            // Missing objects are permanent; only IO errors retry.
            Err(e @ StoreError::NotFound(_)) => return Err(e.into()),
            Err(e) => {
                warn!("Artifact read {} failed (attempt {}): {}", uri, attempt, e);
                last_err = Some(e);
                if attempt < ARTIFACT_READ_ATTEMPTS {
                    tokio::time::sleep(ARTIFACT_READ_BACKOFF).await;
                }
            }
        }
    }
    Err(last_err
        .map(PipelineError::from)
        .unwrap_or_else(|| PipelineError::Frame(format!("artifact read failed: {}", uri))))
}

/// Load a parquet dataset artifact into a single frame.
pub async fn load_dataset_frame(store: &dyn ArtifactStore, uri: &str) -> Result<Frame> {
    let bytes = fetch_artifact(store, uri).await?;
    let batches = parquet_to_batches(bytes)?;
    if batches.is_empty() {
        return Err(PipelineError::Frame(format!("dataset at {} is empty", uri)));
    }
    let frames: Vec<Frame> = batches
        .iter()
        .map(Frame::from_record_batch)
        .collect::<Result<_>>()?;
    Frame::concat(&frames)
}
