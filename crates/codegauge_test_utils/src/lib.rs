//! Shared fixtures for integration tests: in-memory store, seeded metric
//! data, ready datasets with real parquet artifacts, and a fault-injecting
//! artifact store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use codegauge_db::{
    create_pool, init_schema, CkMetricUpsert, CommitMetricUpsert, DatasetConfig, DbConfig, DbPool,
    MetricRepository, RepoRepository,
};
use codegauge_pipeline::{ColumnData, Context, Dependencies, Frame};
use codegauge_protocol::{ConfigMap, DatasetStatus};
use codegauge_store::{
    batches_to_parquet, dataset_uri, ArtifactStore, LocalArtifactStore, StoreError,
};
use tempfile::TempDir;

/// Feature columns every seeded dataset carries.
pub const SEED_FEATURES: &[&str] = &["la", "ld", "entropy"];
pub const SEED_TARGET: &str = "is_buggy";

/// In-memory pool with the schema applied.
pub async fn test_pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory())
        .await
        .expect("in-memory pool");
    init_schema(&pool).await.expect("schema");
    pool
}

/// A full test environment: pool, artifact dir and dependency bundle.
pub struct TestEnv {
    pub pool: DbPool,
    pub deps: Dependencies,
    pub store: Arc<LocalArtifactStore>,
    /// Owns the artifact directory; dropping it removes the files.
    pub dir: TempDir,
}

pub async fn test_env() -> TestEnv {
    let pool = test_pool().await;
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(LocalArtifactStore::new(dir.path()));
    let deps = Dependencies::new(pool.clone(), store.clone(), "file", "analytics");
    TestEnv {
        pool,
        deps,
        store,
        dir,
    }
}

/// Register a repository and return its id.
pub async fn seed_repository(pool: &DbPool) -> i64 {
    let repos = RepoRepository::new(pool.clone());
    repos
        .create("https://example.com/acme/widget.git")
        .await
        .expect("repository")
        .id
}

/// Seed `n_commits` labeled commits with one CK row each and a linear
/// parent chain (commit i's parent is commit i-1). Commit 0 has no parent.
pub async fn seed_commit_metrics(pool: &DbPool, repository_id: i64, n_commits: usize) {
    let metrics = MetricRepository::new(pool.clone());

    let commit_rows: Vec<CommitMetricUpsert> = (0..n_commits)
        .map(|i| {
            let mut values = ConfigMap::new();
            values.insert("la".into(), serde_json::json!(10.0 + i as f64));
            values.insert("ld".into(), serde_json::json!(2.0 + (i % 5) as f64));
            values.insert("entropy".into(), serde_json::json!(0.5 + (i % 7) as f64 / 10.0));
            values.insert("ns".into(), serde_json::json!(1.0));
            values.insert("exp".into(), serde_json::json!(i as f64));
            CommitMetricUpsert {
                commit_hash: commit_hash(i),
                parent_hashes: (i > 0).then(|| commit_hash(i - 1)),
                author_name: Some(if i % 10 == 0 {
                    "dependabot[bot]".to_string()
                } else {
                    format!("dev-{}", i % 3)
                }),
                author_date_ts: Some(1_600_000_000 + i as i64 * 86_400),
                is_merge: false,
                files_churned: Some(1 + (i % 4) as i64),
                values,
                is_buggy: Some(i % 3 == 0),
            }
        })
        .collect();
    metrics
        .upsert_commit_metrics(repository_id, &commit_rows)
        .await
        .expect("commit metrics");

    // Every commit touches the same two classes so parent lookups resolve.
    let mut ck_rows: Vec<CkMetricUpsert> = Vec::with_capacity(n_commits * 2);
    for i in 0..n_commits {
        for (file_idx, file) in ["src/module_0.rs", "src/module_1.rs"].iter().enumerate() {
            ck_rows.push(CkMetricUpsert {
                commit_hash: commit_hash(i),
                file_path: file.to_string(),
                class_name: format!("Widget{}", file_idx),
                cbo: Some(3.0 + ((i + file_idx) % 6) as f64),
                wmc: Some(10.0 + ((i + file_idx) % 9) as f64),
                dit: Some(1.0),
                rfc: Some(7.0 + (i % 3) as f64),
                lcom: Some(0.3),
                loc: Some(120.0 + i as f64),
            });
        }
    }
    metrics
        .upsert_ck_metrics(repository_id, &ck_rows)
        .await
        .expect("ck metrics");
}

pub fn commit_hash(i: usize) -> String {
    format!("{:040x}", i + 1)
}

/// Build a training frame: SEED_FEATURES plus identifiers and a binary
/// target correlated with `la`.
pub fn training_frame(rows: usize) -> Frame {
    let mut frame = Frame::new();
    frame
        .set_column(
            "commit_hash",
            ColumnData::Str((0..rows).map(|i| Some(commit_hash(i))).collect()),
        )
        .expect("column");
    frame
        .set_column(
            "file",
            ColumnData::Str((0..rows).map(|i| Some(format!("src/f{}.rs", i % 5))).collect()),
        )
        .expect("column");
    frame
        .set_column(
            "class_name",
            ColumnData::Str((0..rows).map(|i| Some(format!("C{}", i % 5))).collect()),
        )
        .expect("column");
    frame
        .set_column(
            "la",
            ColumnData::Float((0..rows).map(|i| Some(i as f64)).collect()),
        )
        .expect("column");
    frame
        .set_column(
            "ld",
            ColumnData::Float((0..rows).map(|i| Some((i % 13) as f64)).collect()),
        )
        .expect("column");
    frame
        .set_column(
            "entropy",
            ColumnData::Float((0..rows).map(|i| Some((i % 7) as f64 / 7.0)).collect()),
        )
        .expect("column");
    frame
        .set_column(
            SEED_TARGET,
            ColumnData::Float((0..rows).map(|i| Some(f64::from(i >= rows / 2))).collect()),
        )
        .expect("column");
    frame
}

pub fn seed_dataset_config() -> DatasetConfig {
    DatasetConfig {
        feature_columns: SEED_FEATURES.iter().map(|s| s.to_string()).collect(),
        target_column: SEED_TARGET.to_string(),
        cleaning_rules: Vec::new(),
        feature_selection: None,
        batch_size: None,
    }
}

/// Create a `ready` dataset whose parquet artifact really exists in the
/// environment's store. Returns the dataset id.
pub async fn seed_ready_dataset(env: &TestEnv, repository_id: i64, rows: usize) -> i64 {
    let dataset = env
        .deps
        .datasets
        .create(repository_id, "seed-dataset", &seed_dataset_config())
        .await
        .expect("dataset");

    let frame = training_frame(rows);
    let batch = frame.to_record_batch().expect("record batch");
    let bytes = batches_to_parquet(&[batch]).expect("parquet");
    let uri = dataset_uri("file", "analytics", dataset.id);
    env.store.put_bytes(&uri, &bytes).expect("artifact");

    env.deps
        .datasets
        .try_transition(
            dataset.id,
            DatasetStatus::Pending,
            DatasetStatus::Generating,
            None,
        )
        .await
        .expect("generating");
    env.deps
        .datasets
        .mark_ready(dataset.id, &uri, None, rows as i64, "seeded")
        .await
        .expect("ready");
    dataset.id
}

/// Artifact store that fails writes once armed; everything else delegates.
pub struct FailingStore {
    inner: LocalArtifactStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: LocalArtifactStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_next_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl ArtifactStore for FailingStore {
    fn put_bytes(&self, uri: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.put_bytes(uri, data)
    }

    fn get_bytes(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get_bytes(uri)
    }

    fn delete(&self, uri: &str) -> Result<(), StoreError> {
        self.inner.delete(uri)
    }

    fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        self.inner.exists(uri)
    }
}

/// Context wired to a fresh dataset-generation run.
pub fn dataset_context(job_id: i64, dataset_id: i64) -> Context {
    let mut ctx = Context::new(job_id);
    ctx.dataset_id = Some(dataset_id);
    ctx
}
