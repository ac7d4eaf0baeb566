//! Per-run dependency bundle.
//!
//! Constructed once per job execution; repositories are thin clones over the
//! shared pool, the artifact store is shared behind an `Arc`. Steps receive
//! the whole bundle and use the slice they declare in their docs.

use std::sync::Arc;

use codegauge_db::{
    CommitRepository, DatasetRepository, DbPool, JobRepository, MetricRepository, ModelRepository,
    RegistryRepository, RepoRepository, XaiRepository,
};
use codegauge_store::ArtifactStore;

#[derive(Clone)]
pub struct Dependencies {
    pub pool: DbPool,
    pub jobs: JobRepository,
    pub datasets: DatasetRepository,
    pub models: ModelRepository,
    pub repositories: RepoRepository,
    pub metrics: MetricRepository,
    pub commits: CommitRepository,
    pub xai: XaiRepository,
    pub registries: RegistryRepository,

    pub store: Arc<dyn ArtifactStore>,
    /// URI scheme and bucket used for every artifact this run writes.
    pub artifact_scheme: String,
    pub artifact_bucket: String,
}

impl Dependencies {
    pub fn new(
        pool: DbPool,
        store: Arc<dyn ArtifactStore>,
        artifact_scheme: impl Into<String>,
        artifact_bucket: impl Into<String>,
    ) -> Self {
        Self {
            jobs: JobRepository::new(pool.clone()),
            datasets: DatasetRepository::new(pool.clone()),
            models: ModelRepository::new(pool.clone()),
            repositories: RepoRepository::new(pool.clone()),
            metrics: MetricRepository::new(pool.clone()),
            commits: CommitRepository::new(pool.clone()),
            xai: XaiRepository::new(pool.clone()),
            registries: RegistryRepository::new(pool.clone()),
            pool,
            store,
            artifact_scheme: artifact_scheme.into(),
            artifact_bucket: artifact_bucket.into(),
        }
    }
}
