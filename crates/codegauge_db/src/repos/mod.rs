//! Repository layer: every mutation opens a short-lived transactional scope
//! and commits or rolls back before returning.

pub mod commits;
pub mod datasets;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod repositories;
pub mod xai;

pub use commits::{CommitDetailUpsert, CommitRepository, FileDiffUpsert};
pub use datasets::DatasetRepository;
pub use jobs::{JobRepository, NewJob, TerminalResults};
pub use metrics::{CkMetricUpsert, CommitMetricUpsert, MetricRepository};
pub use models::{ModelRepository, NewModel};
pub use registry::{RegistryKind, RegistryRepository};
pub use repositories::{derive_repo_name, RepoRepository};
pub use xai::XaiRepository;
