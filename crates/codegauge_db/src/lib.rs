//! Relational store for codegauge.
//!
//! SQLite (default feature) or PostgreSQL behind a concrete `DbPool` alias.
//! All entity access goes through the repository layer in [`repos`]; job and
//! XAI status mutations are compare-and-set only.
//!
//! # Example
//!
//! ```rust,ignore
//! use codegauge_db::{create_pool, init_schema, DbConfig, JobRepository};
//!
//! let pool = create_pool(DbConfig::sqlite("./codegauge.db")).await?;
//! init_schema(&pool).await?;
//! let jobs = JobRepository::new(pool.clone());
//! ```

pub mod error;
pub mod models;
pub mod pool;
pub mod repos;
pub mod schema;

pub use error::{DbError, Result};
pub use models::{
    BotPatternRow, BotPatternType, CapabilityRow, CkMetricRow, CleaningRuleConfig,
    CommitDetailRow, CommitMetricRow, DatasetConfig, DatasetRow, FeatureSelectionConfig,
    FileDiffRow, JobRow, ModelRow, RepositoryRow, XaiResultRow,
};
pub use pool::{create_pool, DbConfig, DbPool, DbRow, PoolError};
pub use repos::{
    derive_repo_name, CkMetricUpsert, CommitDetailUpsert, CommitMetricUpsert, CommitRepository,
    DatasetRepository, FileDiffUpsert, JobRepository, MetricRepository, ModelRepository, NewJob,
    NewModel, RegistryKind, RegistryRepository, RepoRepository, TerminalResults, XaiRepository,
};
pub use schema::init_schema;
