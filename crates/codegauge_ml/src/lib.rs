//! Model, search and explanation strategies.
//!
//! Everything here is pure computation over `Vec<Vec<f64>>` feature matrices
//! and binary labels; frames, stores and repositories stay out of this crate
//! so strategies remain trivially testable.

pub mod error;
pub mod metrics;
pub mod search;
pub mod strategies;
pub mod strategy;
pub mod xai;

pub use error::{MlError, Result};
pub use metrics::{
    accuracy, evaluate, f1_weighted, precision_weighted, recall_weighted, roc_auc,
    ObjectiveMetric,
};
pub use search::{
    cross_validate, stratified_kfold, Pruner, PrunerKind, RandomSampler, Trial,
};
pub use strategy::{
    create_strategy, is_tree_based, load_strategy, save_strategy, supported_model_types,
    ModelStrategy, ModelTypeInfo, PathStep, MODEL_TYPE_FOREST, MODEL_TYPE_LOGISTIC,
    MODEL_TYPE_TREE,
};
pub use xai::{
    applicable_xai_types, create_xai_strategy, ExplanationRequest, RowIdent, XaiStrategy,
    MAX_EXPLAINED_ROWS,
};
