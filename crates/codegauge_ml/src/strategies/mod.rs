//! Concrete model strategies.

pub mod forest;
pub mod logistic;
pub mod tree;

pub use forest::RandomForestStrategy;
pub use logistic::LogisticRegressionStrategy;
pub use tree::DecisionTreeStrategy;
