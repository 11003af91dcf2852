//! Optimization module - correlated-sampling cost function and the
//! linear-method eigenproblem assembled from its records.

mod cost;
mod eigen;

pub use cost::{CostFunctionEvaluator, WEIGHT_SKIP_TOLERANCE};
pub use eigen::GeneralizedEigenproblemBuilder;
