use thiserror::Error;

use crate::graph::{ComponentId, FeatureOrientation, PathCombinationStrategy};

/// Kinds of failure raised by the graph engine. Every fallible call returns
/// `anyhow::Result`; downcast to `NnError` to tell the kinds apart.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NnError {
    #[error("{component} expects {expected:?} orientation, got {actual:?}")]
    OrientationMismatch {
        component: String,
        expected: FeatureOrientation,
        actual: FeatureOrientation,
    },
    #[error("{component} expects {expected} rows or columns, got {actual}")]
    ShapeMismatch {
        component: String,
        expected: usize,
        actual: usize,
    },
    #[error("branch outputs cannot be combined with {strategy:?}: {detail}")]
    BranchShapeMismatch {
        strategy: PathCombinationStrategy,
        detail: String,
    },
    #[error("a chain needs at least one component")]
    EmptyChain,
    #[error("a batch needs at least one component")]
    EmptyBatch,
    #[error("batch of {expected} components was given {actual} inputs")]
    BatchSizeMismatch { expected: usize, actual: usize },
    #[error("the last component of the chain is not an activation function")]
    MissingActivationFunction,
    #[error("weights of {0} have not been initialised")]
    UninitialisedWeights(ComponentId),
    #[error("batch norm {0} has no running statistics for a single example")]
    MissingRunningStatistics(ComponentId),
    #[error("computing the trainable gradient of {0} failed")]
    GradientComputation(ComponentId),
    #[error("worker failure: {0}")]
    WorkerFailure(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}
