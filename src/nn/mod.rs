use anyhow::Result;
use ndarray::prelude::*;

pub mod activations;
pub mod axons;
pub mod batchnorm;
pub mod cost;
pub mod utils;

pub use activations::{ActivationFunctionComponent, ActivationFunctionType};
pub use axons::{FullyConnectedAxons, PassThroughAxons, ScaleAndShiftAxons};
pub use batchnorm::BatchNorm;
pub use cost::CostFunction;

use crate::graph::{AxonsGradient, ComponentId};

/// Weights and optional biases of an axons instance
#[derive(Clone, Debug, PartialEq)]
pub struct AxonWeights {
    pub weights: Array2<f32>,
    pub biases: Option<Array1<f32>>,
}

/// Surface an optimizer uses to read and update a trainable component
pub trait TrainableAxons: Send + Sync {
    fn axons_id(&self) -> ComponentId;

    fn is_initialised(&self) -> bool;

    fn initialise(&self, weights: Array2<f32>, biases: Option<Array1<f32>>) -> Result<()>;

    /// a read only copy, for regularisation costs and checkpoints
    fn detached_weights(&self) -> Result<AxonWeights>;

    /// `weights += scale * delta`, a negative scale descends
    fn adjust(&self, delta: &AxonsGradient, scale: f32) -> Result<()>;
}
