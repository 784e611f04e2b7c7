use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod configs;
pub mod error;
pub mod exec;
pub mod graph;
pub mod nn;

pub use configs::{AxonsConfig, EngineConfig};
pub use error::NnError;
pub use graph::{
    Activation, ActivationFunctionChain, AxonsContext, AxonsGradient, Batch, BatchActivation,
    BatchGradient, BipoleGraph, Chain, Component, ComponentId, FanIn, FanOut, FeatureOrientation,
    Gradient, GradientSupplier, GraphContext, Neurons, NeuronsActivation,
    PathCombinationStrategy, total_regularisation_cost, trainable_axons,
};
pub use nn::{CostFunction, TrainableAxons};

pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        ron::to_string(self).context("Failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}

#[test]
fn config_round_trip_test() {
    let mut config = EngineConfig::default();
    config.worker_threads = 3;
    config.batch_norm_decay = 0.5;
    let text = config.config().unwrap();

    let mut loaded = EngineConfig::default();
    loaded.load_config(&text).unwrap();
    assert_eq!(loaded.worker_threads, 3);
    assert_eq!(loaded.batch_norm_decay, 0.5);
    assert!(loaded.load_config("(worker_threads: \"many\")").is_err());
}
