use std::path::Path;

use anyhow::{Context, Result};
use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// Per-axons hyperparameters, the default a component hands to
/// `GraphContext::axons_context` the first time its context is requested.
#[derive(Derivative, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[derivative(Default)]
#[serde(default)]
pub struct AxonsConfig {
    #[derivative(Default(value = "0.0"))]
    pub regularisation_lambda: f32,
    #[derivative(Default(value = "1.0"))]
    pub input_dropout_keep_probability: f32,
    #[derivative(Default(value = "false"))]
    pub freeze_out: bool,
}

impl AxonsConfig {
    pub fn with_regularisation_lambda(mut self, lambda: f32) -> Self {
        self.regularisation_lambda = lambda;
        self
    }

    pub fn with_input_dropout_keep_probability(mut self, keep: f32) -> Self {
        self.input_dropout_keep_probability = keep;
        self
    }

    pub fn with_freeze_out(mut self, freeze_out: bool) -> Self {
        self.freeze_out = freeze_out;
        self
    }
}

#[derive(Derivative, Serialize, Deserialize, Clone, Debug)]
#[derivative(Default)]
#[serde(default)]
pub struct EngineConfig {
    /// threads used for batch branches, and the size of the background gradient pool
    #[derivative(Default(value = "default_worker_threads()"))]
    pub worker_threads: usize,
    /// compute trainable parameter gradients on the worker pool during backward,
    /// otherwise they are computed when the supplier is resolved
    #[derivative(Default(value = "true"))]
    pub async_parameter_gradients: bool,
    #[derivative(Default(value = "0.99"))]
    pub batch_norm_decay: f32,
    #[derivative(Default(value = "1e-5"))]
    pub batch_norm_epsilon: f32,
    pub default_axons: AxonsConfig,
}

impl EngineConfig {
    pub fn from_ron_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .context(format!("unable to read engine config {}", path.display()))?;
        ron::from_str(&text).context(format!("malformed engine config {}", path.display()))
    }

    pub fn sequential() -> Self {
        EngineConfig { worker_threads: 1, async_parameter_gradients: false, ..Default::default() }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[test]
fn test_partial_config() {
    let config: EngineConfig = ron::from_str("(batch_norm_epsilon: 0.001)").unwrap();
    assert_eq!(config.batch_norm_epsilon, 0.001);
    assert_eq!(config.batch_norm_decay, 0.99);
    assert!(config.worker_threads >= 1);
    assert_eq!(config.default_axons, AxonsConfig::default());

    let axons: AxonsConfig = ron::from_str("(freeze_out: true)").unwrap();
    assert!(axons.freeze_out);
    assert_eq!(axons.input_dropout_keep_probability, 1.0);
}

#[test]
fn test_from_ron_file() {
    let path = std::env::temp_dir().join(format!("grownet_graph_config_{}.ron", std::process::id()));
    std::fs::write(&path, "(worker_threads: 2, async_parameter_gradients: false)").unwrap();
    let config = EngineConfig::from_ron_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(config.worker_threads, 2);
    assert!(!config.async_parameter_gradients);

    assert!(EngineConfig::from_ron_file(path).is_err());
}
