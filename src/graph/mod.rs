use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use derive_more::Display;
use serde::{Deserialize, Serialize};

mod activation_chain;
mod axons_context;
mod batch;
mod bipole;
mod chain;
mod context;
mod gradient;
mod neurons;

pub use activation_chain::{ActivationFunctionChain, ActivationFunctionChainActivation};
pub use axons_context::{AxonsContext, FreezeOutOverrides};
pub use batch::{Batch, BatchActivation};
pub use bipole::{BipoleGraph, BipoleGraphActivation, FanIn, FanInActivation, FanOut, PathCombinationStrategy};
pub use chain::{Chain, ChainActivation};
pub use context::{FreezeOutOverride, GraphContext};
pub use gradient::{AxonsGradient, BatchGradient, Gradient, GradientSupplier};
pub use neurons::{validate_examples, validate_input, FeatureOrientation, Neurons, NeuronsActivation};

use crate::nn::{ActivationFunctionType, TrainableAxons};

/// Identity of a component instance, the key of its axons context
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display(fmt = "component#{}", _0)]
pub struct ComponentId(u64);

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(0);

impl ComponentId {
    pub fn next() -> Self {
        ComponentId(NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A unit of the graph. `forward` never mutates its input and checks the
/// input against `input_neurons` before computing anything.
pub trait Component: Send + Sync {
    fn id(&self) -> ComponentId;

    fn name(&self) -> String;

    fn input_neurons(&self) -> Neurons;

    fn output_neurons(&self) -> Neurons;

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>>;

    /// the leaf components this component is built from
    fn decompose(&self) -> Vec<&dyn Component>;

    fn activation_function(&self) -> Option<ActivationFunctionType> {
        None
    }

    fn as_trainable(&self) -> Option<&dyn TrainableAxons> {
        None
    }
}

/// Result of one forward call. `back_propagate` consumes the activation, it
/// can only ever run once.
pub trait Activation: Send {
    fn output(&self) -> &NeuronsActivation;

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient>;

    /// the leaf activations this activation is built from
    fn decompose(&self) -> Vec<&dyn Activation>;

    fn regularisation_cost(&self) -> f32 {
        0.0
    }
}

pub fn total_regularisation_cost(activation: &dyn Activation) -> f32 {
    activation.decompose().into_iter().map(|a| a.regularisation_cost()).sum()
}

/// Every trainable leaf of `component`, found by decomposing it.
pub fn trainable_axons(component: &dyn Component) -> Vec<&dyn TrainableAxons> {
    component.decompose().into_iter().filter_map(|c| c.as_trainable()).collect()
}
