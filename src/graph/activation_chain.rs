use std::sync::Arc;

use anyhow::Result;
use log::debug;

use super::*;
use crate::nn::CostFunction;
use crate::NnError;

/// A chain whose last component is an activation function, so that
/// backpropagation can start straight from a cost function.
pub struct ActivationFunctionChain {
    id: ComponentId,
    preceding: Option<Chain>,
    last: Arc<dyn Component>,
    function: ActivationFunctionType,
    // false when `last` is itself a chain ending in the function
    leaf: bool,
}

impl ActivationFunctionChain {
    pub fn new(mut components: Vec<Arc<dyn Component>>) -> Result<Self> {
        let last = components.pop().ok_or(NnError::EmptyChain)?;
        let function = last.activation_function().ok_or(NnError::MissingActivationFunction)?;
        let preceding = if components.is_empty() {
            None
        } else {
            let chain = Chain::new(components)?;
            if chain.output_neurons().features() != last.input_neurons().features() {
                return Err(NnError::ShapeMismatch {
                    component: last.name(),
                    expected: last.input_neurons().features(),
                    actual: chain.output_neurons().features(),
                }
                .into());
            }
            Some(chain)
        };
        let leaf = last.decompose().len() == 1;
        let id = ComponentId::next();
        debug!("built activation function chain {id} ending in {function:?}");
        Ok(ActivationFunctionChain { id, preceding, last, function, leaf })
    }

    pub fn function(&self) -> ActivationFunctionType {
        self.function
    }

    pub fn forward_chain(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<ActivationFunctionChainActivation> {
        let preceding = match &self.preceding {
            Some(chain) => Some(chain.forward_chain(input, ctx)?),
            None => None,
        };
        let x = preceding.as_ref().map_or(input, |a| a.output());
        let last = self.last.forward(x, ctx)?;
        Ok(ActivationFunctionChainActivation { preceding, last, function: self.function, leaf: self.leaf })
    }
}

impl Component for ActivationFunctionChain {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("activation function chain {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        match &self.preceding {
            Some(chain) => chain.input_neurons(),
            None => self.last.input_neurons(),
        }
    }

    fn output_neurons(&self) -> Neurons {
        self.last.output_neurons()
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        Ok(Box::new(self.forward_chain(input, ctx)?))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        let mut leaves = self.preceding.as_ref().map_or_else(Vec::new, |c| c.decompose());
        leaves.extend(self.last.decompose());
        leaves
    }

    fn activation_function(&self) -> Option<ActivationFunctionType> {
        Some(self.function)
    }
}

pub struct ActivationFunctionChainActivation {
    preceding: Option<ChainActivation>,
    last: Box<dyn Activation>,
    function: ActivationFunctionType,
    leaf: bool,
}

impl ActivationFunctionChainActivation {
    pub fn cost(&self, cost: CostFunction, desired: &NeuronsActivation) -> Result<f32> {
        cost.cost(self.output().matrix(), desired.matrix())
    }

    /// Backpropagates from `cost` against `desired`. When the last component is
    /// a single activation function, the gradient w.r.t. its input is computed
    /// in one step. A nested chain in last position is backpropagated through
    /// from dJ/dy instead.
    pub fn back_propagate_cost(self, cost: CostFunction, desired: &NeuronsActivation) -> Result<Gradient> {
        let output = self.last.output();
        let grad = if self.leaf {
            let dz = cost.input_gradient(self.function, output.matrix(), desired.matrix())?;
            Gradient::new(output.with_matrix(dz))
        } else {
            let dy = cost.gradient(output.matrix(), desired.matrix())?;
            let outer = Gradient::new(output.with_matrix(dy));
            self.last.back_propagate(outer)?
        };
        match self.preceding {
            Some(chain) => Box::new(chain).back_propagate(grad),
            None => Ok(grad),
        }
    }
}

impl Activation for ActivationFunctionChainActivation {
    fn output(&self) -> &NeuronsActivation {
        self.last.output()
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let this = *self;
        let grad = this.last.back_propagate(outer)?;
        match this.preceding {
            Some(chain) => Box::new(chain).back_propagate(grad),
            None => Ok(grad),
        }
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        let mut leaves = self.preceding.as_ref().map_or_else(Vec::new, |c| c.decompose());
        leaves.extend(self.last.decompose());
        leaves
    }
}
