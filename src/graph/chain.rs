use std::sync::Arc;

use anyhow::Result;
use log::{debug, trace};

use super::*;
use crate::NnError;

type ChainHook = dyn Fn(&GraphContext, usize) -> GraphContext + Send + Sync;

/// Sequential composition, every output is the next component's input
pub struct Chain {
    id: ComponentId,
    components: Vec<Arc<dyn Component>>,
    hook: Option<Box<ChainHook>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("components", &self.components.len())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Chain {
    pub fn new(components: Vec<Arc<dyn Component>>) -> Result<Self> {
        if components.is_empty() {
            return Err(NnError::EmptyChain.into());
        }
        for pair in components.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            if left.output_neurons().features() != right.input_neurons().features() {
                return Err(NnError::ShapeMismatch {
                    component: right.name(),
                    expected: right.input_neurons().features(),
                    actual: left.output_neurons().features(),
                }
                .into());
            }
        }
        let id = ComponentId::next();
        debug!("built chain {id} of {} components", components.len());
        Ok(Chain { id, components, hook: None })
    }

    /// Derives the context each step runs with from the context the chain was
    /// called with.
    pub fn with_context_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&GraphContext, usize) -> GraphContext + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn context(&self, outer: &GraphContext, index: usize) -> GraphContext {
        match &self.hook {
            Some(hook) => hook(outer, index),
            None => outer.clone(),
        }
    }

    pub fn forward_chain(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<ChainActivation> {
        let mut steps: Vec<Box<dyn Activation>> = Vec::with_capacity(self.components.len());
        for (i, component) in self.components.iter().enumerate() {
            let step_ctx = self.context(ctx, i);
            let x = steps.last().map_or(input, |a| a.output());
            trace!("chain {} forward step {i} through {}", self.id, component.name());
            let activation = component.forward(x, &step_ctx)?;
            steps.push(activation);
        }
        // chains are never empty
        let output = steps[steps.len() - 1].output().clone();
        Ok(ChainActivation { steps, output })
    }
}

impl Component for Chain {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("chain {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.components[0].input_neurons()
    }

    fn output_neurons(&self) -> Neurons {
        self.components[self.components.len() - 1].output_neurons()
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        Ok(Box::new(self.forward_chain(input, ctx)?))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        self.components.iter().flat_map(|c| c.decompose()).collect()
    }
}

pub struct ChainActivation {
    steps: Vec<Box<dyn Activation>>,
    output: NeuronsActivation,
}

impl ChainActivation {
    pub fn steps(&self) -> &[Box<dyn Activation>] {
        &self.steps
    }
}

impl Activation for ChainActivation {
    fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let mut grad = outer;
        for (i, step) in self.steps.into_iter().enumerate().rev() {
            trace!("chain backward step {i}");
            grad = step.back_propagate(grad)?;
        }
        Ok(grad)
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        self.steps.iter().flat_map(|a| a.decompose()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{ActivationFunctionComponent, FullyConnectedAxons};
    use crate::{AxonsConfig, EngineConfig};
    use ndarray::prelude::*;

    fn fc(rows: usize, cols: usize, seed: f32) -> Arc<dyn Component> {
        let weights = Array2::from_shape_fn((rows, cols), |(i, j)| seed * (i as f32 + 1.0) - 0.3 * j as f32);
        Arc::new(FullyConnectedAxons::with_weights(Neurons::new(cols, true), weights, Some(Array1::from_elem(rows, 0.1))).unwrap())
    }

    fn relu(features: usize) -> Arc<dyn Component> {
        Arc::new(ActivationFunctionComponent::relu(Neurons::new(features, false)))
    }

    #[test]
    fn test_empty_and_mismatched() {
        let err = Chain::new(vec![]).unwrap_err();
        assert_eq!(err.downcast_ref::<NnError>(), Some(&NnError::EmptyChain));

        let err = Chain::new(vec![fc(3, 4, 0.5), fc(2, 5, 0.5)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NnError>(),
            Some(NnError::ShapeMismatch { expected: 5, actual: 3, .. })
        ));
    }

    #[test]
    fn test_chain_associativity() {
        let ctx = GraphContext::inference(EngineConfig::sequential());
        let (a, b, c) = (fc(3, 4, 0.5), relu(3), fc(2, 3, -0.25));
        let chain = Chain::new(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let x = NeuronsActivation::rows_span_features(Array2::from_shape_fn((4, 5), |(i, j)| (i * 5 + j) as f32 / 10.0 - 1.0));

        let y = chain.forward(&x, &ctx).unwrap();
        let ya = a.forward(&x, &ctx).unwrap();
        let yb = b.forward(ya.output(), &ctx).unwrap();
        let yc = c.forward(yb.output(), &ctx).unwrap();
        assert_eq!(y.output().matrix(), yc.output().matrix());
        assert_eq!(y.decompose().len(), 3);
        assert_eq!(chain.decompose().len(), 3);
        assert_eq!(chain.output_neurons().features(), 2);
    }

    #[test]
    fn test_backward_shape_duality_and_suppliers() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let chain = Chain::new(vec![fc(3, 4, 0.5), relu(3), fc(2, 3, -0.25)]).unwrap();
        let x = NeuronsActivation::rows_span_features(Array2::from_elem((4, 6), 0.5));
        let y = chain.forward(&x, &ctx).unwrap();
        assert_eq!(y.output().shape(), (2, 6));

        let g = Gradient::new(NeuronsActivation::rows_span_features(Array2::ones((2, 6))));
        let dx = y.back_propagate(g).unwrap();
        assert_eq!(dx.output().shape(), x.shape());
        // last axons first, suppliers only ever appended
        assert_eq!(dx.suppliers().len(), 2);
        let ids: Vec<ComponentId> = chain.decompose().iter().filter(|c| c.as_trainable().is_some()).map(|c| c.id()).collect();
        let order: Vec<ComponentId> = dx.suppliers().iter().map(|s| s.axons()).collect();
        assert_eq!(order, vec![ids[1], ids[0]]);
    }

    #[test]
    fn test_failing_step_aborts() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let uninitialised: Arc<dyn Component> = Arc::new(FullyConnectedAxons::uninitialised(Neurons::new(3, true), Neurons::new(3, false)));
        let chain = Chain::new(vec![fc(3, 4, 0.5), uninitialised]).unwrap();
        let x = NeuronsActivation::rows_span_features(Array2::zeros((4, 1)));
        let err = chain.forward(&x, &ctx).err().unwrap();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::UninitialisedWeights(_))));
    }

    #[test]
    fn test_context_hook() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let a = fc(3, 4, 0.5);
        let a_id = a.id();
        // freeze the first step only
        let chain = Chain::new(vec![a, relu(3), fc(2, 3, -0.25)]).unwrap().with_context_hook(move |outer, i| {
            if i == 0 {
                outer.axons_context(a_id, AxonsConfig::default).with_freeze_out(true);
            }
            outer.clone()
        });
        let x = NeuronsActivation::rows_span_features(Array2::from_elem((4, 2), 0.5));
        let y = chain.forward(&x, &ctx).unwrap();
        let g = Gradient::new(NeuronsActivation::rows_span_features(Array2::ones((2, 2))));
        let dx = y.back_propagate(g).unwrap();
        assert_eq!(dx.suppliers().len(), 1);
        assert_ne!(dx.suppliers()[0].axons(), a_id);
    }
}
