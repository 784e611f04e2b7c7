use std::sync::Arc;

use anyhow::Result;
use log::{debug, trace};

use super::*;
use crate::exec::WorkerPool;
use crate::NnError;

type BatchHook = dyn Fn(&GraphContext, &dyn Component, usize) -> GraphContext + Send + Sync;

/// N independent components, the i-th consumes the i-th of N inputs. The
/// branches run in parallel; outputs always come back in branch order.
pub struct Batch {
    components: Vec<Arc<dyn Component>>,
    hook: Option<Box<BatchHook>>,
}

impl Batch {
    pub fn new(components: Vec<Arc<dyn Component>>) -> Result<Self> {
        if components.is_empty() {
            return Err(NnError::EmptyBatch.into());
        }
        debug!("built batch of {} components", components.len());
        Ok(Batch { components, hook: None })
    }

    pub fn with_context_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&GraphContext, &dyn Component, usize) -> GraphContext + Send + Sync + 'static,
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
            Some(hook) => hook(outer, self.components[index].as_ref(), index),
            None => outer.clone(),
        }
    }

    pub fn forward(&self, inputs: Vec<NeuronsActivation>, ctx: &GraphContext) -> Result<BatchActivation> {
        if inputs.len() != self.components.len() {
            return Err(NnError::BatchSizeMismatch { expected: self.components.len(), actual: inputs.len() }.into());
        }
        let tasks: Vec<(NeuronsActivation, GraphContext)> =
            inputs.into_iter().enumerate().map(|(i, x)| (x, self.context(ctx, i))).collect();

        trace!("batch forward over {} branches", tasks.len());
        let activations = ctx.pool().map_indexed(tasks, |i, (x, branch_ctx)| {
            self.components[i].forward(&x, &branch_ctx)
        })?;
        let outputs = activations.iter().map(|a| a.output().clone()).collect();
        Ok(BatchActivation { activations, outputs, pool: ctx.shared_pool() })
    }

    pub fn decompose(&self) -> Vec<&dyn Component> {
        self.components.iter().flat_map(|c| c.decompose()).collect()
    }
}

pub struct BatchActivation {
    activations: Vec<Box<dyn Activation>>,
    outputs: Vec<NeuronsActivation>,
    pool: Arc<WorkerPool>,
}

impl BatchActivation {
    pub fn outputs(&self) -> &[NeuronsActivation] {
        &self.outputs
    }

    pub fn activations(&self) -> &[Box<dyn Activation>] {
        &self.activations
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Backward through every branch in parallel. The outer suppliers come
    /// first, followed by each branch's suppliers in branch order.
    pub fn back_propagate(self, outer: BatchGradient) -> Result<BatchGradient> {
        if outer.len() != self.activations.len() {
            return Err(NnError::BatchSizeMismatch { expected: self.activations.len(), actual: outer.len() }.into());
        }
        let (grads, mut suppliers) = outer.into_parts();
        let tasks: Vec<(Box<dyn Activation>, NeuronsActivation)> = self.activations.into_iter().zip(grads).collect();

        trace!("batch backward over {} branches", tasks.len());
        let branch_grads = self.pool.map_indexed(tasks, |_, (activation, grad)| {
            activation.back_propagate(Gradient::new(grad))
        })?;

        let mut outputs = Vec::with_capacity(branch_grads.len());
        for grad in branch_grads {
            let (output, branch_suppliers) = grad.into_parts();
            outputs.push(output);
            suppliers.extend(branch_suppliers);
        }
        Ok(BatchGradient::with_suppliers(outputs, suppliers))
    }

    pub fn decompose(&self) -> Vec<&dyn Activation> {
        self.activations.iter().flat_map(|a| a.decompose()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{ActivationFunctionComponent, FullyConnectedAxons};
    use crate::{AxonsConfig, EngineConfig};
    use ndarray::prelude::*;

    fn branch(i: usize) -> Arc<dyn Component> {
        let weights = Array2::from_shape_fn((3, 2), |(r, c)| (i + 1) as f32 * 0.1 * (r as f32 - c as f32 + 0.5));
        let fc: Arc<dyn Component> = Arc::new(FullyConnectedAxons::with_weights(Neurons::new(2, false), weights, None).unwrap());
        let act: Arc<dyn Component> = Arc::new(ActivationFunctionComponent::sigmoid(Neurons::new(3, false)));
        Arc::new(Chain::new(vec![fc, act]).unwrap())
    }

    fn inputs(n: usize) -> Vec<NeuronsActivation> {
        (0..n)
            .map(|i| NeuronsActivation::rows_span_features(Array2::from_shape_fn((2, 4), |(r, c)| (i + r * 4 + c) as f32 / 8.0)))
            .collect()
    }

    #[test]
    fn test_order_preservation() {
        let n = 7;
        let batch = Batch::new((0..n).map(branch).collect()).unwrap();
        let sequential = GraphContext::inference(EngineConfig::sequential());
        let expected: Vec<Array2<f32>> = inputs(n)
            .iter()
            .enumerate()
            .map(|(i, x)| batch.components()[i].forward(x, &sequential).unwrap().output().matrix().clone())
            .collect();

        for threads in [1, 2, 3, 16] {
            let ctx = GraphContext::inference(EngineConfig { worker_threads: threads, ..EngineConfig::sequential() });
            let activation = batch.forward(inputs(n), &ctx).unwrap();
            let outputs: Vec<Array2<f32>> = activation.outputs().iter().map(|o| o.matrix().clone()).collect();
            assert_eq!(outputs, expected);
            assert_eq!(activation.decompose().len(), 2 * n);
        }
    }

    #[test]
    fn test_backward_order_and_suppliers() {
        let n = 4;
        let batch = Batch::new((0..n).map(branch).collect()).unwrap();
        let ctx = GraphContext::training(EngineConfig { worker_threads: 4, ..Default::default() });
        let activation = batch.forward(inputs(n), &ctx).unwrap();
        let grads: Vec<NeuronsActivation> = (0..n)
            .map(|i| NeuronsActivation::rows_span_features(Array2::from_elem((3, 4), i as f32)))
            .collect();
        let out = activation.back_propagate(BatchGradient::new(grads)).unwrap();
        assert_eq!(out.len(), n);
        for (i, g) in out.outputs().iter().enumerate() {
            assert_eq!(g.shape(), (2, 4));
            // a zero outer gradient gives a zero input gradient
            assert_eq!(g.matrix().iter().all(|x| *x == 0.0), i == 0);
        }
        let ids: Vec<ComponentId> = batch.decompose().iter().filter(|c| c.as_trainable().is_some()).map(|c| c.id()).collect();
        let order: Vec<ComponentId> = out.suppliers().iter().map(|s| s.axons()).collect();
        assert_eq!(order, ids);
        assert_eq!(out.into_parts().1.into_iter().map(|s| s.resolve().unwrap()).count(), n);
    }

    #[test]
    fn test_size_mismatch_and_failure() {
        let batch = Batch::new(vec![branch(0), branch(1)]).unwrap();
        let ctx = GraphContext::inference(EngineConfig::default());
        let err = batch.forward(inputs(3), &ctx).err().unwrap();
        assert_eq!(err.downcast_ref::<NnError>(), Some(&NnError::BatchSizeMismatch { expected: 2, actual: 3 }));

        let mut bad = inputs(2);
        bad[1] = NeuronsActivation::rows_span_features(Array2::zeros((5, 4)));
        let err = batch.forward(bad, &ctx).err().unwrap();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::ShapeMismatch { .. })));

        assert!(matches!(Batch::new(vec![]).err().unwrap().downcast_ref::<NnError>(), Some(NnError::EmptyBatch)));
    }

    /// Records the thread each forward ran on, then defers to `inner`
    struct ThreadRecorder {
        inner: Arc<dyn Component>,
        threads: Arc<std::sync::Mutex<std::collections::HashSet<Option<String>>>>,
    }

    impl Component for ThreadRecorder {
        fn id(&self) -> ComponentId {
            self.inner.id()
        }

        fn name(&self) -> String {
            self.inner.name()
        }

        fn input_neurons(&self) -> Neurons {
            self.inner.input_neurons()
        }

        fn output_neurons(&self) -> Neurons {
            self.inner.output_neurons()
        }

        fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
            self.threads.lock().unwrap().insert(std::thread::current().name().map(str::to_string));
            self.inner.forward(input, ctx)
        }

        fn decompose(&self) -> Vec<&dyn Component> {
            self.inner.decompose()
        }
    }

    #[test]
    fn test_branches_run_on_shared_pool() {
        let threads = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
        let components = (0..6)
            .map(|i| Arc::new(ThreadRecorder { inner: branch(i), threads: threads.clone() }) as Arc<dyn Component>)
            .collect();
        let batch = Batch::new(components).unwrap();
        let ctx = GraphContext::inference(EngineConfig { worker_threads: 2, ..EngineConfig::sequential() });
        for _ in 0..3 {
            batch.forward(inputs(6), &ctx).unwrap();
        }
        let names = threads.lock().unwrap().clone();
        assert!(!names.is_empty() && names.len() <= 2);
        assert!(names.iter().all(|n| n.as_deref().map_or(false, |n| n.starts_with("graph-worker-"))));
    }

    #[test]
    fn test_context_hook_per_branch() {
        let batch = Batch::new(vec![branch(0), branch(1), branch(2)]).unwrap().with_context_hook(|outer, component, i| {
            // freeze every odd branch
            if i % 2 == 1 {
                for leaf in component.decompose() {
                    outer.axons_context(leaf.id(), AxonsConfig::default).with_freeze_out(true);
                }
            }
            outer.clone()
        });
        let ctx = GraphContext::training(EngineConfig::sequential());
        let activation = batch.forward(inputs(3), &ctx).unwrap();
        let grads = (0..3).map(|_| NeuronsActivation::rows_span_features(Array2::ones((3, 4)))).collect();
        let out = activation.back_propagate(BatchGradient::new(grads)).unwrap();
        assert_eq!(out.suppliers().len(), 2);
    }
}
