use std::sync::{Arc, RwLock};

use anyhow::Result;
use log::{debug, trace};
use ndarray::prelude::*;

use super::utils::{dropout_mask, he_normal};
use super::{AxonWeights, TrainableAxons};
use crate::graph::{
    validate_input, Activation, AxonsContext, AxonsGradient, Component, ComponentId, Gradient, GradientSupplier,
    GraphContext, Neurons, NeuronsActivation,
};
use crate::NnError;

type Params = RwLock<Option<Arc<AxonWeights>>>;

fn read(params: &Params) -> Option<Arc<AxonWeights>> {
    params.read().unwrap_or_else(|p| p.into_inner()).clone()
}

fn check_len(component: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(NnError::ShapeMismatch { component: component.to_string(), expected, actual }.into());
    }
    Ok(())
}

/// `weights += scale * delta` on a copy, activations holding the old
/// snapshot keep seeing the weights they were computed with.
fn adjust_params(name: &str, params: &Params, id: ComponentId, delta: &AxonsGradient, scale: f32) -> Result<()> {
    let mut slot = params.write().unwrap_or_else(|p| p.into_inner());
    let current = slot.as_mut().ok_or(NnError::UninitialisedWeights(id))?;
    let updated = Arc::make_mut(current);
    if let Some(dw) = &delta.weights {
        check_len(name, updated.weights.len(), dw.len())?;
        check_len(name, updated.weights.nrows(), dw.nrows())?;
        updated.weights.scaled_add(scale, dw);
    }
    if let (Some(b), Some(db)) = (updated.biases.as_mut(), &delta.biases) {
        check_len(name, b.len(), db.len())?;
        b.scaled_add(scale, db);
    }
    Ok(())
}

/// Hands a parameter gradient computation to the worker pool, or defers it
/// until resolve when the engine is configured to run sequentially.
fn supplier<F>(ctx: &GraphContext, id: ComponentId, f: F) -> GradientSupplier
where
    F: FnOnce() -> Result<AxonsGradient> + Send + 'static,
{
    if ctx.config().async_parameter_gradients {
        GradientSupplier::spawn(ctx.pool(), id, f)
    } else {
        GradientSupplier::lazy(id, f)
    }
}

/// Dense weights between two layers of neurons, `y = W x + b`
pub struct FullyConnectedAxons {
    id: ComponentId,
    left: Neurons,
    right: Neurons,
    params: Params,
}

impl FullyConnectedAxons {
    /// Builds the axons from a `[right, left]` weight matrix. Biases are
    /// zero filled when the left neurons carry a bias unit and none are given.
    pub fn with_weights(left: Neurons, weights: Array2<f32>, biases: Option<Array1<f32>>) -> Result<Self> {
        let right = Neurons::new(weights.nrows(), false);
        let axons = Self::uninitialised(left, right);
        axons.initialise(weights, biases)?;
        Ok(axons)
    }

    /// Weights must be set with `initialise` before the first forward.
    pub fn uninitialised(left: Neurons, right: Neurons) -> Self {
        let id = ComponentId::next();
        debug!("fully connected axons {id}: {} -> {}", left.features(), right.features());
        FullyConnectedAxons { id, left, right, params: RwLock::new(None) }
    }

    /// He normal weights, zero biases
    pub fn random(left: Neurons, right: Neurons) -> Result<Self> {
        let axons = Self::uninitialised(left, right);
        let biases = left.has_bias_unit().then(|| Array1::zeros(right.features()));
        axons.initialise(he_normal(right.features(), left.features())?, biases)?;
        Ok(axons)
    }

    fn snapshot(&self) -> Result<Arc<AxonWeights>> {
        read(&self.params).ok_or_else(|| NnError::UninitialisedWeights(self.id).into())
    }
}

impl Component for FullyConnectedAxons {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("fully connected axons {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.left
    }

    fn output_neurons(&self) -> Neurons {
        self.right
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        validate_input(&self.name(), &self.left, input)?;
        let params = self.snapshot()?;
        let axons = ctx.axons_context(self.id, || ctx.config().default_axons.clone());

        let keep = axons.input_dropout_keep_probability();
        let mask = (axons.is_training() && keep < 1.0).then(|| dropout_mask(input.shape(), keep, &mut rand::thread_rng()));
        let x = match &mask {
            Some(mask) => input.with_matrix(input.matrix() * mask),
            None => input.clone(),
        };

        let mut y = params.weights.dot(x.matrix());
        if let Some(b) = &params.biases {
            y += &b.view().insert_axis(Axis(1));
        }
        trace!("{} forward {:?} -> {:?}", self.id, x.shape(), y.dim());
        Ok(Box::new(FullyConnectedActivation {
            id: self.id,
            output: NeuronsActivation::rows_span_features(y),
            input: x,
            mask,
            params,
            axons,
            ctx: ctx.clone(),
        }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        vec![self]
    }

    fn as_trainable(&self) -> Option<&dyn TrainableAxons> {
        Some(self)
    }
}

impl TrainableAxons for FullyConnectedAxons {
    fn axons_id(&self) -> ComponentId {
        self.id
    }

    fn is_initialised(&self) -> bool {
        read(&self.params).is_some()
    }

    fn initialise(&self, weights: Array2<f32>, biases: Option<Array1<f32>>) -> Result<()> {
        let name = self.name();
        check_len(&name, self.left.features(), weights.ncols())?;
        check_len(&name, self.right.features(), weights.nrows())?;
        let biases = match (self.left.has_bias_unit(), biases) {
            (true, Some(b)) => {
                check_len(&name, weights.nrows(), b.len())?;
                Some(b)
            }
            (true, None) => Some(Array1::zeros(weights.nrows())),
            (false, None) => None,
            (false, Some(_)) => {
                return Err(NnError::Unsupported(format!("{name} has no bias unit, biases were given")).into())
            }
        };
        *self.params.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(AxonWeights { weights, biases }));
        Ok(())
    }

    fn detached_weights(&self) -> Result<AxonWeights> {
        Ok(self.snapshot()?.as_ref().clone())
    }

    fn adjust(&self, delta: &AxonsGradient, scale: f32) -> Result<()> {
        adjust_params(&self.name(), &self.params, self.id, delta, scale)
    }
}

pub struct FullyConnectedActivation {
    id: ComponentId,
    output: NeuronsActivation,
    /// post dropout input
    input: NeuronsActivation,
    mask: Option<Array2<f32>>,
    params: Arc<AxonWeights>,
    axons: AxonsContext,
    ctx: GraphContext,
}

impl Activation for FullyConnectedActivation {
    fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let FullyConnectedActivation { id, output, input, mask, params, axons, ctx } = *self;
        let (g, suppliers) = outer.into_parts();
        check_len("fully connected backward", output.features(), g.features())?;
        check_len("fully connected backward", output.examples(), g.examples())?;

        let mut dx = params.weights.t().dot(g.matrix());
        if let Some(mask) = &mask {
            dx *= mask;
        }
        let mut grad = Gradient::with_suppliers(input.with_matrix(dx), suppliers);

        if axons.is_with_freeze_out() {
            trace!("{id} frozen, no gradient supplier");
            return Ok(grad);
        }
        let lambda = axons.regularisation_lambda();
        grad.push(supplier(&ctx, id, move || {
            let mut weights = g.matrix().dot(&input.matrix().t());
            if lambda != 0.0 {
                weights.scaled_add(lambda, &params.weights);
            }
            let biases = params.biases.as_ref().map(|_| g.matrix().sum_axis(Axis(1)));
            Ok(AxonsGradient { axons: id, weights: Some(weights), biases })
        }));
        Ok(grad)
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        vec![self]
    }

    fn regularisation_cost(&self) -> f32 {
        let lambda = self.axons.regularisation_lambda();
        if lambda == 0.0 {
            return 0.0;
        }
        0.5 * lambda * self.params.weights.iter().map(|w| w * w).sum::<f32>()
    }
}

/// Identity axons, the skip branch of a residual block
pub struct PassThroughAxons {
    id: ComponentId,
    left: Neurons,
    right: Neurons,
}

impl PassThroughAxons {
    pub fn new(left: Neurons, right: Neurons) -> Self {
        PassThroughAxons { id: ComponentId::next(), left, right }
    }
}

impl Component for PassThroughAxons {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("pass through axons {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.left
    }

    fn output_neurons(&self) -> Neurons {
        self.right
    }

    fn forward(&self, input: &NeuronsActivation, _ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        validate_input(&self.name(), &self.left, input)?;
        validate_input(&self.name(), &self.right, input)?;
        Ok(Box::new(PassThroughActivation { output: input.clone() }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        vec![self]
    }
}

pub struct PassThroughActivation {
    output: NeuronsActivation,
}

impl Activation for PassThroughActivation {
    fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        check_len("pass through backward", self.output.features(), outer.output().features())?;
        check_len("pass through backward", self.output.examples(), outer.output().examples())?;
        Ok(outer)
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        vec![self]
    }
}

/// Per feature `y = gamma * x + beta`. Gamma is kept as a `[features, 1]`
/// weight column and beta as the biases.
pub struct ScaleAndShiftAxons {
    id: ComponentId,
    neurons: Neurons,
    params: Params,
}

impl ScaleAndShiftAxons {
    /// gamma = 1, beta = 0
    pub fn new(neurons: Neurons) -> Self {
        Self::with_id(ComponentId::next(), neurons)
    }

    /// shares `id`, and with it the axons context, with an owning component
    pub(crate) fn with_id(id: ComponentId, neurons: Neurons) -> Self {
        let f = neurons.features();
        let params = AxonWeights { weights: Array2::ones((f, 1)), biases: Some(Array1::zeros(f)) };
        ScaleAndShiftAxons { id, neurons, params: RwLock::new(Some(Arc::new(params))) }
    }

    fn snapshot(&self) -> Result<Arc<AxonWeights>> {
        read(&self.params).ok_or_else(|| NnError::UninitialisedWeights(self.id).into())
    }
}

impl Component for ScaleAndShiftAxons {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("scale and shift axons {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.neurons
    }

    fn output_neurons(&self) -> Neurons {
        self.neurons
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        validate_input(&self.name(), &self.neurons, input)?;
        let params = self.snapshot()?;
        let axons = ctx.axons_context(self.id, || ctx.config().default_axons.clone());
        let mut y = input.matrix() * &params.weights;
        if let Some(beta) = &params.biases {
            y += &beta.view().insert_axis(Axis(1));
        }
        Ok(Box::new(ScaleAndShiftActivation {
            id: self.id,
            output: input.with_matrix(y),
            input: input.clone(),
            params,
            axons,
            ctx: ctx.clone(),
        }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        vec![self]
    }

    fn as_trainable(&self) -> Option<&dyn TrainableAxons> {
        Some(self)
    }
}

impl TrainableAxons for ScaleAndShiftAxons {
    fn axons_id(&self) -> ComponentId {
        self.id
    }

    fn is_initialised(&self) -> bool {
        true
    }

    fn initialise(&self, weights: Array2<f32>, biases: Option<Array1<f32>>) -> Result<()> {
        let name = self.name();
        let f = self.neurons.features();
        check_len(&name, f, weights.nrows())?;
        check_len(&name, 1, weights.ncols())?;
        let biases = biases.unwrap_or_else(|| Array1::zeros(f));
        check_len(&name, f, biases.len())?;
        *self.params.write().unwrap_or_else(|p| p.into_inner()) =
            Some(Arc::new(AxonWeights { weights, biases: Some(biases) }));
        Ok(())
    }

    fn detached_weights(&self) -> Result<AxonWeights> {
        Ok(self.snapshot()?.as_ref().clone())
    }

    fn adjust(&self, delta: &AxonsGradient, scale: f32) -> Result<()> {
        adjust_params(&self.name(), &self.params, self.id, delta, scale)
    }
}

pub struct ScaleAndShiftActivation {
    id: ComponentId,
    output: NeuronsActivation,
    input: NeuronsActivation,
    params: Arc<AxonWeights>,
    axons: AxonsContext,
    ctx: GraphContext,
}

impl Activation for ScaleAndShiftActivation {
    fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let ScaleAndShiftActivation { id, output, input, params, axons, ctx } = *self;
        let (g, suppliers) = outer.into_parts();
        check_len("scale and shift backward", output.features(), g.features())?;
        check_len("scale and shift backward", output.examples(), g.examples())?;

        let dx = g.matrix() * &params.weights;
        let mut grad = Gradient::with_suppliers(input.with_matrix(dx), suppliers);
        if axons.is_with_freeze_out() {
            return Ok(grad);
        }
        let lambda = axons.regularisation_lambda();
        grad.push(supplier(&ctx, id, move || {
            let mut gamma = (g.matrix() * input.matrix()).sum_axis(Axis(1)).insert_axis(Axis(1));
            let mut beta = g.matrix().sum_axis(Axis(1));
            if lambda != 0.0 {
                gamma.scaled_add(lambda, &params.weights);
                if let Some(b) = &params.biases {
                    beta.scaled_add(lambda, b);
                }
            }
            Ok(AxonsGradient { axons: id, weights: Some(gamma), biases: Some(beta) })
        }));
        Ok(grad)
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        vec![self]
    }

    fn regularisation_cost(&self) -> f32 {
        let lambda = self.axons.regularisation_lambda();
        if lambda == 0.0 {
            return 0.0;
        }
        let beta: f32 = self.params.biases.iter().flat_map(|b| b.iter()).map(|b| b * b).sum();
        0.5 * lambda * (self.params.weights.iter().map(|g| g * g).sum::<f32>() + beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::total_regularisation_cost;
    use crate::nn::utils::isclose;
    use crate::{AxonsConfig, EngineConfig};

    fn rows(data: Array2<f32>) -> NeuronsActivation {
        NeuronsActivation::rows_span_features(data)
    }

    #[test]
    fn test_fully_connected_forward_backward() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let w = array![[1.0, 2.0], [0.0, -1.0], [3.0, 1.0]];
        let b = array![0.5, 0.0, -0.5];
        let fc = FullyConnectedAxons::with_weights(Neurons::new(2, true), w.clone(), Some(b.clone())).unwrap();
        let x = array![[1.0, 0.0], [2.0, 1.0]];
        let y = fc.forward(&rows(x.clone()), &ctx).unwrap();
        assert_eq!(y.output().matrix(), &(w.dot(&x) + &b.view().insert_axis(Axis(1))));

        let g = array![[1.0, 1.0], [0.0, 2.0], [1.0, 0.0]];
        let dx = y.back_propagate(Gradient::new(rows(g.clone()))).unwrap();
        assert_eq!(dx.output().matrix(), &w.t().dot(&g));
        let resolved = dx.resolve_all().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].weights.as_ref().unwrap(), &g.dot(&x.t()));
        assert_eq!(resolved[0].biases.as_ref().unwrap(), &array![2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_fully_connected_contract() {
        let ctx = GraphContext::inference(EngineConfig::sequential());
        let fc = FullyConnectedAxons::random(Neurons::new(3, false), Neurons::new(2, false)).unwrap();
        assert!(fc.is_initialised());
        let err = fc.forward(&rows(Array2::zeros((4, 1))), &ctx).err().unwrap();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::ShapeMismatch { expected: 3, actual: 4, .. })));

        let err = FullyConnectedAxons::with_weights(Neurons::new(3, false), Array2::zeros((2, 3)), Some(Array1::zeros(2)))
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::Unsupported(_))));

        let fc = FullyConnectedAxons::with_weights(Neurons::new(3, true), Array2::zeros((2, 3)), None).unwrap();
        assert_eq!(fc.detached_weights().unwrap().biases, Some(Array1::zeros(2)));
    }

    #[test]
    fn test_regularisation() {
        let config = EngineConfig {
            default_axons: AxonsConfig::default().with_regularisation_lambda(0.1),
            ..EngineConfig::sequential()
        };
        let ctx = GraphContext::training(config);
        let w = array![[1.0, 2.0]];
        let fc = FullyConnectedAxons::with_weights(Neurons::new(2, false), w.clone(), None).unwrap();
        let x = array![[1.0], [1.0]];
        let y = fc.forward(&rows(x.clone()), &ctx).unwrap();
        assert!((total_regularisation_cost(y.as_ref()) - 0.25).abs() < 1e-6);

        let dx = y.back_propagate(Gradient::new(rows(array![[1.0]]))).unwrap();
        let resolved = dx.resolve_all().unwrap();
        assert!(isclose(resolved[0].weights.as_ref().unwrap(), &array![[1.1, 1.2]]));
        assert_eq!(resolved[0].biases, None);
    }

    #[test]
    fn test_dropout_only_in_training() {
        let config = EngineConfig {
            default_axons: AxonsConfig::default().with_input_dropout_keep_probability(0.5),
            ..EngineConfig::sequential()
        };
        let fc = FullyConnectedAxons::with_weights(Neurons::new(64, false), Array2::ones((1, 64)), None).unwrap();
        let x = rows(Array2::ones((64, 8)));

        let inference = GraphContext::inference(config.clone());
        let y = fc.forward(&x, &inference).unwrap();
        assert!(y.output().matrix().iter().all(|v| *v == 64.0));

        let training = GraphContext::training(config);
        let y = fc.forward(&x, &training).unwrap();
        // every kept input is scaled by 2, the sum is always even
        assert!(y.output().matrix().iter().all(|v| *v % 2.0 == 0.0));
        assert!(y.output().matrix().iter().any(|v| *v != 64.0));
        let dx = y.back_propagate(Gradient::new(rows(Array2::ones((1, 8))))).unwrap();
        assert!(dx.output().matrix().iter().all(|v| *v == 0.0 || *v == 2.0));
    }

    #[test]
    fn test_freeze_out_skips_supplier() {
        let ctx = GraphContext::training(EngineConfig::default());
        let fc = FullyConnectedAxons::with_weights(Neurons::new(2, false), Array2::eye(2), None).unwrap();
        ctx.axons_context(fc.id(), AxonsConfig::default).with_freeze_out(true);
        let y = fc.forward(&rows(Array2::ones((2, 3))), &ctx).unwrap();
        let dx = y.back_propagate(Gradient::new(rows(Array2::ones((2, 3))))).unwrap();
        assert!(dx.suppliers().is_empty());
        assert_eq!(dx.output().shape(), (2, 3));

        let _thawed = ctx.override_freeze_out(false);
        let y = fc.forward(&rows(Array2::ones((2, 3))), &ctx).unwrap();
        let dx = y.back_propagate(Gradient::new(rows(Array2::ones((2, 3))))).unwrap();
        assert_eq!(dx.suppliers().len(), 1);
    }

    #[test]
    fn test_adjust_keeps_old_snapshot() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let fc = FullyConnectedAxons::with_weights(Neurons::new(2, false), array![[1.0, 1.0]], None).unwrap();
        let x = array![[1.0], [2.0]];
        let y = fc.forward(&rows(x.clone()), &ctx).unwrap();
        let grads = y.back_propagate(Gradient::new(rows(array![[1.0]]))).unwrap().resolve_all().unwrap();
        fc.adjust(&grads[0], -0.5).unwrap();
        assert_eq!(fc.detached_weights().unwrap().weights, array![[0.5, 0.0]]);

        let wrong = AxonsGradient { axons: fc.id(), weights: Some(Array2::zeros((2, 2))), biases: None };
        assert!(fc.adjust(&wrong, 1.0).is_err());

        let uninitialised = FullyConnectedAxons::uninitialised(Neurons::new(2, false), Neurons::new(1, false));
        assert!(uninitialised.detached_weights().is_err());
        assert!(uninitialised.adjust(&grads[0], 1.0).is_err());
    }

    #[test]
    fn test_pass_through() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let n = Neurons::new(3, false);
        let id = PassThroughAxons::new(n, n);
        let x = rows(array![[1.0], [2.0], [3.0]]);
        let y = id.forward(&x, &ctx).unwrap();
        assert!(std::ptr::eq(y.output().matrix(), x.matrix()));
        let g = y.back_propagate(Gradient::new(rows(array![[4.0], [5.0], [6.0]]))).unwrap();
        assert_eq!(g.output().matrix(), &array![[4.0], [5.0], [6.0]]);
        assert!(g.suppliers().is_empty());
        assert!(id.as_trainable().is_none());

        let widening = PassThroughAxons::new(n, Neurons::new(4, false));
        assert!(widening.forward(&x, &ctx).is_err());

        for bad in [Array2::ones((2, 1)), Array2::ones((3, 2))] {
            let y = id.forward(&x, &ctx).unwrap();
            let err = y.back_propagate(Gradient::new(rows(bad))).unwrap_err();
            assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::ShapeMismatch { .. })));
        }
    }

    #[test]
    fn test_scale_and_shift() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let n = Neurons::new(2, false);
        let axons = ScaleAndShiftAxons::new(n);
        axons.initialise(array![[2.0], [-1.0]], Some(array![0.5, 1.0])).unwrap();
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let y = axons.forward(&rows(x.clone()), &ctx).unwrap();
        assert_eq!(y.output().matrix(), &array![[2.5, 4.5], [-2.0, -3.0]]);

        let g = array![[1.0, 1.0], [1.0, 0.0]];
        let dx = y.back_propagate(Gradient::new(rows(g))).unwrap();
        assert_eq!(dx.output().matrix(), &array![[2.0, 2.0], [-1.0, 0.0]]);
        let resolved = dx.resolve_all().unwrap();
        assert_eq!(resolved[0].weights.as_ref().unwrap(), &array![[3.0], [3.0]]);
        assert_eq!(resolved[0].biases.as_ref().unwrap(), &array![2.0, 1.0]);

        assert!(axons.initialise(Array2::ones((2, 2)), None).is_err());

        let y = axons.forward(&rows(x), &ctx).unwrap();
        let err = y.back_propagate(Gradient::new(rows(Array2::ones((2, 3))))).unwrap_err();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::ShapeMismatch { expected: 2, actual: 3, .. })));
    }
}
