use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, trace};
use ndarray::{prelude::*, Zip};
use num::{Float, FromPrimitive};

use super::{ScaleAndShiftAxons, TrainableAxons};
use crate::graph::{validate_examples, validate_input, Activation, Component, ComponentId, Gradient, GraphContext, Neurons, NeuronsActivation};
use crate::NnError;

/// Terms of the forward normalisation the backward pass needs
#[derive(Clone, Debug)]
pub struct NormCache<A> {
    centered: Array2<A>,
    inv_sd: Array1<A>,
    /// mean and variance were taken from this batch, not from running statistics
    batch: bool,
}

fn normalise<A: Float>(x: &Array2<A>, mean: &Array1<A>, var: &Array1<A>, eps: A, batch: bool) -> (Array2<A>, NormCache<A>) {
    let centered = x - &mean.view().insert_axis(Axis(1));
    let inv_sd = var.mapv(|v| A::one() / (v + eps).sqrt());
    let y = &centered * &inv_sd.view().insert_axis(Axis(1));
    (y, NormCache { centered, inv_sd, batch })
}

/// Normalises every feature row over the examples with the batch mean and
/// population variance. Returns the output, the cache, the mean and the variance.
pub fn batch_norm_forward<A: Float + FromPrimitive>(x: &Array2<A>, eps: A) -> (Array2<A>, NormCache<A>, Array1<A>, Array1<A>) {
    let mean = x.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()));
    let var = x.var_axis(Axis(1), A::zero());
    let (y, cache) = normalise(x, &mean, &var, eps, true);
    (y, cache, mean, var)
}

/// Normalises with fixed statistics, the output does not depend on the batch
pub fn running_norm_forward<A: Float>(x: &Array2<A>, mean: &Array1<A>, var: &Array1<A>, eps: A) -> (Array2<A>, NormCache<A>) {
    normalise(x, mean, var, eps, false)
}

pub fn batch_norm_backward<A: Float + FromPrimitive>(cache: &NormCache<A>, grad: &Array2<A>) -> Array2<A> {
    let inv_sd = cache.inv_sd.view().insert_axis(Axis(1));
    if !cache.batch {
        return grad * &inv_sd;
    }
    let n = A::from_usize(grad.ncols()).unwrap_or_else(A::one);
    let dot = (&cache.centered * grad).sum_axis(Axis(1)).insert_axis(Axis(1));

    let mut dx = Array2::zeros(grad.raw_dim());
    Zip::from(&mut dx)
        .and(&cache.centered)
        .and(grad)
        .and_broadcast(&inv_sd)
        .and_broadcast(&dot)
        .for_each(|dx, c, g, inv_sd, dot| {
            *dx = -*c / n * inv_sd.powi(3) * *dot + *g * *inv_sd;
        });

    let mean = dx.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(dx.nrows()));
    dx.zip_mut_with(&mean.insert_axis(Axis(1)), |d, m| *d = *d - *m);
    dx
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunningStatistics {
    pub mean: Array1<f32>,
    pub variance: Array1<f32>,
}

type SharedStatistics = Arc<Mutex<Option<RunningStatistics>>>;

/// Batch normalisation followed by a trainable scale and shift. Flat
/// neurons only.
pub struct BatchNorm {
    id: ComponentId,
    neurons: Neurons,
    scale_shift: ScaleAndShiftAxons,
    running: SharedStatistics,
}

impl BatchNorm {
    pub fn new(neurons: Neurons) -> Result<Self> {
        if neurons.is_spatial() {
            return Err(NnError::Unsupported(format!("batch norm over spatial neurons {neurons:?}")).into());
        }
        let id = ComponentId::next();
        debug!("batch norm {id} over {} features", neurons.features());
        Ok(BatchNorm { id, neurons, scale_shift: ScaleAndShiftAxons::with_id(id, neurons), running: Default::default() })
    }

    pub fn running_statistics(&self) -> Option<RunningStatistics> {
        self.running.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Component for BatchNorm {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("batch norm {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.neurons
    }

    fn output_neurons(&self) -> Neurons {
        self.neurons
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        validate_input(&self.name(), &self.neurons, input)?;
        let eps = ctx.config().batch_norm_epsilon;
        let running = self.running_statistics();

        let use_running = input.examples() == 1 || (!ctx.is_training() && running.is_some());
        let (normalised, cache, batch_statistics) = if use_running {
            let stats = running.ok_or(NnError::MissingRunningStatistics(self.id))?;
            trace!("{} normalising with running statistics", self.id);
            let (y, cache) = running_norm_forward(input.matrix(), &stats.mean, &stats.variance, eps);
            (y, cache, None)
        } else {
            let (y, cache, mean, variance) = batch_norm_forward(input.matrix(), eps);
            (y, cache, Some(RunningStatistics { mean, variance }))
        };

        let inner = self.scale_shift.forward(&input.with_matrix(normalised), ctx)?;
        Ok(Box::new(BatchNormActivation {
            id: self.id,
            inner,
            cache,
            batch_statistics,
            decay: ctx.config().batch_norm_decay,
            running: self.running.clone(),
        }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        vec![self]
    }

    fn as_trainable(&self) -> Option<&dyn TrainableAxons> {
        Some(&self.scale_shift)
    }
}

pub struct BatchNormActivation {
    id: ComponentId,
    inner: Box<dyn Activation>,
    cache: NormCache<f32>,
    batch_statistics: Option<RunningStatistics>,
    decay: f32,
    running: SharedStatistics,
}

impl Activation for BatchNormActivation {
    fn output(&self) -> &NeuronsActivation {
        self.inner.output()
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let BatchNormActivation { id, inner, cache, batch_statistics, decay, running } = *self;
        validate_examples("batch norm backward", cache.centered.ncols(), outer.output())?;
        let (g, suppliers) = inner.back_propagate(outer)?.into_parts();
        let dx = batch_norm_backward(&cache, g.matrix());

        if let Some(batch) = batch_statistics {
            let mut running = running.lock().unwrap_or_else(|p| p.into_inner());
            match running.as_mut() {
                None => {
                    trace!("{id} initialising running statistics");
                    *running = Some(batch);
                }
                Some(stats) => {
                    stats.mean.zip_mut_with(&batch.mean, |old, new| *old = *old * decay + *new * (1.0 - decay));
                    stats.variance.zip_mut_with(&batch.variance, |old, new| *old = *old * decay + *new * (1.0 - decay));
                }
            }
        }
        Ok(Gradient::with_suppliers(g.with_matrix(dx), suppliers))
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        vec![self]
    }

    fn regularisation_cost(&self) -> f32 {
        self.inner.regularisation_cost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::utils::{grad_check, isclose};
    use crate::EngineConfig;
    use ndarray_rand::{rand_distr::Normal, RandomExt};

    #[test]
    fn test_dnorm() {
        let shape = (3, 5);
        let x = Array1::random(shape.0 * shape.1, Normal::new(0.0, 1.0).unwrap());
        let (_, cache, _, _) = batch_norm_forward(&x.clone().into_shape(shape).unwrap(), 1e-5);
        let f = |x: &Array1<f64>| {
            let (y, _, _, _) = batch_norm_forward(&x.clone().into_shape(shape).unwrap(), 1e-5);
            y.into_shape(shape.0 * shape.1).unwrap()
        };
        let df = |grad: &Array1<f64>| {
            batch_norm_backward(&cache, &grad.clone().into_shape(shape).unwrap()).into_shape(shape.0 * shape.1).unwrap()
        };
        grad_check(x, f, df, None, None, None).unwrap();
    }

    #[test]
    fn test_running_norm_gradient() {
        let shape = (2, 3);
        let (mean, var) = (array![0.5, -1.0], array![2.0, 0.25]);
        let x = Array1::random(shape.0 * shape.1, Normal::new(0.0, 1.0).unwrap());
        let (_, cache) = running_norm_forward(&x.clone().into_shape(shape).unwrap(), &mean, &var, 1e-5);
        let f = |x: &Array1<f64>| {
            running_norm_forward(&x.clone().into_shape(shape).unwrap(), &mean, &var, 1e-5).0.into_shape(6).unwrap()
        };
        let df = |g: &Array1<f64>| batch_norm_backward(&cache, &g.clone().into_shape(shape).unwrap()).into_shape(6).unwrap();
        grad_check(x, f, df, None, None, None).unwrap();
    }

    #[test]
    fn test_batch_norm_component() {
        let ctx = GraphContext::training(EngineConfig { batch_norm_decay: 0.5, ..EngineConfig::sequential() });
        let bn = BatchNorm::new(Neurons::new(2, false)).unwrap();
        assert_eq!(bn.as_trainable().map(|t| t.axons_id()), Some(bn.id()));

        let x = NeuronsActivation::rows_span_features(array![[1.0, 3.0], [0.0, 4.0]]);
        let y = bn.forward(&x, &ctx).unwrap();
        assert!(isclose(y.output().matrix(), &array![[-1.0, 1.0], [-1.0, 1.0]]));

        // statistics only move once a backward has run
        assert_eq!(bn.running_statistics(), None);
        let dx = y.back_propagate(Gradient::new(x.with_matrix(array![[1.0, 0.0], [0.0, 1.0]]))).unwrap();
        assert_eq!(dx.output().shape(), (2, 2));
        assert_eq!(dx.suppliers().len(), 1);
        let stats = bn.running_statistics().unwrap();
        assert_eq!(stats.mean, array![2.0, 2.0]);
        assert_eq!(stats.variance, array![1.0, 4.0]);

        let x2 = NeuronsActivation::rows_span_features(array![[2.0, 2.0], [4.0, 4.0]]);
        let y = bn.forward(&x2, &ctx).unwrap();
        y.back_propagate(Gradient::new(x2.with_matrix(Array2::zeros((2, 2))))).unwrap();
        let stats = bn.running_statistics().unwrap();
        assert_eq!(stats.mean, array![2.0, 3.0]);
        assert_eq!(stats.variance, array![0.5, 2.0]);
    }

    #[test]
    fn test_single_example_and_inference() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let bn = BatchNorm::new(Neurons::new(2, false)).unwrap();
        let single = NeuronsActivation::rows_span_features(array![[1.0], [2.0]]);
        let err = bn.forward(&single, &ctx).err().unwrap();
        assert_eq!(err.downcast_ref::<NnError>(), Some(&NnError::MissingRunningStatistics(bn.id())));

        let x = NeuronsActivation::rows_span_features(array![[1.0, 3.0], [0.0, 4.0]]);
        // inference without statistics falls back to the batch
        let inference = ctx.with_training(false);
        let y = bn.forward(&x, &inference).unwrap();
        y.back_propagate(Gradient::new(x.with_matrix(Array2::zeros((2, 2))))).unwrap();

        // running statistics are now mean [2, 2], variance [1, 4]
        let (a, b) = (1.0 / (1.0f32 + 1e-5).sqrt(), 2.0 / (4.0f32 + 1e-5).sqrt());
        let y = bn.forward(&single, &ctx).unwrap();
        assert!(isclose(y.output().matrix(), &array![[-a], [0.0]]));
        let y = bn.forward(&x, &inference).unwrap();
        assert!(isclose(y.output().matrix(), &array![[-a, a], [-b, b]]));
        // no batch statistics were used, nothing moves
        y.back_propagate(Gradient::new(x.with_matrix(Array2::ones((2, 2))))).unwrap();
        assert_eq!(bn.running_statistics().unwrap().mean, array![2.0, 2.0]);
    }

    #[test]
    fn test_backward_example_mismatch() {
        let ctx = GraphContext::training(EngineConfig::sequential());
        let bn = BatchNorm::new(Neurons::new(2, false)).unwrap();
        let x = NeuronsActivation::rows_span_features(array![[1.0, 3.0], [0.0, 4.0]]);
        let y = bn.forward(&x, &ctx).unwrap();
        let err = y.back_propagate(Gradient::new(x.with_matrix(Array2::ones((2, 3))))).unwrap_err();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::ShapeMismatch { expected: 2, actual: 3, .. })));
        // a rejected gradient never reaches the running statistics
        assert_eq!(bn.running_statistics(), None);
    }

    #[test]
    fn test_spatial_unsupported() {
        let err = BatchNorm::new(Neurons::spatial(2, 2, 3, false)).err().unwrap();
        assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::Unsupported(_))));
    }
}
