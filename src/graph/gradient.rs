use std::fmt;

use anyhow::{Context, Result};
use ndarray::prelude::*;

use super::{ComponentId, NeuronsActivation};
use crate::exec::{TaskHandle, WorkerPool};
use crate::NnError;

/// Trainable parameter gradient of one axons instance
#[derive(Clone, Debug, PartialEq)]
pub struct AxonsGradient {
    pub axons: ComponentId,
    pub weights: Option<Array2<f32>>,
    pub biases: Option<Array1<f32>>,
}

enum Deferred {
    Lazy(Box<dyn FnOnce() -> Result<AxonsGradient> + Send>),
    Pending(TaskHandle<AxonsGradient>),
}

/// A parameter gradient that has not necessarily been computed yet. Either a
/// closure run on `resolve`, or a task already running on the worker pool.
pub struct GradientSupplier {
    axons: ComponentId,
    deferred: Deferred,
}

impl GradientSupplier {
    pub fn lazy<F>(axons: ComponentId, f: F) -> Self
    where
        F: FnOnce() -> Result<AxonsGradient> + Send + 'static,
    {
        GradientSupplier { axons, deferred: Deferred::Lazy(Box::new(f)) }
    }

    pub fn spawn<F>(pool: &WorkerPool, axons: ComponentId, f: F) -> Self
    where
        F: FnOnce() -> Result<AxonsGradient> + Send + 'static,
    {
        GradientSupplier { axons, deferred: Deferred::Pending(pool.spawn(f)) }
    }

    pub fn axons(&self) -> ComponentId {
        self.axons
    }

    /// Blocks until the gradient is available. A failed computation surfaces
    /// here, wrapped in `NnError::GradientComputation`.
    pub fn resolve(self) -> Result<AxonsGradient> {
        let axons = self.axons;
        let result = match self.deferred {
            Deferred::Lazy(f) => f(),
            Deferred::Pending(handle) => handle.join(),
        };
        result.with_context(|| NnError::GradientComputation(axons))
    }
}

impl fmt::Debug for GradientSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.deferred {
            Deferred::Lazy(_) => "lazy",
            Deferred::Pending(_) => "pending",
        };
        write!(f, "GradientSupplier({}, {state})", self.axons)
    }
}

/// Gradient flowing backward out of one activation: the gradient w.r.t. its
/// input, plus every trainable supplier collected so far. Suppliers are only
/// ever appended.
#[derive(Debug)]
pub struct Gradient {
    output: NeuronsActivation,
    suppliers: Vec<GradientSupplier>,
}

impl Gradient {
    pub fn new(output: NeuronsActivation) -> Self {
        Gradient { output, suppliers: Vec::new() }
    }

    pub fn with_suppliers(output: NeuronsActivation, suppliers: Vec<GradientSupplier>) -> Self {
        Gradient { output, suppliers }
    }

    pub fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    pub fn suppliers(&self) -> &[GradientSupplier] {
        &self.suppliers
    }

    pub fn push(&mut self, supplier: GradientSupplier) {
        self.suppliers.push(supplier);
    }

    /// Replaces the output gradient, keeping the accumulated suppliers.
    pub fn map_output(self, output: NeuronsActivation) -> Self {
        Gradient { output, suppliers: self.suppliers }
    }

    pub fn into_parts(self) -> (NeuronsActivation, Vec<GradientSupplier>) {
        (self.output, self.suppliers)
    }

    pub fn resolve_all(self) -> Result<Vec<AxonsGradient>> {
        self.suppliers.into_iter().map(GradientSupplier::resolve).collect()
    }
}

/// List valued gradient of a batch, one output gradient per branch in branch order.
#[derive(Debug)]
pub struct BatchGradient {
    outputs: Vec<NeuronsActivation>,
    suppliers: Vec<GradientSupplier>,
}

impl BatchGradient {
    pub fn new(outputs: Vec<NeuronsActivation>) -> Self {
        BatchGradient { outputs, suppliers: Vec::new() }
    }

    pub fn with_suppliers(outputs: Vec<NeuronsActivation>, suppliers: Vec<GradientSupplier>) -> Self {
        BatchGradient { outputs, suppliers }
    }

    pub fn outputs(&self) -> &[NeuronsActivation] {
        &self.outputs
    }

    pub fn suppliers(&self) -> &[GradientSupplier] {
        &self.suppliers
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn into_parts(self) -> (Vec<NeuronsActivation>, Vec<GradientSupplier>) {
        (self.outputs, self.suppliers)
    }
}

#[test]
fn test_supplier_resolve() {
    let id = ComponentId::next();
    let grad = AxonsGradient { axons: id, weights: Some(Array2::ones((2, 2))), biases: None };
    let expected = grad.clone();
    let supplier = GradientSupplier::lazy(id, move || Ok(grad));
    assert_eq!(supplier.axons(), id);
    assert_eq!(supplier.resolve().unwrap(), expected);

    let pool = WorkerPool::new(1);
    let supplier = GradientSupplier::spawn(&pool, id, move || Err(anyhow::Error::msg("nan in weights")));
    let err = supplier.resolve().unwrap_err();
    assert_eq!(err.downcast_ref::<NnError>(), Some(&NnError::GradientComputation(id)));
    assert_eq!(err.root_cause().to_string(), "nan in weights");
}

#[test]
fn test_suppliers_append_in_order() {
    let out = NeuronsActivation::rows_span_features(Array2::zeros((1, 1)));
    let ids: Vec<ComponentId> = (0..3).map(|_| ComponentId::next()).collect();
    let mut grad = Gradient::new(out.clone());
    for id in &ids {
        let id = *id;
        grad.push(GradientSupplier::lazy(id, move || Ok(AxonsGradient { axons: id, weights: None, biases: None })));
    }
    let grad = grad.map_output(out);
    let order: Vec<ComponentId> = grad.suppliers().iter().map(|s| s.axons()).collect();
    assert_eq!(order, ids);
    assert_eq!(grad.resolve_all().unwrap().len(), 3);
}
