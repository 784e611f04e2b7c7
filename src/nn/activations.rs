use anyhow::Result;
use ndarray::prelude::*;
use num::Float;
use serde::{Deserialize, Serialize};

use crate::graph::{validate_input, Activation, Component, ComponentId, Gradient, GraphContext, Neurons, NeuronsActivation};
use crate::NnError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationFunctionType {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    /// normalised over the features of each example, i.e. per column
    Softmax,
}

impl ActivationFunctionType {
    pub fn activate<A: Float>(&self, x: &Array2<A>) -> Array2<A> {
        match self {
            Self::Linear => x.clone(),
            Self::Relu => x.mapv(|v| v.max(A::zero())),
            Self::Sigmoid => x.mapv(|v| A::one() / (A::one() + (-v).exp())),
            Self::Tanh => x.mapv(|v| v.tanh()),
            Self::Softmax => {
                let mut y = x.clone();
                for mut col in y.columns_mut() {
                    let max = col.fold(A::neg_infinity(), |m, v| m.max(*v));
                    col.mapv_inplace(|v| (v - max).exp());
                    let sum = col.fold(A::zero(), |s, v| s + *v);
                    col.mapv_inplace(|v| v / sum);
                }
                y
            }
        }
    }

    /// Gradient w.r.t. the input, written in terms of the forward `output`.
    pub fn gradient<A: Float>(&self, output: &Array2<A>, grad: &Array2<A>) -> Array2<A> {
        match self {
            Self::Linear => grad.clone(),
            Self::Relu => {
                let mut dx = grad.clone();
                dx.zip_mut_with(output, |g, y| {
                    if *y <= A::zero() {
                        *g = A::zero()
                    }
                });
                dx
            }
            Self::Sigmoid => {
                let mut dx = grad.clone();
                dx.zip_mut_with(output, |g, y| *g = *g * *y * (A::one() - *y));
                dx
            }
            Self::Tanh => {
                let mut dx = grad.clone();
                dx.zip_mut_with(output, |g, y| *g = *g * (A::one() - *y * *y));
                dx
            }
            Self::Softmax => {
                // dx = y * (g - <g, y>) column wise
                let mut dx = grad.clone();
                for (mut dcol, ycol) in dx.columns_mut().into_iter().zip(output.columns()) {
                    let dot = dcol.iter().zip(ycol.iter()).fold(A::zero(), |s, (g, y)| s + *g * *y);
                    dcol.zip_mut_with(&ycol, |g, y| *g = *y * (*g - dot));
                }
                dx
            }
        }
    }
}

/// Applies an activation function elementwise (per column for softmax)
pub struct ActivationFunctionComponent {
    id: ComponentId,
    neurons: Neurons,
    function: ActivationFunctionType,
}

impl ActivationFunctionComponent {
    pub fn new(neurons: Neurons, function: ActivationFunctionType) -> Self {
        ActivationFunctionComponent { id: ComponentId::next(), neurons, function }
    }

    pub fn linear(neurons: Neurons) -> Self {
        Self::new(neurons, ActivationFunctionType::Linear)
    }

    pub fn relu(neurons: Neurons) -> Self {
        Self::new(neurons, ActivationFunctionType::Relu)
    }

    pub fn sigmoid(neurons: Neurons) -> Self {
        Self::new(neurons, ActivationFunctionType::Sigmoid)
    }

    pub fn tanh(neurons: Neurons) -> Self {
        Self::new(neurons, ActivationFunctionType::Tanh)
    }

    pub fn softmax(neurons: Neurons) -> Self {
        Self::new(neurons, ActivationFunctionType::Softmax)
    }

    pub fn function(&self) -> ActivationFunctionType {
        self.function
    }
}

impl Component for ActivationFunctionComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("{:?} activation {}", self.function, self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.neurons
    }

    fn output_neurons(&self) -> Neurons {
        self.neurons
    }

    fn forward(&self, input: &NeuronsActivation, _ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        validate_input(&self.name(), &self.neurons, input)?;
        let output = input.with_matrix(self.function.activate(input.matrix()));
        Ok(Box::new(ActivationFunctionActivation { function: self.function, output }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        vec![self]
    }

    fn activation_function(&self) -> Option<ActivationFunctionType> {
        Some(self.function)
    }
}

pub struct ActivationFunctionActivation {
    function: ActivationFunctionType,
    output: NeuronsActivation,
}

impl ActivationFunctionActivation {
    pub fn function(&self) -> ActivationFunctionType {
        self.function
    }
}

impl Activation for ActivationFunctionActivation {
    fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        if outer.output().shape() != self.output.shape() {
            return Err(NnError::ShapeMismatch {
                component: format!("{:?} activation backward", self.function),
                expected: self.output.features(),
                actual: outer.output().features(),
            }
            .into());
        }
        let dx = self.function.gradient(self.output.matrix(), outer.output().matrix());
        let dx = outer.output().with_matrix(dx);
        Ok(outer.map_output(dx))
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        vec![self]
    }
}
