use anyhow::Result;
use ndarray::prelude::*;
use num::Float;
use serde::{Deserialize, Serialize};

use super::ActivationFunctionType;
use crate::NnError;

/// Cost of an output against the desired output, averaged over examples
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CostFunction {
    /// binary cross entropy, pairs with sigmoid
    CrossEntropy,
    /// pairs with softmax
    MultiClassCrossEntropy,
    /// half the squared error, pairs with a linear output
    SumSquaredError,
}

fn clamp<A: Float>(y: A) -> A {
    let eps = A::from(1e-7).unwrap_or_else(A::epsilon);
    y.max(eps).min(A::one() - eps)
}

fn check_shapes<A>(output: &Array2<A>, desired: &Array2<A>) -> Result<()> {
    if output.dim() != desired.dim() {
        return Err(NnError::ShapeMismatch {
            component: "cost function".to_string(),
            expected: output.len(),
            actual: desired.len(),
        }
        .into());
    }
    Ok(())
}

impl CostFunction {
    /// the output activation whose derivative cancels against this cost
    pub fn matches(&self, function: ActivationFunctionType) -> bool {
        matches!(
            (self, function),
            (Self::CrossEntropy, ActivationFunctionType::Sigmoid)
                | (Self::MultiClassCrossEntropy, ActivationFunctionType::Softmax)
                | (Self::SumSquaredError, ActivationFunctionType::Linear)
        )
    }

    pub fn cost<A: Float>(&self, output: &Array2<A>, desired: &Array2<A>) -> Result<A> {
        check_shapes(output, desired)?;
        let examples = A::from(output.ncols().max(1)).unwrap_or_else(A::one);
        let half = A::from(0.5).unwrap_or_else(A::one);
        let total = output.iter().zip(desired.iter()).fold(A::zero(), |sum, (y, t)| {
            let term = match self {
                Self::SumSquaredError => half * (*y - *t) * (*y - *t),
                Self::CrossEntropy => {
                    let y = clamp(*y);
                    -(*t * y.ln() + (A::one() - *t) * (A::one() - y).ln())
                }
                Self::MultiClassCrossEntropy => -(*t * clamp(*y).ln()),
            };
            sum + term
        });
        Ok(total / examples)
    }

    /// dJ/dy of the cost summed over examples
    pub fn gradient<A: Float>(&self, output: &Array2<A>, desired: &Array2<A>) -> Result<Array2<A>> {
        check_shapes(output, desired)?;
        let mut grad = output.clone();
        grad.zip_mut_with(desired, |y, t| {
            *y = match self {
                Self::SumSquaredError => *y - *t,
                Self::CrossEntropy => {
                    let c = clamp(*y);
                    (c - *t) / (c * (A::one() - c))
                }
                Self::MultiClassCrossEntropy => -*t / clamp(*y),
            }
        });
        Ok(grad)
    }

    /// Gradient w.r.t. the input of the final activation function. Matching
    /// pairs reduce to `output - desired`; anything else chains the cost
    /// derivative through the activation derivative.
    pub fn input_gradient<A: Float>(
        &self,
        function: ActivationFunctionType,
        output: &Array2<A>,
        desired: &Array2<A>,
    ) -> Result<Array2<A>> {
        if self.matches(function) {
            check_shapes(output, desired)?;
            return Ok(output - desired);
        }
        Ok(function.gradient(output, &self.gradient(output, desired)?))
    }
}
