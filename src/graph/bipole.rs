use std::sync::Arc;

use anyhow::Result;
use log::{debug, trace};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::*;
use crate::nn::{FullyConnectedAxons, PassThroughAxons};
use crate::NnError;

/// How the outputs of parallel branches are merged back into one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathCombinationStrategy {
    /// elementwise sum, every branch has the same shape
    Addition,
    /// stacked along the channel axis, branches share width and height
    FilterConcat,
}

/// One to many link, hands the same input to every branch
#[derive(Clone, Debug)]
pub struct FanOut {
    neurons: Neurons,
    branches: usize,
}

impl FanOut {
    pub fn new(neurons: Neurons, branches: usize) -> Self {
        FanOut { neurons, branches }
    }

    pub fn branches(&self) -> usize {
        self.branches
    }

    pub fn forward(&self, input: &NeuronsActivation) -> Result<Vec<NeuronsActivation>> {
        validate_input("fan out", &self.neurons, input)?;
        Ok((0..self.branches).map(|_| input.duplicate()).collect())
    }

    /// The input fed every branch, so its gradient is the sum of theirs.
    pub fn back_propagate(&self, grads: BatchGradient) -> Result<Gradient> {
        if grads.len() != self.branches {
            return Err(NnError::BatchSizeMismatch { expected: self.branches, actual: grads.len() }.into());
        }
        let (outputs, suppliers) = grads.into_parts();
        let examples = outputs.first().ok_or(NnError::EmptyBatch)?.examples();
        for (i, g) in outputs.iter().enumerate() {
            validate_input(&format!("fan out gradient {i}"), &self.neurons, g)?;
            validate_examples(&format!("fan out gradient {i}"), examples, g)?;
        }
        let mut outputs = outputs.into_iter();
        let first = outputs.next().ok_or(NnError::EmptyBatch)?;
        let mut sum = first.matrix().clone();
        for g in outputs {
            sum += g.matrix();
        }
        Ok(Gradient::with_suppliers(first.with_matrix(sum), suppliers))
    }
}

/// Many to one link merging branch outputs with a `PathCombinationStrategy`.
/// Branch shapes are validated here, at construction, so no branch ever runs
/// for a graph that could not be merged.
#[derive(Clone, Debug)]
pub struct FanIn {
    strategy: PathCombinationStrategy,
    inputs: Vec<Neurons>,
    output: Neurons,
}

impl FanIn {
    pub fn new(strategy: PathCombinationStrategy, inputs: Vec<Neurons>) -> Result<Self> {
        let first = *inputs.first().ok_or(NnError::EmptyBatch)?;
        let mismatch = |detail: String| NnError::BranchShapeMismatch { strategy, detail };
        let output = match strategy {
            PathCombinationStrategy::Addition => {
                if let Some((i, n)) = inputs.iter().enumerate().find(|(_, n)| **n != first) {
                    return Err(mismatch(format!("branch {i} outputs {n:?}, branch 0 outputs {first:?}")).into());
                }
                first
            }
            PathCombinationStrategy::FilterConcat => {
                let (width, height) = match (first.width(), first.height()) {
                    (Some(w), Some(h)) => (w, h),
                    _ => {
                        return Err(NnError::Unsupported(format!(
                            "filter concat of non spatial neurons {first:?}"
                        ))
                        .into())
                    }
                };
                let mut depth = 0;
                for (i, n) in inputs.iter().enumerate() {
                    if n.width() != Some(width) || n.height() != Some(height) {
                        return Err(mismatch(format!(
                            "branch {i} is {:?}x{:?}, branch 0 is {width}x{height}",
                            n.width(),
                            n.height()
                        ))
                        .into());
                    }
                    depth += n.depth().unwrap_or(0);
                }
                Neurons::spatial(width, height, depth, false)
            }
        };
        Ok(FanIn { strategy, inputs, output })
    }

    pub fn strategy(&self) -> PathCombinationStrategy {
        self.strategy
    }

    pub fn output_neurons(&self) -> Neurons {
        self.output
    }

    pub fn forward(&self, inputs: &[NeuronsActivation]) -> Result<FanInActivation> {
        if inputs.len() != self.inputs.len() {
            return Err(NnError::BatchSizeMismatch { expected: self.inputs.len(), actual: inputs.len() }.into());
        }
        let examples = inputs.first().ok_or(NnError::EmptyBatch)?.examples();
        for (i, (x, n)) in inputs.iter().zip(self.inputs.iter()).enumerate() {
            validate_input(&format!("fan in branch {i}"), n, x)?;
            validate_examples(&format!("fan in branch {i}"), examples, x)?;
        }
        let mut boundaries = SmallVec::new();
        let combined = match self.strategy {
            PathCombinationStrategy::Addition => {
                let mut sum = inputs[0].matrix().clone();
                for x in &inputs[1..] {
                    sum += x.matrix();
                }
                sum
            }
            PathCombinationStrategy::FilterConcat => {
                let mut offset = 0;
                for x in inputs {
                    offset += x.features();
                    boundaries.push(offset);
                }
                let views: Vec<ArrayView2<f32>> = inputs.iter().map(|x| x.view()).collect();
                ndarray::concatenate(Axis(0), &views)?
            }
        };
        Ok(FanInActivation {
            output: inputs[0].with_matrix(combined),
            strategy: self.strategy,
            output_neurons: self.output,
            boundaries,
            branches: inputs.len(),
        })
    }
}

pub struct FanInActivation {
    output: NeuronsActivation,
    strategy: PathCombinationStrategy,
    output_neurons: Neurons,
    /// cumulative feature rows per branch, flattened element units
    boundaries: SmallVec<[usize; 4]>,
    branches: usize,
}

impl FanInActivation {
    pub fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    pub fn back_propagate(self, outer: Gradient) -> Result<BatchGradient> {
        let (grad, suppliers) = outer.into_parts();
        let outputs = match self.strategy {
            PathCombinationStrategy::Addition => (0..self.branches).map(|_| grad.duplicate()).collect(),
            PathCombinationStrategy::FilterConcat => self.split_channels(&grad)?,
        };
        Ok(BatchGradient::with_suppliers(outputs, suppliers))
    }

    fn split_channels(&self, grad: &NeuronsActivation) -> Result<Vec<NeuronsActivation>> {
        let channel_size = self.output_neurons.channel_size();
        let mismatch = |detail: String| NnError::BranchShapeMismatch { strategy: self.strategy, detail };

        // channel boundaries are derived here from the element offsets of this call
        let mut channels: SmallVec<[usize; 4]> = SmallVec::new();
        for b in &self.boundaries {
            if b % channel_size != 0 {
                return Err(mismatch(format!("boundary {b} is not a multiple of the channel size {channel_size}")).into());
            }
            channels.push(b / channel_size);
        }
        let total = channels.last().copied().unwrap_or(0) * channel_size;
        if grad.features() != total {
            return Err(NnError::ShapeMismatch {
                component: "fan in backward".to_string(),
                expected: total,
                actual: grad.features(),
            }
            .into());
        }

        let mut start = 0;
        let mut outputs = Vec::with_capacity(channels.len());
        for end in channels {
            trace!("filter concat backward slicing channels {start}..{end}");
            let slice = grad.view().slice(s![start * channel_size..end * channel_size, ..]).to_owned();
            outputs.push(grad.with_matrix(slice));
            start = end;
        }
        Ok(outputs)
    }
}

/// Fan out, run the branches of a batch in parallel, fan the results back in.
/// The graph of skip connections and multi path blocks.
pub struct BipoleGraph {
    id: ComponentId,
    input: Neurons,
    fan_out: FanOut,
    branches: Batch,
    fan_in: FanIn,
}

impl BipoleGraph {
    pub fn new(input: Neurons, branches: Batch, strategy: PathCombinationStrategy) -> Result<Self> {
        for c in branches.components() {
            if c.input_neurons().features() != input.features() {
                return Err(NnError::ShapeMismatch {
                    component: c.name(),
                    expected: c.input_neurons().features(),
                    actual: input.features(),
                }
                .into());
            }
        }
        let outputs = branches.components().iter().map(|c| c.output_neurons()).collect();
        let fan_in = FanIn::new(strategy, outputs)?;
        let id = ComponentId::next();
        debug!(
            "built bipole graph {id}: {} branches merged by {strategy:?} into {:?}",
            branches.len(),
            fan_in.output_neurons()
        );
        Ok(BipoleGraph { id, input, fan_out: FanOut::new(input, branches.len()), branches, fan_in })
    }

    /// Skip connection around `main`. The skip path is a pass-through when the
    /// feature counts agree, otherwise a fully connected projection whose
    /// weights must be initialised before the first forward.
    pub fn residual(main: Arc<dyn Component>) -> Result<Self> {
        let input = main.input_neurons();
        let output = main.output_neurons();
        let skip: Arc<dyn Component> = if input.features() == output.features() {
            Arc::new(PassThroughAxons::new(input, output))
        } else {
            Arc::new(FullyConnectedAxons::uninitialised(input, output))
        };
        Self::new(input, Batch::new(vec![main, skip])?, PathCombinationStrategy::Addition)
    }

    pub fn branches(&self) -> &Batch {
        &self.branches
    }

    pub fn strategy(&self) -> PathCombinationStrategy {
        self.fan_in.strategy()
    }
}

impl Component for BipoleGraph {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        format!("bipole graph {}", self.id)
    }

    fn input_neurons(&self) -> Neurons {
        self.input
    }

    fn output_neurons(&self) -> Neurons {
        self.fan_in.output_neurons()
    }

    fn forward(&self, input: &NeuronsActivation, ctx: &GraphContext) -> Result<Box<dyn Activation>> {
        let inputs = self.fan_out.forward(input)?;
        let batch = self.branches.forward(inputs, ctx)?;
        let fan_in = self.fan_in.forward(batch.outputs())?;
        Ok(Box::new(BipoleGraphActivation { fan_out: self.fan_out.clone(), batch, fan_in }))
    }

    fn decompose(&self) -> Vec<&dyn Component> {
        self.branches.decompose()
    }
}

pub struct BipoleGraphActivation {
    fan_out: FanOut,
    batch: BatchActivation,
    fan_in: FanInActivation,
}

impl BipoleGraphActivation {
    pub fn batch(&self) -> &BatchActivation {
        &self.batch
    }
}

impl Activation for BipoleGraphActivation {
    fn output(&self) -> &NeuronsActivation {
        self.fan_in.output()
    }

    fn back_propagate(self: Box<Self>, outer: Gradient) -> Result<Gradient> {
        let BipoleGraphActivation { fan_out, batch, fan_in } = *self;
        let branch_grads = fan_in.back_propagate(outer)?;
        let input_grads = batch.back_propagate(branch_grads)?;
        fan_out.back_propagate(input_grads)
    }

    fn decompose(&self) -> Vec<&dyn Activation> {
        self.batch.decompose()
    }
}
