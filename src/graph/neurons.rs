use std::sync::Arc;

use anyhow::Result;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::NnError;

/// Immutable shape descriptor of a layer of neurons. The spatial variant lays
/// its features out channel-major, `features = width * height * depth`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Neurons {
    features: usize,
    bias_unit: bool,
    spatial: Option<[usize; 3]>,
}

impl Neurons {
    pub fn new(features: usize, bias_unit: bool) -> Self {
        Neurons { features, bias_unit, spatial: None }
    }

    pub fn spatial(width: usize, height: usize, depth: usize, bias_unit: bool) -> Self {
        Neurons { features: width * height * depth, bias_unit, spatial: Some([width, height, depth]) }
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn has_bias_unit(&self) -> bool {
        self.bias_unit
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial.is_some()
    }

    pub fn width(&self) -> Option<usize> {
        self.spatial.map(|s| s[0])
    }

    pub fn height(&self) -> Option<usize> {
        self.spatial.map(|s| s[1])
    }

    pub fn depth(&self) -> Option<usize> {
        self.spatial.map(|s| s[2])
    }

    /// elements in a single channel, 1 for flat neurons
    pub fn channel_size(&self) -> usize {
        self.spatial.map_or(1, |[w, h, _]| w * h)
    }

    pub fn with_bias_unit(&self, bias_unit: bool) -> Self {
        Neurons { bias_unit, ..*self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureOrientation {
    RowsSpanFeatureSet,
    ColumnsSpanFeatureSet,
}

/// A matrix of activations plus its feature orientation. With
/// `RowsSpanFeatureSet` each row is a feature and each column an example.
/// Immutable activations share their buffer when cloned.
#[derive(Clone, Debug)]
pub struct NeuronsActivation {
    data: Arc<Array2<f32>>,
    orientation: FeatureOrientation,
    immutable: bool,
}

impl NeuronsActivation {
    pub fn new(data: Array2<f32>, orientation: FeatureOrientation) -> Self {
        NeuronsActivation { data: Arc::new(data), orientation, immutable: true }
    }

    pub fn rows_span_features(data: Array2<f32>) -> Self {
        Self::new(data, FeatureOrientation::RowsSpanFeatureSet)
    }

    pub fn mutable(data: Array2<f32>, orientation: FeatureOrientation) -> Self {
        NeuronsActivation { data: Arc::new(data), orientation, immutable: false }
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn view(&self) -> ArrayView2<f32> {
        self.data.view()
    }

    pub fn orientation(&self) -> FeatureOrientation {
        self.orientation
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn features(&self) -> usize {
        match self.orientation {
            FeatureOrientation::RowsSpanFeatureSet => self.data.nrows(),
            FeatureOrientation::ColumnsSpanFeatureSet => self.data.ncols(),
        }
    }

    pub fn examples(&self) -> usize {
        match self.orientation {
            FeatureOrientation::RowsSpanFeatureSet => self.data.ncols(),
            FeatureOrientation::ColumnsSpanFeatureSet => self.data.nrows(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Shares the buffer when immutable, copies it otherwise so a mutable
    /// activation never has two writers.
    pub fn duplicate(&self) -> Self {
        if self.immutable {
            self.clone()
        } else {
            NeuronsActivation {
                data: Arc::new(self.data.as_ref().clone()),
                orientation: self.orientation,
                immutable: false,
            }
        }
    }

    /// Releases the handle, returning the matrix without copying when this was
    /// the last reference.
    pub fn into_matrix(self) -> Array2<f32> {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    pub fn with_matrix(&self, data: Array2<f32>) -> Self {
        NeuronsActivation { data: Arc::new(data), orientation: self.orientation, immutable: self.immutable }
    }
}

/// Hard contract check every component runs before computing anything.
pub fn validate_input(component: &str, neurons: &Neurons, input: &NeuronsActivation) -> Result<()> {
    if input.orientation() != FeatureOrientation::RowsSpanFeatureSet {
        return Err(NnError::OrientationMismatch {
            component: component.to_string(),
            expected: FeatureOrientation::RowsSpanFeatureSet,
            actual: input.orientation(),
        }
        .into());
    }
    if input.features() != neurons.features() {
        return Err(NnError::ShapeMismatch {
            component: component.to_string(),
            expected: neurons.features(),
            actual: input.features(),
        }
        .into());
    }
    Ok(())
}

/// Example counts of activations and gradients meeting in one op must agree.
pub fn validate_examples(component: &str, expected: usize, input: &NeuronsActivation) -> Result<()> {
    if input.examples() != expected {
        return Err(NnError::ShapeMismatch {
            component: component.to_string(),
            expected,
            actual: input.examples(),
        }
        .into());
    }
    Ok(())
}

#[test]
fn test_neurons_shape() {
    let n = Neurons::spatial(4, 3, 2, false);
    assert_eq!(n.features(), 24);
    assert_eq!(n.channel_size(), 12);
    assert_eq!((n.width(), n.height(), n.depth()), (Some(4), Some(3), Some(2)));
    assert!(n.with_bias_unit(true).has_bias_unit());
    assert_eq!(Neurons::new(5, true).channel_size(), 1);
}

#[test]
fn test_validate_input() {
    let neurons = Neurons::new(3, false);
    let ok = NeuronsActivation::rows_span_features(Array2::zeros((3, 7)));
    assert!(validate_input("test", &neurons, &ok).is_ok());
    assert_eq!(ok.examples(), 7);

    let wrong_rows = NeuronsActivation::rows_span_features(Array2::zeros((4, 7)));
    let err = validate_input("test", &neurons, &wrong_rows).unwrap_err();
    assert_eq!(
        err.downcast_ref::<NnError>(),
        Some(&NnError::ShapeMismatch { component: "test".into(), expected: 3, actual: 4 })
    );

    let columns = NeuronsActivation::new(Array2::zeros((7, 3)), FeatureOrientation::ColumnsSpanFeatureSet);
    assert_eq!(columns.features(), 3);
    let err = validate_input("test", &neurons, &columns).unwrap_err();
    assert!(matches!(err.downcast_ref::<NnError>(), Some(NnError::OrientationMismatch { .. })));
}

#[test]
fn test_duplicate_shares_immutable() {
    let a = NeuronsActivation::rows_span_features(Array2::ones((2, 2)));
    let b = a.duplicate();
    assert!(std::ptr::eq(a.matrix(), b.matrix()));

    let m = NeuronsActivation::mutable(Array2::ones((2, 2)), FeatureOrientation::RowsSpanFeatureSet);
    let n = m.duplicate();
    assert!(!std::ptr::eq(m.matrix(), n.matrix()));
    assert_eq!(m.matrix(), n.matrix());
}
