//! Model representation.
//!
//! A model is exchanged between coordinator and clients as [`Weights`], an ordered sequence of
//! per-layer tensors (weight, then bias, for every layer). Gradients that clients share travel as
//! [`GradientSnapshot`]s with the same layout. The [`Perceptron`] is the network behind both the
//! global classifier and the frozen encoder of the reconstruction.

pub mod network;
pub mod store;

use derive_more::{From, Into};
use ndarray::ArrayD;
use thiserror::Error;

pub use self::{
    network::{NetworkShape, Perceptron},
    store::{ModelArena, ModelVersion},
};

/// A per-layer tensor.
pub type Layer = ArrayD<f32>;

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors related to converting layer tensors into a network.
pub enum ModelError {
    #[error("expected {expected} layers, got {actual}")]
    LayerCount { expected: usize, actual: usize },
    #[error("layer {index} has shape {actual:?}, expected {expected:?}")]
    LayerShape {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("cannot aggregate an empty set of models")]
    NothingToAggregate,
    #[error("aggregation weights sum up to zero")]
    ZeroTotalWeight,
}

#[derive(Debug, Clone, PartialEq, From, Into)]
/// A snapshot of the parameters of a network.
pub struct Weights(Vec<Layer>);

#[allow(clippy::len_without_is_empty)]
impl Weights {
    /// Gets the number of layer tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the layer tensors.
    pub fn layers(&self) -> &[Layer] {
        &self.0
    }

    /// Gets the shapes of the layer tensors.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.0.iter().map(|layer| layer.shape().to_vec()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, From, Into)]
/// The gradients of a loss with respect to the parameters of a network.
///
/// The layout is that of [`Weights`]: one tensor per parameter, ordered layer by layer.
pub struct GradientSnapshot(Vec<Layer>);

#[allow(clippy::len_without_is_empty)]
impl GradientSnapshot {
    /// Gets the number of layer tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the layer tensors.
    pub fn layers(&self) -> &[Layer] {
        &self.0
    }
}
