//! The monitor benchmark.
//!
//! The reconstructed images stand in for the inaccessible client data: the global model is scored
//! on them after every round, and the [`PromotionGate`] decides on that score whether the model
//! becomes the new best model.

pub mod gate;

use ndarray::{Array2, ArrayView2, Axis};
use thiserror::Error;

pub use self::gate::{PromotionGate, PromotionResult};
use crate::{data::Label, model::Perceptron, reconstruction::ReconstructionBuffer};

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors related to the monitor set.
pub enum MonitorError {
    #[error("an image of label {label} has {actual} values, expected {expected}")]
    ImageLength {
        label: Label,
        expected: usize,
        actual: usize,
    },
}

/// The reconstructed images as flattened model inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSet {
    images: Array2<f32>,
    labels: Vec<Label>,
}

impl MonitorSet {
    /// Converts the pixels of a buffer back into channel-height-width inputs in `[0, 1]`.
    ///
    /// # Errors
    /// Fails if the images of the buffer differ in size.
    pub fn from_buffer(buffer: &ReconstructionBuffer) -> Result<Self, MonitorError> {
        let len = buffer
            .new_set
            .iter()
            .flatten()
            .next()
            .map_or(0, |image| image.len());
        let mut images = Array2::zeros((buffer.image_count(), len));
        let mut labels = Vec::with_capacity(buffer.image_count());
        for (mut row, (image, label)) in images.rows_mut().into_iter().zip(buffer.iter()) {
            if image.len() != len {
                return Err(MonitorError::ImageLength {
                    label,
                    expected: len,
                    actual: image.len(),
                });
            }
            let pixels = image.view().permuted_axes([2, 0, 1]);
            row.iter_mut()
                .zip(pixels.iter())
                .for_each(|(value, &pixel)| *value = f32::from(pixel) / 255.);
            labels.push(label);
        }
        Ok(Self { images, labels })
    }

    /// Gets the number of images.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Checks whether the set holds no image.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Batches of the monitor set.
///
/// The last batch may be partial.
#[derive(Debug, Clone)]
pub struct MonitorLoader {
    set: MonitorSet,
    batch_size: usize,
}

impl MonitorLoader {
    pub fn new(set: MonitorSet, batch_size: usize) -> Self {
        Self {
            set,
            batch_size: batch_size.max(1),
        }
    }

    /// Gets the number of images.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Checks whether the loader yields no batch.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Iterates over the batches of inputs and labels.
    pub fn batches(&self) -> impl Iterator<Item = (ArrayView2<'_, f32>, &[Label])> {
        let batch_size = self.batch_size;
        self.set
            .images
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(self.set.labels.chunks(batch_size))
    }
}

/// Scores a model on the monitor loader: the top-1 accuracy in percent.
///
/// Yields `None` if the loader is empty, since the accuracy is undefined then.
pub fn monitor(model: &Perceptron, loader: &MonitorLoader) -> Option<f64> {
    let mut correct = 0;
    let mut total = 0;
    for (images, labels) in loader.batches() {
        correct += model
            .predict(images)
            .iter()
            .zip(labels)
            .filter(|(predicted, label)| predicted == label)
            .count();
        total += labels.len();
    }
    (total > 0).then(|| 100. * correct as f64 / total as f64)
}
