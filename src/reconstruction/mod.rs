//! Gradient-inversion reconstruction.
//!
//! Clients share per-sample gradients of the frozen encoder. The coordinator recovers synthetic
//! images from them in two stages: [`predict_labels`] reads the label of every gradient off its
//! output-weight layer, then [`Reconstructor::reconstruct`] optimizes a random candidate image per
//! gradient until the encoder gradient it induces matches the shared one. The snapshots of the
//! final iterations become the [`ReconstructionBuffer`] the monitor benchmarks against.

pub mod lbfgs;

use std::{collections::BTreeMap, sync::Arc};

use ndarray::{Array1, Array3, Axis, Ix2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use thiserror::Error;

use self::lbfgs::{Lbfgs, LbfgsParams};
use crate::{
    data::Label,
    model::{
        network::{argmin, GradientTarget},
        GradientSnapshot,
        ModelError,
        Perceptron,
    },
    settings::{ImageShape, ReconstructionSettings},
};

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors related to malformed shared gradients.
pub enum ReconstructionError {
    #[error("gradient {index} has {layers} layers, at least 2 are required")]
    TooFewLayers { index: usize, layers: usize },
    #[error("the output layer of gradient {index} has {ndim} dimensions, expected 2")]
    NotAMatrix { index: usize, ndim: usize },
    #[error("gradient {index} does not fit the encoder: {source}")]
    Layout {
        index: usize,
        #[source]
        source: ModelError,
    },
    #[error("{labels} predicted labels for {pool} gradients")]
    AssignmentLength { labels: usize, pool: usize },
    #[error("the encoder input of length {input} does not fit images of shape {image:?}")]
    ImageShape { input: usize, image: ImageShape },
}

/// The predicted label of every pooled gradient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelAssignment(Vec<Label>);

impl LabelAssignment {
    /// Gets the label of every pooled gradient, in pool order.
    pub fn labels(&self) -> &[Label] {
        &self.0
    }

    /// Groups the pool indices by label, in ascending label order.
    pub fn by_label(&self) -> BTreeMap<Label, Vec<usize>> {
        let mut groups: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
        for (index, &label) in self.0.iter().enumerate() {
            groups.entry(label).or_default().push(index);
        }
        groups
    }

    /// Counts the pooled gradients per label.
    pub fn histogram(&self) -> BTreeMap<Label, usize> {
        self.by_label()
            .into_iter()
            .map(|(label, indices)| (label, indices.len()))
            .collect()
    }
}

/// Predicts the label of every pooled gradient.
///
/// The label is the row of the output-weight gradient (the second-to-last layer) with the
/// smallest sum: only the row of the true class is pushed towards the sample.
///
/// # Errors
/// Fails if a gradient has fewer than two layers or if its second-to-last layer is not a matrix.
pub fn predict_labels(pool: &[GradientSnapshot]) -> Result<LabelAssignment, ReconstructionError> {
    pool.iter()
        .enumerate()
        .map(|(index, snapshot)| {
            let layers = snapshot.layers();
            if layers.len() < 2 {
                return Err(ReconstructionError::TooFewLayers {
                    index,
                    layers: layers.len(),
                });
            }
            let output = &layers[layers.len() - 2];
            let output = output
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|_| ReconstructionError::NotAMatrix {
                    index,
                    ndim: output.ndim(),
                })?;
            Ok(argmin(output.sum_axis(Axis(1)).view()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(LabelAssignment)
}

/// Reconstructed images, grouped by label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionBuffer {
    /// The images of every label, in height-width-channel layout.
    pub new_set: Vec<Vec<Array3<u8>>>,
    /// The label of every group, parallel to `new_set`.
    pub new_set_label: Vec<Label>,
}

impl ReconstructionBuffer {
    /// Gets the number of label groups.
    pub fn len(&self) -> usize {
        self.new_set_label.len()
    }

    /// Checks whether the buffer holds no group.
    pub fn is_empty(&self) -> bool {
        self.new_set_label.is_empty()
    }

    /// Gets the total number of images.
    pub fn image_count(&self) -> usize {
        self.new_set.iter().map(Vec::len).sum()
    }

    /// Iterates over all images with their labels.
    pub fn iter(&self) -> impl Iterator<Item = (&Array3<u8>, Label)> {
        self.new_set
            .iter()
            .zip(&self.new_set_label)
            .flat_map(|(images, &label)| images.iter().map(move |image| (image, label)))
    }
}

/// The outcome of the inversion of a single gradient.
#[derive(Debug, Clone)]
struct Inversion {
    snapshots: Vec<Array3<u8>>,
    initial_loss: f32,
    final_loss: f32,
}

/// Inverts shared gradients on a frozen encoder.
#[derive(Debug, Clone)]
pub struct Reconstructor {
    settings: ReconstructionSettings,
    encoder: Arc<Perceptron>,
    image: ImageShape,
}

impl Reconstructor {
    /// Creates a reconstructor.
    ///
    /// # Errors
    /// Fails if the encoder input does not match the image shape.
    pub fn new(
        settings: ReconstructionSettings,
        encoder: Arc<Perceptron>,
        image: ImageShape,
    ) -> Result<Self, ReconstructionError> {
        let input = encoder.shape().input;
        if input != image.len() {
            return Err(ReconstructionError::ImageShape { input, image });
        }
        Ok(Self {
            settings,
            encoder,
            image,
        })
    }

    /// Reconstructs images from the pooled gradients shared in the given global round.
    ///
    /// Labels are visited in ascending order and labels without a gradient get no group. Every
    /// gradient contributes the last `num_image` snapshots of its optimization to the group of
    /// its label. The starting candidates depend on the round, so a later reconstruction does not
    /// repeat the starts of an earlier one.
    ///
    /// # Errors
    /// Fails if the assignment is not the one of the pool or if a gradient does not fit the
    /// encoder.
    pub fn reconstruct(
        &self,
        pool: &[GradientSnapshot],
        assignment: &LabelAssignment,
        round: u64,
    ) -> Result<ReconstructionBuffer, ReconstructionError> {
        if assignment.labels().len() != pool.len() {
            return Err(ReconstructionError::AssignmentLength {
                labels: assignment.labels().len(),
                pool: pool.len(),
            });
        }
        let shape = self.encoder.shape();
        let groups = assignment.by_label();
        let jobs = groups
            .iter()
            .flat_map(|(&label, indices)| indices.iter().map(move |&index| (label, index)))
            .map(|(label, index)| {
                GradientTarget::new(shape, &pool[index])
                    .map(|target| (label, index, target))
                    .map_err(|source| ReconstructionError::Layout { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let seed = |index: usize| candidate_seed(self.settings.seed, round, index);
        let inversions: Vec<(Label, Inversion)> = if self.settings.parallel {
            jobs.par_iter()
                .map(|(label, index, target)| {
                    (*label, self.invert(*label, *index, seed(*index), target))
                })
                .collect()
        } else {
            jobs.iter()
                .map(|(label, index, target)| {
                    (*label, self.invert(*label, *index, seed(*index), target))
                })
                .collect()
        };

        let mut buffer = ReconstructionBuffer::default();
        for (label, inversion) in inversions {
            if buffer.new_set_label.last() != Some(&label) {
                buffer.new_set_label.push(label);
                buffer.new_set.push(Vec::new());
            }
            if let Some(group) = buffer.new_set.last_mut() {
                group.extend(inversion.snapshots);
            }
        }
        info!(
            "reconstructed {} images of {} labels from {} gradients",
            buffer.image_count(),
            buffer.len(),
            pool.len()
        );
        Ok(buffer)
    }

    /// Draws a standard normal candidate image.
    fn candidate(&self, seed: u64) -> Array1<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array1::from_shape_fn(self.image.len(), |_| StandardNormal.sample(&mut rng))
    }

    /// Optimizes a random candidate image until its induced gradient matches the target.
    fn invert(&self, label: Label, index: usize, seed: u64, target: &GradientTarget) -> Inversion {
        let mut x = self.candidate(seed);
        let residual = |x: &Array1<f32>| self.encoder.gradient_residual(x.view(), label, target);

        let iterations = self.settings.iterations;
        let first_snapshot = iterations - self.settings.num_image.min(iterations);
        let mut lbfgs = Lbfgs::new(LbfgsParams::from(&self.settings));
        let mut snapshots = Vec::with_capacity(self.settings.num_image);
        let mut initial_loss = None;
        let mut final_loss = 0.;
        for iteration in 0..iterations {
            let start_loss = lbfgs.step(&mut x, residual);
            initial_loss.get_or_insert(start_loss);
            let (loss, _) = residual(&x);
            final_loss = loss;
            if iteration >= first_snapshot {
                snapshots.push(to_pixels(&x, self.image));
            }
        }
        let initial_loss = initial_loss.unwrap_or(final_loss);
        debug!(
            "gradient {} (label {}): residual {:.6} -> {:.6} after {} iterations",
            index, label, initial_loss, final_loss, iterations
        );
        Inversion {
            snapshots,
            initial_loss,
            final_loss,
        }
    }
}

/// Derives the seed of the starting candidate of a pooled gradient.
pub fn candidate_seed(seed: u64, round: u64, index: usize) -> u64 {
    (seed ^ round.wrapping_mul(0x9E37_79B9_7F4A_7C15)).wrapping_add(index as u64)
}

/// Converts a flattened channel-height-width image into height-width-channel pixels.
///
/// Values are clamped to `[0, 1]` before scaling.
pub fn to_pixels(x: &Array1<f32>, shape: ImageShape) -> Array3<u8> {
    let ImageShape {
        channels,
        height,
        width,
    } = shape;
    Array3::from_shape_fn((height, width, channels), |(h, w, c)| {
        (x[(c * height + h) * width + w].clamp(0., 1.) * 255.) as u8
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ndarray::{array, ArrayD, IxDyn};

    use super::*;
    use crate::model::NetworkShape;

    fn image() -> ImageShape {
        ImageShape {
            channels: 1,
            height: 2,
            width: 2,
        }
    }

    fn encoder() -> Arc<Perceptron> {
        let shape = NetworkShape {
            input: 4,
            hidden: 3,
            classes: 6,
        };
        Arc::new(Perceptron::weights_init(shape, 7))
    }

    fn settings(parallel: bool) -> ReconstructionSettings {
        ReconstructionSettings {
            iterations: 6,
            num_image: 3,
            learning_rate: 0.1,
            max_iter: 20,
            history_size: 100,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            encoder_hidden: 3,
            encoder_seed: 7,
            seed: 1,
            parallel,
        }
    }

    fn pool(encoder: &Perceptron, labels: &[Label]) -> Vec<GradientSnapshot> {
        labels
            .iter()
            .enumerate()
            .map(|(i, &label)| {
                let x = Array1::from_shape_fn(4, |j| ((i + j) % 4) as f32 / 4.);
                encoder.sample_gradient(x.view(), label)
            })
            .collect()
    }

    #[test]
    fn test_predict_labels() {
        let encoder = encoder();
        let assignment = predict_labels(&pool(&encoder, &[5, 2, 5])).unwrap();
        assert_eq!(assignment.labels(), &[5, 2, 5]);
        assert_eq!(
            assignment.histogram(),
            vec![(2, 1), (5, 2)].into_iter().collect::<BTreeMap<_, _>>()
        );
    }

    #[test]
    fn test_predict_labels_rejects_malformed_gradients() {
        let single = GradientSnapshot::from(vec![ArrayD::<f32>::zeros(IxDyn(&[2, 2]))]);
        assert_eq!(
            predict_labels(&[single]),
            Err(ReconstructionError::TooFewLayers {
                index: 0,
                layers: 1
            })
        );
        let flat = GradientSnapshot::from(vec![
            ArrayD::<f32>::zeros(IxDyn(&[2])),
            ArrayD::<f32>::zeros(IxDyn(&[2])),
        ]);
        assert_eq!(
            predict_labels(&[flat]),
            Err(ReconstructionError::NotAMatrix { index: 0, ndim: 1 })
        );
    }

    #[test]
    fn test_reconstruct_groups_by_ascending_label() {
        let encoder = encoder();
        let pool = pool(&encoder, &[5, 2]);
        let assignment = predict_labels(&pool).unwrap();
        let reconstructor = Reconstructor::new(settings(false), encoder, image()).unwrap();
        let buffer = reconstructor.reconstruct(&pool, &assignment, 0).unwrap();
        assert_eq!(buffer.new_set_label, vec![2, 5]);
        assert_eq!(buffer.new_set.len(), buffer.new_set_label.len());
        for group in &buffer.new_set {
            assert_eq!(group.len(), 3);
            assert!(group.iter().all(|image| image.shape() == [2, 2, 1]));
        }
    }

    #[test]
    fn test_every_gradient_of_a_label_adds_snapshots() {
        let encoder = encoder();
        let pool = pool(&encoder, &[1, 1]);
        let assignment = predict_labels(&pool).unwrap();
        let reconstructor = Reconstructor::new(settings(false), encoder, image()).unwrap();
        let buffer = reconstructor.reconstruct(&pool, &assignment, 0).unwrap();
        assert_eq!(buffer.new_set_label, vec![1]);
        assert_eq!(buffer.image_count(), 6);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let encoder = encoder();
        let pool = pool(&encoder, &[0, 3, 4, 3]);
        let assignment = predict_labels(&pool).unwrap();
        let sequential = Reconstructor::new(settings(false), Arc::clone(&encoder), image())
            .unwrap()
            .reconstruct(&pool, &assignment, 0)
            .unwrap();
        let parallel = Reconstructor::new(settings(true), encoder, image())
            .unwrap()
            .reconstruct(&pool, &assignment, 0)
            .unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_inversion_lowers_the_residual() {
        let encoder = encoder();
        let pool = pool(&encoder, &[4]);
        let reconstructor = Reconstructor::new(
            ReconstructionSettings {
                iterations: 30,
                ..settings(false)
            },
            Arc::clone(&encoder),
            image(),
        )
        .unwrap();
        let target = GradientTarget::new(encoder.shape(), &pool[0]).unwrap();
        let inversion = reconstructor.invert(4, 0, 1, &target);
        assert_eq!(inversion.snapshots.len(), 3);
        assert!(inversion.final_loss < inversion.initial_loss);
    }

    #[test]
    fn test_reconstructor_rejects_mismatched_images() {
        let wide = ImageShape {
            width: 3,
            ..image()
        };
        assert!(matches!(
            Reconstructor::new(settings(false), encoder(), wide),
            Err(ReconstructionError::ImageShape { input: 4, .. })
        ));
    }

    #[test]
    fn test_to_pixels_clamps_and_transposes() {
        let shape = ImageShape {
            channels: 2,
            height: 1,
            width: 2,
        };
        let pixels = to_pixels(&array![0., 1., -0.5, 2.], shape);
        assert_eq!(pixels.shape(), &[1, 2, 2]);
        assert_eq!(pixels[[0, 0, 0]], 0);
        assert_eq!(pixels[[0, 1, 0]], 255);
        assert_eq!(pixels[[0, 0, 1]], 0);
        assert_eq!(pixels[[0, 1, 1]], 255);
    }

    #[test]
    fn test_candidates_differ_across_rounds() {
        let reconstructor = Reconstructor::new(settings(false), encoder(), image()).unwrap();
        let seeds: BTreeSet<u64> = (0..4)
            .flat_map(|round| (0..3).map(move |index| candidate_seed(1, round, index)))
            .collect();
        assert_eq!(seeds.len(), 12);
        assert_eq!(candidate_seed(1, 0, 2), 3);
        assert_ne!(
            reconstructor.candidate(candidate_seed(1, 0, 0)),
            reconstructor.candidate(candidate_seed(1, 1, 0))
        );
        assert_eq!(
            reconstructor.candidate(candidate_seed(1, 5, 0)),
            reconstructor.candidate(candidate_seed(1, 5, 0))
        );
    }
}
