//! Task-partitioned client data.
//!
//! Every client sees its own partition of every task. The coordinator reads partitions through a
//! [`TaskDataSource`] when it advances the clients to the next task; [`SyntheticSource`] is an
//! in-memory source generating class-conditioned images.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::{
    client::ClientId,
    settings::{DataSettings, ImageShape},
};

/// A class label.
pub type Label = usize;

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors related to reading client data.
pub enum DataError {
    #[error("no data for client {0}")]
    UnknownClient(ClientId),
    #[error("no data for task {task} of client {client}")]
    UnknownTask { client: ClientId, task: usize },
}

#[derive(Debug, Clone, PartialEq)]
/// A labeled image, flattened in channel-height-width order with values in `[0, 1]`.
pub struct Sample {
    pub image: Array1<f32>,
    pub label: Label,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// The labels of a task partition.
pub struct LabelInfo {
    /// The labels introduced by the task, in ascending order.
    pub labels: Vec<Label>,
    /// The number of train samples per label.
    pub counts: BTreeMap<Label, usize>,
}

impl LabelInfo {
    /// Counts the labels of the given samples.
    pub fn count(samples: &[Sample]) -> Self {
        let mut counts = BTreeMap::new();
        for sample in samples {
            *counts.entry(sample.label).or_insert(0) += 1;
        }
        Self {
            labels: counts.keys().copied().collect(),
            counts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The partition of one task for one client.
pub struct ClientTaskData {
    pub id: ClientId,
    pub train: Vec<Sample>,
    pub test: Vec<Sample>,
    pub label_info: LabelInfo,
}

/// A source of task-partitioned client data.
#[cfg_attr(test, automock)]
pub trait TaskDataSource {
    /// Gets the number of task partitions held for the given client.
    fn task_count(&self, client: ClientId) -> usize;

    /// Reads the partition of a task for a client.
    ///
    /// # Errors
    /// Fails if there is no such client or task.
    fn read_client_data(&self, client: ClientId, task: usize)
        -> Result<ClientTaskData, DataError>;
}

/// Stacks the images of the given samples into a batch, one row per sample.
pub fn stack<'a>(samples: impl IntoIterator<Item = &'a Sample>, shape: ImageShape) -> Array2<f32> {
    let samples: Vec<&Sample> = samples.into_iter().collect();
    let mut batch = Array2::zeros((samples.len(), shape.len()));
    for (mut row, sample) in batch.rows_mut().into_iter().zip(samples) {
        row.assign(&sample.image);
    }
    batch
}

/// Computes the mean image of the given samples.
pub fn mean_image<'a>(samples: impl IntoIterator<Item = &'a Sample>, shape: ImageShape) -> Array1<f32> {
    let mut mean = Array1::zeros(shape.len());
    let mut count = 0;
    for sample in samples {
        mean += &sample.image;
        count += 1;
    }
    if count > 0 {
        mean /= count as f32;
    }
    mean
}

/// Gets the sample closest to the given image in L2 distance.
pub fn closest_to<'a>(samples: &[&'a Sample], image: &Array1<f32>) -> Option<&'a Sample> {
    samples.iter().copied().min_by(|a, b| {
        let da = squared_distance(&a.image, image);
        let db = squared_distance(&b.image, image);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn squared_distance(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone)]
/// A data source that generates images around a random prototype per class.
///
/// Task `t` introduces the classes `t * classes_per_task .. (t + 1) * classes_per_task`; client
/// `i` sees `labels_per_client` of them, starting at offset `i`. The generation is deterministic
/// for a given seed.
pub struct SyntheticSource {
    settings: DataSettings,
    image: ImageShape,
}

impl SyntheticSource {
    pub fn new(settings: DataSettings, image: ImageShape) -> Self {
        Self { settings, image }
    }

    /// Gets the labels a client sees in a task.
    pub fn labels(&self, client: ClientId, task: usize) -> Vec<Label> {
        let per_task = self.settings.classes_per_task;
        let mut labels: Vec<Label> = (0..self.settings.labels_per_client)
            .map(|k| task * per_task + (client + k) % per_task)
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    fn prototype(&self, label: Label) -> Array1<f32> {
        let seed = self.settings.seed ^ (label as u64).wrapping_mul(0x9e37_79b9);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array1::from_shape_fn(self.image.len(), |_| rng.gen_range(0.0..1.0))
    }

    fn samples<R: Rng>(&self, label: Label, count: usize, rng: &mut R) -> Vec<Sample> {
        let prototype = self.prototype(label);
        // validated settings never carry a negative deviation
        let noise = Normal::new(0_f32, self.settings.noise).ok();
        (0..count)
            .map(|_| Sample {
                image: prototype.mapv(|v| {
                    let offset = noise.as_ref().map_or(0., |n| n.sample(rng));
                    (v + offset).clamp(0., 1.)
                }),
                label,
            })
            .collect()
    }
}

impl TaskDataSource for SyntheticSource {
    fn task_count(&self, _client: ClientId) -> usize {
        self.settings.num_tasks
    }

    fn read_client_data(
        &self,
        client: ClientId,
        task: usize,
    ) -> Result<ClientTaskData, DataError> {
        if client >= self.settings.num_clients {
            return Err(DataError::UnknownClient(client));
        }
        if task >= self.settings.num_tasks {
            return Err(DataError::UnknownTask { client, task });
        }
        let seed = self.settings.seed ^ ((client as u64) << 32) ^ (task as u64 + 1);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut test = Vec::new();
        for label in self.labels(client, task) {
            train.extend(self.samples(label, self.settings.train_per_class, &mut rng));
            test.extend(self.samples(label, self.settings.test_per_class, &mut rng));
        }
        let label_info = LabelInfo::count(&train);
        Ok(ClientTaskData {
            id: client,
            train,
            test,
            label_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DataSettings {
        DataSettings {
            num_clients: 3,
            num_tasks: 2,
            classes_per_task: 2,
            labels_per_client: 1,
            train_per_class: 4,
            test_per_class: 2,
            noise: 0.05,
            seed: 17,
        }
    }

    fn image() -> ImageShape {
        ImageShape {
            channels: 1,
            height: 2,
            width: 2,
        }
    }

    #[test]
    fn test_labels_are_task_local() {
        let source = SyntheticSource::new(settings(), image());
        assert_eq!(source.labels(0, 0), vec![0]);
        assert_eq!(source.labels(1, 0), vec![1]);
        assert_eq!(source.labels(2, 0), vec![0]);
        assert_eq!(source.labels(1, 1), vec![3]);
    }

    #[test]
    fn test_read_client_data() {
        let source = SyntheticSource::new(settings(), image());
        let data = source.read_client_data(1, 1).unwrap();
        assert_eq!(data.id, 1);
        assert_eq!(data.train.len(), 4);
        assert_eq!(data.test.len(), 2);
        assert_eq!(data.label_info.labels, vec![3]);
        assert_eq!(data.label_info.counts.get(&3), Some(&4));
        assert!(data
            .train
            .iter()
            .all(|s| s.image.len() == 4 && s.image.iter().all(|v| (0. ..=1.).contains(v))));
        assert_eq!(source.read_client_data(1, 1).unwrap(), data);
    }

    #[test]
    fn test_read_client_data_out_of_range() {
        let source = SyntheticSource::new(settings(), image());
        assert_eq!(
            source.read_client_data(3, 0),
            Err(DataError::UnknownClient(3))
        );
        assert_eq!(
            source.read_client_data(0, 2),
            Err(DataError::UnknownTask { client: 0, task: 2 })
        );
    }

    #[test]
    fn test_stack_and_closest() {
        let samples = vec![
            Sample {
                image: Array1::from(vec![0., 0., 0., 0.]),
                label: 0,
            },
            Sample {
                image: Array1::from(vec![1., 1., 1., 1.]),
                label: 0,
            },
        ];
        let batch = stack(&samples, image());
        assert_eq!(batch.shape(), &[2, 4]);
        let mean = mean_image(&samples, image());
        assert_eq!(mean, Array1::from(vec![0.5; 4]));
        let refs: Vec<&Sample> = samples.iter().collect();
        let target = Array1::from(vec![0.9; 4]);
        assert_eq!(closest_to(&refs, &target), Some(&samples[1]));
    }
}
