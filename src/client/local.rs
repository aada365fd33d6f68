//! An in-process client training the perceptron on its task partitions.

use std::{collections::BTreeMap, sync::Arc};

use ndarray::Array2;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    client::{Client, ClientError, ClientId, ClientState, Metrics, ReferenceModels, TaskPhase},
    data::{self, ClientTaskData, Label, Sample},
    model::{
        network::{argmax, softmax_rows, Distillation},
        GradientSnapshot,
        NetworkShape,
        Perceptron,
        Weights,
    },
    settings::{ClientSettings, ImageShape},
};

/// A client holding its partitions and a replay memory of exemplars of finished tasks.
pub struct LocalClient {
    id: ClientId,
    settings: ClientSettings,
    image: ImageShape,
    model: Perceptron,
    encoder: Arc<Perceptron>,
    learning_rate: f32,
    train: Vec<Sample>,
    test: Vec<Sample>,
    /// The train partition of the finished task, until it is condensed into exemplars.
    finished: Vec<Sample>,
    exemplars: BTreeMap<Label, Vec<Sample>>,
    state: ClientState,
    task: Option<usize>,
    signal: bool,
    share_pending: bool,
    last_copy: Option<Arc<Weights>>,
    rng: ChaCha8Rng,
}

impl LocalClient {
    /// Creates a client holding the partition of the first task.
    ///
    /// The encoder is the frozen network the shared gradients are computed on; it must be the
    /// one the coordinator reconstructs with.
    ///
    /// # Errors
    /// Fails if a sample of the partition does not fit the network.
    pub fn new(
        data: ClientTaskData,
        settings: ClientSettings,
        shape: NetworkShape,
        image: ImageShape,
        encoder: Arc<Perceptron>,
    ) -> Result<Self, ClientError> {
        check_partition(shape, &data)?;
        Ok(Self {
            id: data.id,
            settings,
            image,
            model: Perceptron::zeros(shape),
            encoder,
            learning_rate: settings.learning_rate,
            state: ClientState::new(&data.label_info.labels),
            train: data.train,
            test: data.test,
            finished: Vec::new(),
            exemplars: BTreeMap::new(),
            task: None,
            signal: false,
            share_pending: false,
            last_copy: None,
            rng: ChaCha8Rng::seed_from_u64(data.id as u64),
        })
    }

    /// Gets the snapshot of the local model taken at the latest task transition.
    pub fn last_copy(&self) -> Option<&Arc<Weights>> {
        self.last_copy.as_ref()
    }

    /// Gets the number of exemplars kept per class.
    pub fn exemplar_counts(&self) -> BTreeMap<Label, usize> {
        self.exemplars
            .iter()
            .map(|(label, samples)| (*label, samples.len()))
            .collect()
    }

    /// Gets the current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Computes the mean softmax of the reference models, if the distillation applies.
    fn distillation_targets(
        &self,
        references: &[Perceptron],
        x: &Array2<f32>,
    ) -> Option<Array2<f32>> {
        if references.is_empty() || self.settings.kd_weight <= 0. {
            return None;
        }
        let mut targets = Array2::<f32>::zeros((x.nrows(), self.model.shape().classes));
        for reference in references {
            targets += &reference.probabilities(x.view(), self.settings.temperature);
        }
        targets /= references.len() as f32;
        Some(targets)
    }

    fn evaluate(&self, samples: &[Sample]) -> Metrics {
        if samples.is_empty() {
            return Metrics::default();
        }
        let x = data::stack(samples, self.image);
        let mut p = self.model.forward(x.view());
        softmax_rows(&mut p);
        let mut metrics = Metrics {
            samples: samples.len(),
            ..Metrics::default()
        };
        for (row, sample) in p.rows().into_iter().zip(samples) {
            if argmax(row) == sample.label {
                metrics.correct += 1;
            }
            metrics.loss_sum -= f64::from(row[sample.label].max(f32::MIN_POSITIVE).ln());
        }
        metrics
    }
}

/// Checks that every sample of a partition fits the input and the classes of a network.
fn check_partition(shape: NetworkShape, data: &ClientTaskData) -> Result<(), ClientError> {
    for sample in data.train.iter().chain(&data.test) {
        if sample.image.len() != shape.input {
            return Err(ClientError::InputLength {
                expected: shape.input,
                actual: sample.image.len(),
            });
        }
        if sample.label >= shape.classes {
            return Err(ClientError::LabelOutOfRange {
                label: sample.label,
                classes: shape.classes,
            });
        }
    }
    Ok(())
}

impl Client for LocalClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn state(&self) -> &ClientState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ClientState {
        &mut self.state
    }

    fn train_samples(&self) -> usize {
        self.train.len() + self.exemplars.values().map(Vec::len).sum::<usize>()
    }

    fn weights(&self) -> Arc<Weights> {
        Arc::new(self.model.to_weights())
    }

    fn set_parameters(&mut self, global: &Weights) -> Result<(), ClientError> {
        self.model = Perceptron::from_weights(self.model.shape(), global)?;
        Ok(())
    }

    fn next_task(&mut self, data: ClientTaskData) -> Result<(), ClientError> {
        if data.id != self.id {
            return Err(ClientError::ForeignData {
                client: self.id,
                received: data.id,
            });
        }
        check_partition(self.model.shape(), &data)?;
        self.last_copy = Some(self.weights());
        self.finished = std::mem::replace(&mut self.train, data.train);
        self.test = data.test;
        self.state.advance(&data.label_info.labels);
        debug!(
            "client {} moved to task {} with labels {:?}",
            self.id, self.state.current_task, self.state.current_labels
        );
        Ok(())
    }

    fn before_train(&mut self, task: usize, phase: TaskPhase) {
        if self.task != Some(task) {
            self.task = Some(task);
            if phase == TaskPhase::New {
                self.signal = true;
                self.share_pending = true;
            }
        }
    }

    fn update_new_set(&mut self) {
        if !self.signal {
            return;
        }
        self.signal = false;
        if self.state.classes_past_task.is_empty() || self.finished.is_empty() {
            return;
        }

        let finished = std::mem::take(&mut self.finished);
        let mut by_label: BTreeMap<Label, Vec<&Sample>> = BTreeMap::new();
        for sample in &finished {
            by_label.entry(sample.label).or_default().push(sample);
        }
        let classes = by_label
            .keys()
            .chain(self.exemplars.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        let per_class = self.settings.memory_num / classes.max(1);

        for (label, mut samples) in by_label {
            let mean = data::mean_image(samples.iter().copied(), self.image);
            let mut chosen = Vec::with_capacity(per_class);
            while chosen.len() < per_class {
                match data::closest_to(&samples, &mean) {
                    Some(sample) => {
                        chosen.push(sample.clone());
                        samples.retain(|s| !std::ptr::eq(*s, sample));
                    }
                    None => break,
                }
            }
            self.exemplars.insert(label, chosen);
        }
        for samples in self.exemplars.values_mut() {
            samples.truncate(per_class);
        }
        debug!(
            "client {} keeps {} exemplars per class of {} classes",
            self.id, per_class, classes
        );
    }

    fn train(&mut self, global_round: u64, reference: &ReferenceModels) -> Result<(), ClientError> {
        let shape = self.model.shape();
        let references = if self.state.classes_past_task.is_empty() {
            Vec::new()
        } else {
            reference
                .available()
                .map(|weights| Perceptron::from_weights(shape, weights))
                .collect::<Result<Vec<_>, _>>()?
        };

        let set: Vec<&Sample> = self
            .train
            .iter()
            .chain(self.exemplars.values().flatten())
            .collect();
        let mut indices: Vec<usize> = (0..set.len()).collect();
        let mut loss_sum = 0.;
        let mut batches = 0;
        for _ in 0..self.settings.local_epochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(self.settings.batch_size) {
                let batch: Vec<&Sample> = chunk.iter().map(|&i| set[i]).collect();
                let x = data::stack(batch.iter().copied(), self.image);
                let labels: Vec<Label> = batch.iter().map(|s| s.label).collect();
                let targets = self.distillation_targets(&references, &x);
                let distillation = targets.as_ref().map(|targets| Distillation {
                    targets: targets.view(),
                    weight: self.settings.kd_weight,
                    temperature: self.settings.temperature,
                });
                let (loss, grads) = self.model.batch_gradient(x.view(), &labels, distillation);
                self.model.apply_gradients(&grads, self.learning_rate);
                loss_sum += loss;
                batches += 1;
            }
        }
        if self.settings.learning_rate_decay {
            self.learning_rate *= self.settings.learning_rate_decay_gamma;
        }
        debug!(
            "client {} trained in round {}: mean batch loss {:.4}",
            self.id,
            global_round,
            loss_sum / batches.max(1) as f32
        );
        Ok(())
    }

    fn proto_grad_sharing(&mut self) -> Result<Option<Vec<GradientSnapshot>>, ClientError> {
        if !self.share_pending {
            return Ok(None);
        }
        self.share_pending = false;

        let expected = self.encoder.shape().input;
        let mut grads = Vec::new();
        for &label in &self.state.current_labels {
            let samples: Vec<&Sample> = self.train.iter().filter(|s| s.label == label).collect();
            let mean = data::mean_image(samples.iter().copied(), self.image);
            if let Some(proto) = data::closest_to(&samples, &mean) {
                if proto.image.len() != expected {
                    return Err(ClientError::InputLength {
                        expected,
                        actual: proto.image.len(),
                    });
                }
                grads.push(self.encoder.sample_gradient(proto.image.view(), label));
            }
        }
        Ok((!grads.is_empty()).then(|| grads))
    }

    fn test_metrics(&self) -> Metrics {
        self.evaluate(&self.test)
    }

    fn train_metrics(&self) -> Metrics {
        self.evaluate(&self.train)
    }
}
