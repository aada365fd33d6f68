//! Clients of the federation.
//!
//! The coordinator drives clients through the [`Client`] trait. Every client owns a
//! [`ClientState`] with its label bookkeeping, which the coordinator reads and updates at every
//! task transition. [`LocalClient`] is the in-process reference implementation.

pub mod local;

use std::{collections::BTreeSet, sync::Arc};

use derive_more::Display;
use thiserror::Error;

pub use self::local::LocalClient;
use crate::{
    data::{ClientTaskData, Label},
    model::{GradientSnapshot, ModelError, Weights},
    registry::{AvailableLabels, TaskDict, TaskId},
};

/// The identifier of a client.
pub type ClientId = usize;

#[derive(Error, Debug)]
/// Errors related to client operations.
pub enum ClientError {
    #[error("invalid model: {0}")]
    Model(#[from] ModelError),
    #[error("client {client} received data of client {received}")]
    ForeignData { client: ClientId, received: ClientId },
    #[error("sample of length {actual} does not fit an input of length {expected}")]
    InputLength { expected: usize, actual: usize },
    #[error("label {label} is out of the range of {classes} classes")]
    LabelOutOfRange { label: Label, classes: usize },
}

/// Whether a selected client already took part in the current task.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// The client already trained in this task.
    #[display(fmt = "resumed")]
    Resumed,
    /// The client trains for the first time in this task.
    #[display(fmt = "new")]
    New,
}

/// The pair of best global models handed to the clients as the reference of their local
/// training.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceModels {
    /// The previous best model.
    pub previous: Option<Arc<Weights>>,
    /// The current best model.
    pub current: Option<Arc<Weights>>,
}

impl ReferenceModels {
    /// Iterates over the available reference models.
    pub fn available(&self) -> impl Iterator<Item = &Arc<Weights>> {
        self.previous.iter().chain(self.current.iter())
    }
}

/// The label bookkeeping of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    /// Every label the client has seen, in order of appearance.
    pub classes_so_far: Vec<Label>,
    /// The labels of the current task.
    pub current_labels: Vec<Label>,
    /// The labels seen before the current task.
    pub classes_past_task: Vec<Label>,
    /// The labels any client has seen so far.
    pub available_labels: BTreeSet<Label>,
    /// The labels any client had seen before the current task.
    pub available_labels_past: BTreeSet<Label>,
    /// The labels any client holds in the current task.
    pub available_labels_current: BTreeSet<Label>,
    /// The index of the current task.
    pub current_task: usize,
    /// The labels of every task, by task index.
    pub task_history: Vec<Vec<Label>>,
    /// The identifier of the current task signature.
    pub task_id: TaskId,
}

impl ClientState {
    /// Creates the state of a client starting with the given labels.
    pub fn new(labels: &[Label]) -> Self {
        Self {
            classes_so_far: labels.to_vec(),
            current_labels: labels.to_vec(),
            task_history: vec![labels.to_vec()],
            ..Self::default()
        }
    }

    /// Moves on to the next task, which introduces the given labels.
    pub fn advance(&mut self, labels: &[Label]) {
        self.classes_past_task = self.classes_so_far.clone();
        self.current_task += 1;
        self.classes_so_far.extend_from_slice(labels);
        self.task_history.push(labels.to_vec());
        self.current_labels = labels.to_vec();
    }

    /// Gets the distinct labels seen so far.
    pub fn classes_seen(&self) -> BTreeSet<Label> {
        self.classes_so_far.iter().copied().collect()
    }

    /// Takes over the label sets broadcast by the coordinator.
    pub fn set_available_labels(&mut self, available: &AvailableLabels) {
        self.available_labels = available.all.clone();
        self.available_labels_current = available.current.clone();
        self.available_labels_past = available.past.clone();
    }

    /// Resolves and stores the identifier of the current task signature.
    pub fn assign_task_id(&mut self, task_dict: &TaskDict) -> TaskId {
        self.task_id = task_dict.resolve(&self.current_labels);
        self.task_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Evaluation counters of a client.
pub struct Metrics {
    /// The number of correct top-1 predictions.
    pub correct: usize,
    /// The number of evaluated samples.
    pub samples: usize,
    /// The summed cross-entropy loss.
    pub loss_sum: f64,
}

impl std::ops::Add for Metrics {
    type Output = Metrics;

    fn add(self, other: Metrics) -> Metrics {
        Metrics {
            correct: self.correct + other.correct,
            samples: self.samples + other.samples,
            loss_sum: self.loss_sum + other.loss_sum,
        }
    }
}

impl Metrics {
    /// Gets the share of correct predictions, if any sample was evaluated.
    pub fn accuracy(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.correct as f64 / self.samples as f64)
    }

    /// Gets the mean loss, if any sample was evaluated.
    pub fn mean_loss(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.loss_sum / self.samples as f64)
    }
}

/// A client of the federation as seen by the coordinator.
pub trait Client {
    /// Gets the identifier of the client.
    fn id(&self) -> ClientId;

    /// Gets the label bookkeeping.
    fn state(&self) -> &ClientState;

    /// Gets the label bookkeeping for an update by the coordinator.
    fn state_mut(&mut self) -> &mut ClientState;

    /// Gets the number of samples the client trains on.
    fn train_samples(&self) -> usize;

    /// Takes a snapshot of the local model.
    fn weights(&self) -> Arc<Weights>;

    /// Replaces the local model with the global model.
    ///
    /// # Errors
    /// Fails if the global model does not fit the local network.
    fn set_parameters(&mut self, global: &Weights) -> Result<(), ClientError>;

    /// Swaps in the partition of the next task and updates the label bookkeeping.
    ///
    /// # Errors
    /// Fails if the partition belongs to another client or does not fit the local network.
    fn next_task(&mut self, data: ClientTaskData) -> Result<(), ClientError>;

    /// Prepares the client for training in the given task.
    fn before_train(&mut self, task: usize, phase: TaskPhase);

    /// Refreshes the local replay memory.
    fn update_new_set(&mut self);

    /// Runs the local training of a global round.
    ///
    /// # Errors
    /// Fails if a reference model does not fit the local network.
    fn train(&mut self, global_round: u64, reference: &ReferenceModels) -> Result<(), ClientError>;

    /// Gets the gradient snapshots the client shares this round, if any.
    ///
    /// # Errors
    /// Fails if the gradients cannot be computed.
    fn proto_grad_sharing(&mut self) -> Result<Option<Vec<GradientSnapshot>>, ClientError>;

    /// Evaluates the local model on the test partition.
    fn test_metrics(&self) -> Metrics;

    /// Evaluates the local model on the train partition.
    fn train_metrics(&self) -> Metrics;
}
