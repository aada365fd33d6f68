//! The coordinator.
//!
//! The [`Coordinator`] drives the clients through the task sequence and, within every task,
//! through `global_rounds` communication rounds. A round selects participants, broadcasts the
//! global model, trains the participants locally, aggregates their weights and feeds the
//! gradients they shared to the reconstruction. The reconstructed images form the monitor set on
//! which the [`PromotionGate`] decides whether the new global model becomes the best model.
//!
//! ```text
//!  task 0 .. N_TASKS
//!  +-------------+     +-----------------------------------------------------------------+
//!  | begin_task  | --> | round 0 .. global_rounds                                        |
//!  +-------------+     |  select -> send -> evaluate -> train -> aggregate -> dataloader |
//!                      +-----------------------------------------------------------------+
//! ```
//!
//! The coordinator publishes its current phase and every promoted model through an
//! [`EventPublisher`], so that observers can follow a run without borrowing the coordinator.

pub mod aggregation;
pub mod convergence;
pub mod events;
pub mod round;
pub mod selection;

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

pub use self::round::RoundReport;
use self::{
    convergence::check_done,
    events::{EventPublisher, EventSubscriber, ModelUpdate, PhaseName},
    selection::{RandomSelector, Selector},
};
use crate::{
    client::{Client, ClientError, ClientId, ReferenceModels},
    data::{DataError, TaskDataSource},
    model::{ModelArena, ModelError, Perceptron, Weights},
    monitor::{MonitorError, MonitorLoader, PromotionGate},
    reconstruction::{ReconstructionBuffer, ReconstructionError, Reconstructor},
    registry::LabelRegistry,
    settings::{FederatedSettings, MonitorSettings, IMAGENET1K, IMAGENET1K_TASKS},
};

#[derive(Error, Debug)]
/// Errors that abort a training run.
pub enum CoordinatorError {
    #[error("client failure: {0}")]
    Client(#[from] ClientError),
    #[error("data failure: {0}")]
    Data(#[from] DataError),
    #[error("reconstruction failure: {0}")]
    Reconstruction(#[from] ReconstructionError),
    #[error("invalid monitor set: {0}")]
    Monitor(#[from] MonitorError),
    #[error("invalid global model: {0}")]
    Model(#[from] ModelError),
    #[error("the federation has no clients")]
    NoClients,
}

/// Computes the index of a round across all tasks.
pub fn global_round_index(round: usize, global_rounds: usize, task: usize) -> u64 {
    (round + global_rounds * task) as u64
}

#[derive(Debug, Clone, PartialEq)]
/// The outcome of a training run.
pub struct TrainingSummary {
    /// The number of tasks the run went through.
    pub tasks: usize,
    /// The number of rounds the run went through.
    pub rounds: usize,
    /// The best global test accuracy of all evaluations.
    pub best_test_accuracy: Option<f64>,
    /// The mean wall-clock cost of a round, without the first round.
    pub mean_round_cost: Option<Duration>,
    /// The number of rounds in which images were reconstructed.
    pub reconstructions: usize,
    /// The number of promoted models.
    pub promotions: usize,
    /// The final best monitor score.
    pub best_score: f64,
}

/// The coordinator of a federated class-incremental training run.
pub struct Coordinator<C, D> {
    settings: FederatedSettings,
    monitor_settings: MonitorSettings,
    /// The global model.
    global: Perceptron,
    /// The snapshot of the global model, shared with the arena on promotion.
    global_weights: Arc<Weights>,
    /// The snapshots the promotion gate refers to.
    arena: ModelArena,
    clients: Vec<C>,
    source: D,
    registry: LabelRegistry,
    selector: Box<dyn Selector + Send>,
    reconstructor: Reconstructor,
    buffer: ReconstructionBuffer,
    loader: Option<MonitorLoader>,
    gate: PromotionGate,
    /// The clients that already trained in the current task.
    trained_this_task: BTreeSet<ClientId>,
    rs_test_acc: Vec<f64>,
    rs_train_loss: Vec<f64>,
    budget: Vec<Duration>,
    history: Vec<RoundReport>,
    reconstructions: usize,
    promotions: usize,
    events: EventPublisher,
    shutdown: Arc<AtomicBool>,
}

impl<C, D> Coordinator<C, D>
where
    C: Client,
    D: TaskDataSource,
{
    /// Creates a coordinator over clients that hold the partitions of the first task.
    ///
    /// # Errors
    /// Fails if there are no clients.
    pub fn new(
        settings: FederatedSettings,
        monitor_settings: MonitorSettings,
        reconstructor: Reconstructor,
        global: Perceptron,
        clients: Vec<C>,
        source: D,
    ) -> Result<(Self, EventSubscriber), CoordinatorError> {
        if clients.is_empty() {
            return Err(CoordinatorError::NoClients);
        }
        let (events, subscriber) = EventPublisher::init(0, PhaseName::Idle, ModelUpdate::Invalidate);
        let selector = Box::new(RandomSelector::from(&settings));
        let global_weights = Arc::new(global.to_weights());
        let coordinator = Self {
            settings,
            monitor_settings,
            global,
            global_weights,
            arena: ModelArena::new(),
            clients,
            source,
            registry: LabelRegistry::new(),
            selector,
            reconstructor,
            buffer: ReconstructionBuffer::default(),
            loader: None,
            gate: PromotionGate::new(),
            trained_this_task: BTreeSet::new(),
            rs_test_acc: Vec::new(),
            rs_train_loss: Vec::new(),
            budget: Vec::new(),
            history: Vec::new(),
            reconstructions: 0,
            promotions: 0,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        Ok((coordinator, subscriber))
    }

    /// Replaces the client selection strategy.
    pub fn with_selector(mut self, selector: impl Selector + Send + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    /// Gets a handle that stops the run before the next round once it is set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Gets the number of tasks of the run.
    pub fn task_count(&self) -> usize {
        if self.settings.dataset == IMAGENET1K {
            IMAGENET1K_TASKS
        } else {
            self.clients
                .first()
                .map_or(0, |client| self.source.task_count(client.id()))
        }
    }

    /// Runs every round of every task.
    ///
    /// # Errors
    /// Fails on the first client, data, reconstruction or aggregation failure.
    pub fn train(&mut self) -> Result<TrainingSummary, CoordinatorError> {
        let tasks = self.task_count();
        info!(
            "starting a run of {} tasks with {} clients",
            tasks,
            self.clients.len()
        );
        let mut tasks_run = 0;
        'tasks: for task in 0..tasks {
            let _task_guard = info_span!("task", task).entered();
            self.begin_task(task)?;
            tasks_run += 1;

            for round in 0..self.settings.global_rounds {
                if self.shutdown.load(Ordering::SeqCst) {
                    warn!("shutdown requested, stopping before round {}", round);
                    break 'tasks;
                }
                let _round_guard = info_span!("round", round).entered();
                let report = self.run_round(task, round)?;
                self.history.push(report);

                if self.settings.auto_break
                    && check_done(
                        &[self.rs_test_acc.as_slice()],
                        self.settings.top_cnt,
                        self.settings.div_value,
                    )
                {
                    info!("test accuracy converged after round {}", round);
                    break;
                }
            }
        }
        self.events.broadcast_phase(PhaseName::Shutdown);

        let summary = self.summary(tasks_run);
        info!("best accuracy: {:?}", summary.best_test_accuracy);
        info!("average time cost per round: {:?}", summary.mean_round_cost);
        Ok(summary)
    }

    /// Moves every client to the given task and refreshes the label bookkeeping.
    ///
    /// The first task keeps the partitions the clients were created with.
    ///
    /// # Errors
    /// Fails if the data source has no partition for a client or a client rejects it.
    pub fn begin_task(&mut self, task: usize) -> Result<(), CoordinatorError> {
        self.events.broadcast_phase(PhaseName::Task);
        let previous = self
            .clients
            .first()
            .map(|client| client.state().available_labels.clone())
            .unwrap_or_default();

        if task > 0 {
            for client in self.clients.iter_mut() {
                let data = self.source.read_client_data(client.id(), task)?;
                client.next_task(data)?;
            }
        }

        let available = self.registry.record_task(
            task,
            self.clients.iter().map(|client| {
                let state = client.state();
                (state.classes_so_far.as_slice(), state.current_labels.as_slice())
            }),
            &previous,
        );
        let task_dict = self.registry.task_dict().clone();
        for client in self.clients.iter_mut() {
            let state = client.state_mut();
            state.set_available_labels(&available);
            let task_id = state.assign_task_id(&task_dict);
            debug!("client {} resolved task id {}", client.id(), task_id);
        }
        self.trained_this_task.clear();
        info!(
            "task {}: {} labels available, {} introduced",
            task,
            available.all.len(),
            self.registry
                .record(task)
                .map_or(0, |record| record.introduced().len())
        );
        Ok(())
    }

    /// Gets the reference model pair handed to the clients.
    pub fn model_back(&self) -> ReferenceModels {
        ReferenceModels {
            previous: self.gate.reference().and_then(|v| self.arena.get(v)),
            current: self.gate.best().and_then(|v| self.arena.get(v)),
        }
    }

    /// Gets the clients.
    pub fn clients(&self) -> &[C] {
        &self.clients
    }

    /// Gets the label registry.
    pub fn registry(&self) -> &LabelRegistry {
        &self.registry
    }

    /// Gets the promotion gate.
    pub fn gate(&self) -> &PromotionGate {
        &self.gate
    }

    /// Gets the current reconstruction buffer.
    pub fn buffer(&self) -> &ReconstructionBuffer {
        &self.buffer
    }

    /// Gets the global model.
    pub fn global(&self) -> &Perceptron {
        &self.global
    }

    /// Gets the reports of the rounds run so far.
    pub fn history(&self) -> &[RoundReport] {
        &self.history
    }

    /// Gets the recorded global test accuracies.
    pub fn rs_test_acc(&self) -> &[f64] {
        &self.rs_test_acc
    }

    /// Gets the recorded global train losses.
    pub fn rs_train_loss(&self) -> &[f64] {
        &self.rs_train_loss
    }

    fn summary(&self, tasks: usize) -> TrainingSummary {
        let costs = self.budget.get(1..).unwrap_or_default();
        let mean_round_cost = (!costs.is_empty())
            .then(|| costs.iter().sum::<Duration>() / costs.len() as u32);
        TrainingSummary {
            tasks,
            rounds: self.history.len(),
            best_test_accuracy: self.rs_test_acc.iter().copied().reduce(f64::max),
            mean_round_cost,
            reconstructions: self.reconstructions,
            promotions: self.promotions,
            best_score: self.gate.best_score(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;
