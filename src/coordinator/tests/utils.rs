use std::sync::Arc;

use ndarray::{Array1, IxDyn};
use tracing_subscriber::*;

use crate::{
    client::{Client, ClientError, ClientId, ClientState, Metrics, ReferenceModels, TaskPhase},
    coordinator::{events::EventSubscriber, Coordinator},
    data::{ClientTaskData, DataError, LabelInfo, Sample, TaskDataSource},
    model::{GradientSnapshot, NetworkShape, Perceptron, Weights},
    reconstruction::Reconstructor,
    settings::{FederatedSettings, ImageShape, MonitorSettings, ReconstructionSettings},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn image() -> ImageShape {
    ImageShape {
        channels: 1,
        height: 2,
        width: 2,
    }
}

pub fn network_shape() -> NetworkShape {
    NetworkShape {
        input: 4,
        hidden: 3,
        classes: 3,
    }
}

/// A network that predicts `class` for every input.
pub fn constant_classifier(class: usize) -> Weights {
    let mut layers = Perceptron::zeros(network_shape()).to_weights().layers().to_vec();
    if let Some(bias) = layers.last_mut() {
        bias[IxDyn(&[class])] = 1.;
    }
    layers.into()
}

pub fn encoder() -> Arc<Perceptron> {
    Arc::new(Perceptron::weights_init(network_shape(), 7))
}

pub fn federated_settings(global_rounds: usize) -> FederatedSettings {
    FederatedSettings {
        dataset: "scripted".into(),
        num_clients: 3,
        num_classes: 3,
        join_ratio: 1.,
        random_join_ratio: false,
        global_rounds,
        eval_gap: 1,
        auto_break: false,
        top_cnt: None,
        div_value: None,
        seed: 0,
    }
}

pub fn reconstruction_settings() -> ReconstructionSettings {
    ReconstructionSettings {
        iterations: 3,
        num_image: 2,
        learning_rate: 0.1,
        max_iter: 2,
        history_size: 5,
        tolerance_grad: 1e-7,
        tolerance_change: 1e-9,
        encoder_hidden: 3,
        encoder_seed: 7,
        seed: 0,
        parallel: false,
    }
}

pub fn monitor_settings() -> MonitorSettings {
    MonitorSettings { batch_size: 4 }
}

/// The partition of a client holding one test sample per label.
pub fn partition(id: ClientId, labels: &[usize]) -> ClientTaskData {
    let samples: Vec<Sample> = labels
        .iter()
        .map(|&label| Sample {
            image: Array1::from_elem(image().len(), 0.5),
            label,
        })
        .collect();
    ClientTaskData {
        id,
        label_info: LabelInfo::count(&samples),
        train: samples.clone(),
        test: samples,
    }
}

/// A client with a fixed model that shares one label 0 gradient in a scripted global round.
pub struct ScriptedClient {
    pub id: ClientId,
    pub state: ClientState,
    pub weights: Arc<Weights>,
    pub share_at: Option<u64>,
    pub encoder: Arc<Perceptron>,
    pub last_round: Option<u64>,
    pub phases: Vec<(usize, TaskPhase)>,
    /// Whether the previous and the current reference model were available, per round.
    pub references: Vec<(u64, bool, bool)>,
    pub received: usize,
}

impl ScriptedClient {
    pub fn new(id: ClientId, share_at: Option<u64>) -> Self {
        Self {
            id,
            state: ClientState::new(&[id]),
            weights: Arc::new(Perceptron::weights_init(network_shape(), id as u64).to_weights()),
            share_at,
            encoder: encoder(),
            last_round: None,
            phases: Vec::new(),
            references: Vec::new(),
            received: 0,
        }
    }
}

impl Client for ScriptedClient {
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
        self.id + 1
    }

    fn weights(&self) -> Arc<Weights> {
        Arc::clone(&self.weights)
    }

    fn set_parameters(&mut self, _global: &Weights) -> Result<(), ClientError> {
        self.received += 1;
        Ok(())
    }

    fn next_task(&mut self, data: ClientTaskData) -> Result<(), ClientError> {
        if data.id != self.id {
            return Err(ClientError::ForeignData {
                client: self.id,
                received: data.id,
            });
        }
        self.state.advance(&data.label_info.labels);
        Ok(())
    }

    fn before_train(&mut self, task: usize, phase: TaskPhase) {
        self.phases.push((task, phase));
    }

    fn update_new_set(&mut self) {}

    fn train(&mut self, global_round: u64, reference: &ReferenceModels) -> Result<(), ClientError> {
        self.last_round = Some(global_round);
        self.references.push((
            global_round,
            reference.previous.is_some(),
            reference.current.is_some(),
        ));
        Ok(())
    }

    fn proto_grad_sharing(&mut self) -> Result<Option<Vec<GradientSnapshot>>, ClientError> {
        if self.share_at.is_none() || self.last_round != self.share_at {
            return Ok(None);
        }
        let x = Array1::from_elem(image().len(), 0.5);
        Ok(Some(vec![self.encoder.sample_gradient(x.view(), 0)]))
    }

    fn test_metrics(&self) -> Metrics {
        Metrics {
            correct: 1,
            samples: 2,
            loss_sum: 1.,
        }
    }

    fn train_metrics(&self) -> Metrics {
        Metrics {
            correct: 2,
            samples: 2,
            loss_sum: 0.5,
        }
    }
}

/// A data source handing every client one new label per task.
pub struct ScriptedSource {
    pub tasks: usize,
}

impl TaskDataSource for ScriptedSource {
    fn task_count(&self, _client: ClientId) -> usize {
        self.tasks
    }

    fn read_client_data(&self, client: ClientId, task: usize) -> Result<ClientTaskData, DataError> {
        if task >= self.tasks {
            return Err(DataError::UnknownTask { client, task });
        }
        Ok(partition(client, &[10 * task + client]))
    }
}

pub fn reconstructor() -> Reconstructor {
    Reconstructor::new(reconstruction_settings(), encoder(), image()).unwrap()
}

/// A coordinator over three scripted clients, of which only `sharer` shares a gradient, in
/// global round `share_at`.
pub fn new_coordinator<D: TaskDataSource>(
    settings: FederatedSettings,
    source: D,
    sharer: ClientId,
    share_at: u64,
) -> (Coordinator<ScriptedClient, D>, EventSubscriber) {
    let clients = (0..settings.num_clients)
        .map(|id| ScriptedClient::new(id, (id == sharer).then(|| share_at)))
        .collect();
    let global = Perceptron::weights_init(network_shape(), 42);
    Coordinator::new(
        settings,
        monitor_settings(),
        reconstructor(),
        global,
        clients,
        source,
    )
    .unwrap()
}
