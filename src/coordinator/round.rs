//! The round executor and the monitor step that closes every round.

use std::{sync::Arc, time::Instant};

use crate::{
    client::{Client, ClientId, Metrics, TaskPhase},
    coordinator::{
        aggregation::federated_average,
        events::{ModelUpdate, PhaseName},
        global_round_index,
        Coordinator,
        CoordinatorError,
    },
    data::TaskDataSource,
    model::{GradientSnapshot, ModelVersion, Perceptron, Weights},
    monitor::{monitor, MonitorLoader, MonitorSet, PromotionResult},
    reconstruction::predict_labels,
};

#[derive(Debug, Clone, PartialEq)]
/// What happened in one round.
pub struct RoundReport {
    /// The task of the round.
    pub task: usize,
    /// The index of the round within its task.
    pub round: usize,
    /// The index of the round across all tasks.
    pub glob_iter: u64,
    /// The clients that trained in the round.
    pub participants: Vec<ClientId>,
    /// The number of gradients the participants shared.
    pub pooled: usize,
    /// The decision of the promotion gate.
    pub promotion: PromotionResult,
    /// The wall-clock cost of the round.
    pub cost: std::time::Duration,
}

impl<C, D> Coordinator<C, D>
where
    C: Client,
    D: TaskDataSource,
{
    /// Runs one communication round.
    ///
    /// # Errors
    /// Fails if a client fails, if the uploaded weights cannot be aggregated or if the shared
    /// gradients cannot be reconstructed.
    pub fn run_round(&mut self, task: usize, round: usize) -> Result<RoundReport, CoordinatorError> {
        let start = Instant::now();
        let glob_iter = global_round_index(round, self.settings.global_rounds, task);
        self.events.set_round_id(glob_iter);
        self.events.broadcast_phase(PhaseName::Train);

        let model_old = self.model_back();
        let ids: Vec<ClientId> = self.clients.iter().map(|client| client.id()).collect();
        let selected = self.selector.select(&ids);
        self.send_models()?;

        if round % self.settings.eval_gap == 0 {
            info!("-------------Round number: {}-------------", glob_iter);
            info!("evaluate global model");
            self.evaluate();
        }

        let mut uploads: Vec<(Arc<Weights>, usize)> = Vec::with_capacity(selected.len());
        let mut pool_grad: Vec<GradientSnapshot> = Vec::new();
        for client in self.clients.iter_mut() {
            let id = client.id();
            if !selected.contains(&id) {
                continue;
            }
            let phase = if self.trained_this_task.contains(&id) {
                TaskPhase::Resumed
            } else {
                TaskPhase::New
            };
            client.before_train(task, phase);
            client.update_new_set();
            client.train(glob_iter, &model_old)?;
            uploads.push((client.weights(), client.train_samples()));
            if let Some(grads) = client.proto_grad_sharing()? {
                debug!("client {} shared {} gradients", id, grads.len());
                pool_grad.extend(grads);
            }
            self.trained_this_task.insert(id);
        }

        self.events.broadcast_phase(PhaseName::Aggregate);
        self.aggregate_parameters(&uploads)?;

        let pooled = pool_grad.len();
        let promotion = self.dataloader(pool_grad, ModelVersion(glob_iter))?;

        let cost = start.elapsed();
        self.budget.push(cost);
        info!("{:-<25} time cost {:-<25} {:?}", "", "", cost);
        Ok(RoundReport {
            task,
            round,
            glob_iter,
            participants: selected,
            pooled,
            promotion,
            cost,
        })
    }

    /// Broadcasts the global model to every client.
    fn send_models(&mut self) -> Result<(), CoordinatorError> {
        for client in self.clients.iter_mut() {
            client.set_parameters(&self.global_weights)?;
        }
        Ok(())
    }

    /// Records the accuracy and loss of the global model over all clients.
    fn evaluate(&mut self) {
        let (test, train) = self.clients.iter().fold(
            (Metrics::default(), Metrics::default()),
            |(test, train), client| (test + client.test_metrics(), train + client.train_metrics()),
        );
        if let Some(accuracy) = test.accuracy() {
            self.rs_test_acc.push(accuracy);
            info!("averaged test accuracy: {:.4}", accuracy);
        }
        if let Some(loss) = train.mean_loss() {
            self.rs_train_loss.push(loss);
            info!("averaged train loss: {:.4}", loss);
        }
    }

    /// Replaces the global model with the sample-weighted average of the uploads.
    fn aggregate_parameters(&mut self, uploads: &[(Arc<Weights>, usize)]) -> Result<(), CoordinatorError> {
        let models: Vec<(&Weights, usize)> = uploads
            .iter()
            .map(|(weights, samples)| (weights.as_ref(), *samples))
            .collect();
        let averaged = federated_average(&models)?;
        self.global = Perceptron::from_weights(self.global.shape(), &averaged)?;
        self.global_weights = Arc::new(averaged);
        Ok(())
    }

    /// Reconstructs the pooled gradients, if any, and runs the promotion gate on the global
    /// model.
    ///
    /// A non-empty pool replaces the reconstruction buffer and the monitor loader, and rolls the
    /// best model into the reference slot. An empty pool leaves both untouched, so the global
    /// model is scored on the previous monitor set.
    ///
    /// # Errors
    /// Fails if the pooled gradients are malformed or if their images differ in size.
    pub fn dataloader(
        &mut self,
        pool_grad: Vec<GradientSnapshot>,
        candidate: ModelVersion,
    ) -> Result<PromotionResult, CoordinatorError> {
        let new_reference = !pool_grad.is_empty();
        if new_reference {
            self.events.broadcast_phase(PhaseName::Reconstruct);
            let assignment = predict_labels(&pool_grad)?;
            debug!("predicted labels: {:?}", assignment.histogram());
            let buffer = self
                .reconstructor
                .reconstruct(&pool_grad, &assignment, candidate.0)?;
            let set = MonitorSet::from_buffer(&buffer)?;
            self.buffer = buffer;
            self.loader = Some(MonitorLoader::new(set, self.monitor_settings.batch_size));
            self.reconstructions += 1;
        }

        self.events.broadcast_phase(PhaseName::Monitor);
        let score = self.loader.as_ref().and_then(|loader| monitor(&self.global, loader));
        match score {
            Some(score) => info!("monitor accuracy: {:.2}%", score),
            None => debug!("no monitor set, skipping the promotion gate"),
        }

        let result = self
            .gate
            .evaluate_and_maybe_promote(candidate, score, new_reference);
        if result.new_reference {
            info!("best model rolled into the reference slot");
        }
        if result.promoted {
            self.arena.insert(candidate, Arc::clone(&self.global_weights));
            self.promotions += 1;
            self.events.broadcast_model(ModelUpdate::New {
                version: candidate,
                weights: Arc::clone(&self.global_weights),
            });
            info!(
                "promoted global model {} with best score {:.2}%",
                candidate,
                self.gate.best_score()
            );
        }
        self.arena.retain(&self.gate.live_versions());
        Ok(result)
    }
}
