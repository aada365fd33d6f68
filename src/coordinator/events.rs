//! This module provides the coordinator's `Event`s, `EventSubscriber` and `EventPublisher` types.

use std::sync::Arc;

use derive_more::Display;
use tokio::sync::watch;

use crate::model::{ModelVersion, Weights};

/// The phases the coordinator goes through in every round.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Task")]
    Task,
    #[display(fmt = "Train")]
    Train,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Reconstruct")]
    Reconstruct,
    #[display(fmt = "Monitor")]
    Monitor,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// The global round in which this event is emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// Best model update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    Invalidate,
    New {
        version: ModelVersion,
        weights: Arc<Weights>,
    },
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    model_tx: EventBroadcaster<ModelUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    model_rx: EventListener<ModelUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(round_id: u64, phase: PhaseName, model: ModelUpdate) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a best model event
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.model_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for new best model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either retrieve the latest `Event<E>`
/// emitted by the coordinator (with `EventListener::get_latest`) or to wait for the next one
/// (with `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for a new event and returns it.
    ///
    /// Yields `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
