//! A coordinator for federated class-incremental learning.
//!
//! Clients see a growing sequence of classification tasks. The [`Coordinator`] drives them
//! through every task in communication rounds and aggregates their models into a global model.
//! Gradients that clients share are inverted on a frozen encoder into synthetic images. Those
//! images score every new global model, and only a model that does not regress on them becomes
//! the reference the clients anchor their local training on.
//!
//! The crate is organised as follows:
//!
//! - [`settings`]: configuration loading and validation.
//! - [`model`]: weight snapshots, the perceptron network and the versioned snapshot arena.
//! - [`data`]: task partitions and the [`TaskDataSource`] seam.
//! - [`registry`]: task signatures and task identifiers.
//! - [`client`]: the [`Client`] seam and the in-process [`LocalClient`].
//! - [`coordinator`]: the task and round driver.
//! - [`reconstruction`]: gradient inversion.
//! - [`monitor`]: the monitor set and the promotion gate.
//!
//! [`Coordinator`]: crate::coordinator::Coordinator
//! [`TaskDataSource`]: crate::data::TaskDataSource
//! [`Client`]: crate::client::Client
//! [`LocalClient`]: crate::client::LocalClient

#[macro_use]
extern crate tracing;

pub mod client;
pub mod coordinator;
pub mod data;
pub mod model;
pub mod monitor;
pub mod reconstruction;
pub mod registry;
pub mod settings;
