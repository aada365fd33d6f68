//! Coordinator test utilities.

pub mod utils;

mod task;
