//! Versioned model snapshots.
//!
//! Global models are immutable once aggregated. The coordinator keeps the ones it still refers to
//! in a [`ModelArena`], keyed by the global round in which they were aggregated, so that handing a
//! model over (e.g. promoting it to be the best model) is a matter of copying a
//! [`ModelVersion`], not the weights.

use std::{collections::BTreeMap, sync::Arc};

use derive_more::Display;

use crate::model::Weights;

/// The version of a global model: the global round in which it was aggregated.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "v{}", _0)]
pub struct ModelVersion(pub u64);

#[derive(Debug, Default)]
/// An arena of versioned global model snapshots.
pub struct ModelArena {
    snapshots: BTreeMap<ModelVersion, Arc<Weights>>,
}

impl ModelArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot. A snapshot already stored under the same version is kept.
    pub fn insert(&mut self, version: ModelVersion, weights: Arc<Weights>) {
        self.snapshots.entry(version).or_insert(weights);
    }

    /// Gets the snapshot of the given version.
    pub fn get(&self, version: ModelVersion) -> Option<Arc<Weights>> {
        self.snapshots.get(&version).cloned()
    }

    /// Drops every snapshot that is not one of the given versions.
    pub fn retain(&mut self, live: &[ModelVersion]) {
        self.snapshots.retain(|version, _| live.contains(version));
    }

    /// Gets the number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Checks whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn weights(value: f32) -> Arc<Weights> {
        Arc::new(Weights::from(vec![arr1(&[value]).into_dyn()]))
    }

    #[test]
    fn test_insert_keeps_first_snapshot() {
        let mut arena = ModelArena::new();
        arena.insert(ModelVersion(1), weights(1.));
        arena.insert(ModelVersion(1), weights(2.));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(ModelVersion(1)), Some(weights(1.)));
        assert_eq!(arena.get(ModelVersion(2)), None);
    }

    #[test]
    fn test_retain_drops_dead_versions() {
        let mut arena = ModelArena::new();
        for round in 0..4 {
            arena.insert(ModelVersion(round), weights(round as f32));
        }
        arena.retain(&[ModelVersion(1), ModelVersion(3)]);
        assert_eq!(arena.len(), 2);
        assert!(arena.get(ModelVersion(0)).is_none());
        assert!(arena.get(ModelVersion(3)).is_some());
    }

    #[test]
    fn test_shared_snapshot_is_not_copied() {
        let mut arena = ModelArena::new();
        let snapshot = weights(1.);
        arena.insert(ModelVersion(7), Arc::clone(&snapshot));
        assert!(Arc::ptr_eq(&arena.get(ModelVersion(7)).unwrap(), &snapshot));
    }
}
