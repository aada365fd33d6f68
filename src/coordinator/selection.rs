//! Selection of the clients joining a round.

use rand::{seq::IteratorRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{client::ClientId, settings::FederatedSettings};

/// A strategy to pick the participants of a round.
pub trait Selector {
    /// Selects participants out of the given clients, in ascending id order.
    fn select(&mut self, clients: &[ClientId]) -> Vec<ClientId>;
}

/// Picks a uniformly random subset of the clients.
///
/// The subset holds `floor(num_clients * join_ratio)` clients (at least one). With a random join
/// ratio, the size is drawn uniformly between that number and all clients for every round.
#[derive(Debug, Clone)]
pub struct RandomSelector {
    join_ratio: f64,
    random_join_ratio: bool,
    rng: ChaCha8Rng,
}

impl RandomSelector {
    pub fn new(join_ratio: f64, random_join_ratio: bool, seed: u64) -> Self {
        Self {
            join_ratio,
            random_join_ratio,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Gets the minimal number of clients joining a round.
    pub fn num_join_clients(&self, num_clients: usize) -> usize {
        ((num_clients as f64 * self.join_ratio) as usize)
            .max(1)
            .min(num_clients)
    }
}

impl From<&FederatedSettings> for RandomSelector {
    fn from(settings: &FederatedSettings) -> Self {
        Self::new(settings.join_ratio, settings.random_join_ratio, settings.seed)
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, clients: &[ClientId]) -> Vec<ClientId> {
        let min_count = self.num_join_clients(clients.len());
        let count = if self.random_join_ratio {
            self.rng.gen_range(min_count..=clients.len())
        } else {
            min_count
        };
        let mut selected = clients.iter().copied().choose_multiple(&mut self.rng, count);
        selected.sort_unstable();
        selected
    }
}
