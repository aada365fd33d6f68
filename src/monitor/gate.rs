//! The promotion gate.
//!
//! The gate owns the two best model slots: the reference (previous best) and the best model. Both
//! are [`ModelVersion`]s into the coordinator's model arena, so a promotion never copies weights.

use crate::model::ModelVersion;

#[derive(Debug, Clone, Copy, PartialEq)]
/// The decision of the gate for one round.
pub struct PromotionResult {
    /// Whether the candidate became the best model.
    pub promoted: bool,
    /// Whether the best model was rolled into the reference slot before the decision.
    pub new_reference: bool,
    /// The monitor score of the candidate, if there was one.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
/// A non-regression gate over monitor scores.
pub struct PromotionGate {
    reference: Option<ModelVersion>,
    best: Option<ModelVersion>,
    best_score: f64,
    last_score: f64,
}

impl PromotionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the reference model.
    pub fn reference(&self) -> Option<ModelVersion> {
        self.reference
    }

    /// Gets the best model.
    pub fn best(&self) -> Option<ModelVersion> {
        self.best
    }

    /// Gets the best score so far. It never decreases.
    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    /// Gets the latest score since the last reference roll.
    pub fn last_score(&self) -> f64 {
        self.last_score
    }

    /// Gets the versions the gate refers to.
    pub fn live_versions(&self) -> Vec<ModelVersion> {
        self.reference.iter().chain(self.best.iter()).copied().collect()
    }

    /// Decides on the promotion of a candidate.
    ///
    /// With `new_reference`, the best model first becomes the reference and the last score is
    /// reset. The candidate is promoted if its score is at least the best score. Without a score
    /// the gate is skipped.
    pub fn evaluate_and_maybe_promote(
        &mut self,
        candidate: ModelVersion,
        score: Option<f64>,
        new_reference: bool,
    ) -> PromotionResult {
        if new_reference {
            self.reference = self.best;
            self.last_score = 0.;
        }

        let promoted = match score {
            Some(score) => {
                self.last_score = score;
                if score >= self.best_score {
                    self.best_score = score;
                    self.best = Some(candidate);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        PromotionResult {
            promoted,
            new_reference,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_score_never_decreases() {
        let mut gate = PromotionGate::new();
        let scores = [Some(10.), Some(5.), None, Some(30.), Some(0.), Some(30.), Some(29.9)];
        let mut last = gate.best_score();
        for (round, score) in scores.iter().enumerate() {
            gate.evaluate_and_maybe_promote(ModelVersion(round as u64), *score, round % 3 == 0);
            assert!(gate.best_score() >= last);
            last = gate.best_score();
        }
        assert_eq!(gate.best_score(), 30.);
        assert_eq!(gate.best(), Some(ModelVersion(5)));
    }

    #[test]
    fn test_promotion_iff_score_reaches_best() {
        let mut gate = PromotionGate::new();
        let result = gate.evaluate_and_maybe_promote(ModelVersion(0), Some(50.), false);
        assert!(result.promoted);

        // from below
        let result = gate.evaluate_and_maybe_promote(ModelVersion(1), Some(49.99), false);
        assert!(!result.promoted);
        assert_eq!(gate.best(), Some(ModelVersion(0)));

        // exactly at the threshold
        let result = gate.evaluate_and_maybe_promote(ModelVersion(2), Some(50.), false);
        assert!(result.promoted);
        assert_eq!(gate.best(), Some(ModelVersion(2)));

        // from above
        let result = gate.evaluate_and_maybe_promote(ModelVersion(3), Some(50.01), false);
        assert!(result.promoted);
        assert_eq!(gate.best(), Some(ModelVersion(3)));
        assert_eq!(gate.best_score(), 50.01);
    }

    #[test]
    fn test_first_score_of_zero_is_promoted() {
        let mut gate = PromotionGate::new();
        assert!(gate.evaluate_and_maybe_promote(ModelVersion(0), Some(0.), false).promoted);
    }

    #[test]
    fn test_missing_score_skips_the_gate() {
        let mut gate = PromotionGate::new();
        gate.evaluate_and_maybe_promote(ModelVersion(0), Some(20.), false);
        let result = gate.evaluate_and_maybe_promote(ModelVersion(1), None, false);
        assert_eq!(
            result,
            PromotionResult {
                promoted: false,
                new_reference: false,
                score: None
            }
        );
        assert_eq!(gate.best(), Some(ModelVersion(0)));
        assert_eq!(gate.last_score(), 20.);
    }

    #[test]
    fn test_reference_rolls_only_on_request() {
        let mut gate = PromotionGate::new();
        gate.evaluate_and_maybe_promote(ModelVersion(0), Some(40.), false);
        gate.evaluate_and_maybe_promote(ModelVersion(1), Some(30.), false);
        assert_eq!(gate.reference(), None);
        assert_eq!(gate.last_score(), 30.);

        let result = gate.evaluate_and_maybe_promote(ModelVersion(2), Some(45.), true);
        assert!(result.new_reference);
        assert_eq!(gate.reference(), Some(ModelVersion(0)));
        assert_eq!(gate.best(), Some(ModelVersion(2)));
        assert_eq!(
            gate.live_versions(),
            vec![ModelVersion(0), ModelVersion(2)]
        );

        gate.evaluate_and_maybe_promote(ModelVersion(3), Some(10.), true);
        assert_eq!(gate.reference(), Some(ModelVersion(2)));
        assert_eq!(gate.last_score(), 10.);
        assert_eq!(gate.best_score(), 45.);
    }
}
