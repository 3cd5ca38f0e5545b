//! The optimizer oracle contract.
//!
//! Candidate generation, model fitting, and acquisition scoring are not this
//! crate's business: the search pipeline records observations through
//! [`Policy::write`] and, in Bayesian mode, asks [`Policy::learn`] for a
//! fitted [`Predictor`] to score sampled candidates. Any optimizer exposing
//! this surface plugs in; [`MockPolicy`] is a stand-in for tests and demos.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::sync::Arc;

use crate::core::Series;
use crate::error::{LinkError, LinkResult};

/// Acquisition score variants understood by predictors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreMode {
    /// Expected improvement.
    Ei,
    /// Probability of improvement.
    Pi,
    /// Thompson sampling.
    Ts,
}

impl FromStr for ScoreMode {
    type Err = LinkError;

    fn from_str(text: &str) -> LinkResult<Self> {
        match text {
            "EI" => Ok(ScoreMode::Ei),
            "PI" => Ok(ScoreMode::Pi),
            "TS" => Ok(ScoreMode::Ts),
            other => Err(LinkError::Policy(format!("unknown score mode '{other}'"))),
        }
    }
}

/// A fitted model that scores candidate parameter vectors.
pub trait Predictor: Send {
    /// Scores each candidate; higher is better. Returns one score per
    /// candidate.
    fn score(&self, mode: ScoreMode, candidates: &[Series]) -> LinkResult<Vec<f64>>;

    /// Incremental update with one newly observed pair. Failures are
    /// recoverable: the pipeline falls back to a full refit.
    fn write(&mut self, x: &Series, t: f64) -> LinkResult<()>;
}

/// The opaque optimization oracle.
pub trait Policy: Send {
    /// Number of observations recorded so far.
    fn training_len(&self) -> usize;

    /// Records observed parameter vectors with their measured outcomes.
    fn write(&mut self, x: &[Series], t: &[f64]) -> LinkResult<()>;

    /// Fits a predictor on everything recorded so far.
    fn learn(&mut self, num_rand_basis: usize) -> LinkResult<Box<dyn Predictor>>;
}

/// Shared handle the pipeline and its suspended stages use to reach the
/// oracle from the adapter's worker thread.
pub type SharedPolicy = Arc<Mutex<Box<dyn Policy>>>;

/// Wraps a policy for use by a pipeline.
pub fn share(policy: impl Policy + 'static) -> SharedPolicy {
    Arc::new(Mutex::new(Box::new(policy)))
}

/// Recording oracle with a uniformly random scorer. Stands in for a real
/// optimizer in tests and demo runs: observations are kept, "learning"
/// produces a predictor whose scores are seeded noise.
pub struct MockPolicy {
    x: Vec<Series>,
    t: Vec<f64>,
    rng: StdRng,
}

impl MockPolicy {
    pub fn seeded(seed: u64) -> Self {
        MockPolicy {
            x: Vec::new(),
            t: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Observed outcomes, in arrival order.
    pub fn observed(&self) -> &[f64] {
        &self.t
    }

    /// Observed parameter vectors, in arrival order.
    pub fn observed_params(&self) -> &[Series] {
        &self.x
    }
}

impl Policy for MockPolicy {
    fn training_len(&self) -> usize {
        self.t.len()
    }

    fn write(&mut self, x: &[Series], t: &[f64]) -> LinkResult<()> {
        if x.len() != t.len() {
            return Err(LinkError::Policy(format!(
                "{} parameter vectors with {} outcomes",
                x.len(),
                t.len()
            )));
        }
        self.x.extend_from_slice(x);
        self.t.extend_from_slice(t);
        Ok(())
    }

    fn learn(&mut self, _num_rand_basis: usize) -> LinkResult<Box<dyn Predictor>> {
        Ok(Box::new(MockPredictor {
            rng: StdRng::seed_from_u64(self.rng.gen()),
        }))
    }
}

struct MockPredictor {
    rng: StdRng,
}

impl Predictor for MockPredictor {
    fn score(&self, _mode: ScoreMode, candidates: &[Series]) -> LinkResult<Vec<f64>> {
        let mut rng = self.rng.clone();
        Ok(candidates.iter().map(|_| rng.gen_range(0.0..1.0)).collect())
    }

    fn write(&mut self, _x: &Series, _t: f64) -> LinkResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_mode_parsing() {
        assert_eq!("TS".parse::<ScoreMode>().unwrap(), ScoreMode::Ts);
        assert_eq!("EI".parse::<ScoreMode>().unwrap(), ScoreMode::Ei);
        assert!("XX".parse::<ScoreMode>().is_err());
    }

    #[test]
    fn test_mock_policy_records_observations() {
        let mut policy = MockPolicy::seeded(1);
        assert_eq!(policy.training_len(), 0);
        let x = Series::from_pairs([("a", 1.0)]);
        policy.write(&[x], &[0.5]).unwrap();
        assert_eq!(policy.training_len(), 1);
        assert_eq!(policy.observed(), &[0.5]);
    }

    #[test]
    fn test_mock_predictor_scores_every_candidate() {
        let mut policy = MockPolicy::seeded(1);
        let predictor = policy.learn(100).unwrap();
        let candidates = vec![
            Series::from_pairs([("a", 0.0)]),
            Series::from_pairs([("a", 1.0)]),
        ];
        let scores = predictor.score(ScoreMode::Ts, &candidates).unwrap();
        assert_eq!(scores.len(), 2);
    }
}
