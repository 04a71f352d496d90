//! Sampler configuration.
//!
//! All options are optional with stated defaults and are validated once, at
//! sampler construction. The struct is serializable so a checkpoint carries
//! the exact configuration it was produced under.

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the classifier ensemble votes on a candidate point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotePolicy {
    /// Accept when more than half of the ensemble members accept.
    Majority,
    /// Accept only when every ensemble member accepts.
    Unanimous,
}

/// Configuration surface of [`crate::sampler::NestedSampler`].
///
/// Construct with [`Config::default`] and adjust with the `with_*` setters:
///
/// ```rust
/// use mini_nest::config::Config;
///
/// let config = Config::default().with_n_live(500).with_seed(0);
/// assert_eq!(config.n_live, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of live points kept during exploration.
    pub n_live: usize,
    /// Accepted points between shell constructions. `None` means `n_live`.
    pub n_update: Option<usize>,
    /// Per-axis enlargement factor applied to fitted ellipsoids. Must be ≥ 1.
    pub enlarge_per_dim: f64,
    /// Minimum points per ellipsoid; splits leaving fewer are rejected.
    /// `None` means `ndim + 20`.
    pub n_points_min: Option<usize>,
    /// Volume ratio above which an ellipsoid split is attempted.
    pub split_threshold: f64,
    /// Ensemble size for the neural boundary classifier. 0 disables it.
    pub n_networks: usize,
    /// Candidate points evaluated per batch.
    pub n_batch: usize,
    /// Seed of the run's RNG stream. `None` draws one from the OS.
    pub seed: Option<u64>,
    /// Exploration stops once the live set's share of the evidence falls
    /// below this fraction.
    pub f_live: f64,
    /// Minimum number of points a shell must hold before it is created.
    /// `None` means `n_batch`.
    pub n_shell: Option<usize>,
    /// Target effective sample size for the sampling phase.
    pub n_eff: f64,
    /// Likelihood-call budget, at least `n_live` (the initialization batch).
    /// `None` means unlimited.
    pub n_like_max: Option<usize>,
    /// Exclude exploration-phase points from the final posterior weighting.
    pub discard_exploration: bool,
    /// Print per-shell diagnostics while running.
    pub verbose: bool,
    /// Ensemble vote policy.
    pub vote_policy: VotePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_live: 1000,
            n_update: None,
            enlarge_per_dim: 1.1,
            n_points_min: None,
            split_threshold: 100.0,
            n_networks: 4,
            n_batch: 100,
            seed: None,
            f_live: 0.01,
            n_shell: None,
            n_eff: 10_000.0,
            n_like_max: None,
            discard_exploration: false,
            verbose: false,
            vote_policy: VotePolicy::Majority,
        }
    }
}

impl Config {
    pub fn with_n_live(mut self, n_live: usize) -> Self {
        self.n_live = n_live;
        self
    }

    pub fn with_n_update(mut self, n_update: usize) -> Self {
        self.n_update = Some(n_update);
        self
    }

    pub fn with_enlarge_per_dim(mut self, enlarge_per_dim: f64) -> Self {
        self.enlarge_per_dim = enlarge_per_dim;
        self
    }

    pub fn with_n_points_min(mut self, n_points_min: usize) -> Self {
        self.n_points_min = Some(n_points_min);
        self
    }

    pub fn with_split_threshold(mut self, split_threshold: f64) -> Self {
        self.split_threshold = split_threshold;
        self
    }

    pub fn with_n_networks(mut self, n_networks: usize) -> Self {
        self.n_networks = n_networks;
        self
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_f_live(mut self, f_live: f64) -> Self {
        self.f_live = f_live;
        self
    }

    pub fn with_n_shell(mut self, n_shell: usize) -> Self {
        self.n_shell = Some(n_shell);
        self
    }

    pub fn with_n_eff(mut self, n_eff: f64) -> Self {
        self.n_eff = n_eff;
        self
    }

    pub fn with_n_like_max(mut self, n_like_max: usize) -> Self {
        self.n_like_max = Some(n_like_max);
        self
    }

    pub fn with_discard_exploration(mut self, discard: bool) -> Self {
        self.discard_exploration = discard;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_vote_policy(mut self, vote_policy: VotePolicy) -> Self {
        self.vote_policy = vote_policy;
        self
    }

    /// Accepted points between shell constructions.
    pub fn n_update(&self) -> usize {
        self.n_update.unwrap_or(self.n_live)
    }

    /// Minimum points per ellipsoid for the given dimensionality.
    pub fn n_points_min(&self, ndim: usize) -> usize {
        self.n_points_min.unwrap_or(ndim + 20)
    }

    /// Minimum shell membership before a shell is created.
    pub fn n_shell(&self) -> usize {
        self.n_shell.unwrap_or(self.n_batch)
    }

    /// The run seed, drawing a fresh one when unset.
    pub fn seed_or_random(&self) -> u64 {
        self.seed.unwrap_or_else(|| thread_rng().gen())
    }

    /// Checks every option against its stated domain.
    pub fn validate(&self, ndim: usize) -> Result<()> {
        if ndim == 0 {
            return Err(Error::Config("ndim must be positive".into()));
        }
        if self.n_live == 0 {
            return Err(Error::Config("n_live must be a positive integer".into()));
        }
        if self.n_update == Some(0) {
            return Err(Error::Config("n_update must be a positive integer".into()));
        }
        if !(self.enlarge_per_dim >= 1.0) {
            return Err(Error::Config(format!(
                "enlarge_per_dim must be >= 1.0, got {}",
                self.enlarge_per_dim
            )));
        }
        if self.n_points_min(ndim) <= ndim {
            return Err(Error::Config(format!(
                "n_points_min must exceed ndim ({ndim})"
            )));
        }
        if !(self.split_threshold > 0.0) {
            return Err(Error::Config(format!(
                "split_threshold must be positive, got {}",
                self.split_threshold
            )));
        }
        if self.n_batch == 0 {
            return Err(Error::Config("n_batch must be a positive integer".into()));
        }
        if !(self.f_live > 0.0 && self.f_live < 1.0) {
            return Err(Error::Config(format!(
                "f_live must lie in (0, 1), got {}",
                self.f_live
            )));
        }
        if self.n_shell() == 0 {
            return Err(Error::Config("n_shell must be a positive integer".into()));
        }
        if !(self.n_eff > 0.0) {
            return Err(Error::Config(format!(
                "n_eff must be positive, got {}",
                self.n_eff
            )));
        }
        if let Some(max) = self.n_like_max {
            // The initial live set is one unavoidable batch of n_live calls.
            if max < self.n_live {
                return Err(Error::Config(format!(
                    "n_like_max ({max}) must cover the initial live set (n_live = {})",
                    self.n_live
                )));
            }
        }
        Ok(())
    }
}
