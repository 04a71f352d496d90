/*!
# Importance Nested Sampler

The main iterative engine. It maintains a live set of the `n_live` highest
likelihood points, repeatedly draws candidate batches from the innermost
shell's bound, evaluates them through the batch executor, and promotes
candidates above the current likelihood floor while killing the worst live
point. Every `n_update` promotions a new nested shell is built from the live
set (geometry fit plus optional classifier refinement), the point weights are
recomputed, and the evidence bookkeeping advances.

Exploration ends when the live set's share of the evidence drops below
`f_live` (or the likelihood-call budget runs out); a sampling phase then adds
points to existing shells — no new bounds — until the effective sample size
reaches `n_eff`. The finished run yields the log-evidence with an
uncertainty, equal-weight posterior draws, and summary statistics.

## Example

```rust,no_run
use mini_nest::config::Config;
use mini_nest::sampler::NestedSampler;

// Unit Gaussian likelihood on a uniform prior over [-5, 5]^2.
let likelihood = |theta: &[f64]| {
    -0.5 * theta.iter().map(|t| t * t).sum::<f64>()
        - (2.0 * std::f64::consts::PI).ln()
};
let prior = |cube: &[f64]| cube.iter().map(|u| 10.0 * u - 5.0).collect();

let config = Config::default().with_n_live(500).with_seed(0);
let mut sampler = NestedSampler::new(likelihood, prior, 2, config).unwrap();
let result = sampler.run().unwrap();
result.print_summary();
```
*/

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::checkpoint::{load_state, save_state, Phase, RunState};
use crate::config::Config;
use crate::error::Result;
use crate::estimate::{
    effective_sample_size, live_evidence_fraction, log_evidence, log_evidence_error,
    max_likelihood_point, posterior_mean_std, resample_equal,
};
use crate::executor::{BatchExecutor, RayonExecutor};
use crate::shell::{build_shell, Shell};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The effective-sample-size target was reached.
    Converged,
    /// The likelihood-call budget ran out first. Not an error: the statistics
    /// accumulated so far are returned as-is.
    BudgetExhausted,
}

/// Frozen summary of a finished run.
#[derive(Debug, Clone)]
pub struct SamplerResult {
    pub log_z: f64,
    pub log_z_err: f64,
    pub n_eff: f64,
    pub n_like: usize,
    pub n_shells: usize,
    pub termination: Termination,
    pub posterior_mean: Vec<f64>,
    pub posterior_std: Vec<f64>,
    pub max_log_l: f64,
}

impl SamplerResult {
    pub fn print_summary(&self) {
        println!("ln Z: {:.3} +/- {:.3}", self.log_z, self.log_z_err);
        println!("effective sample size: {:.0}", self.n_eff);
        println!(
            "likelihood calls: {} ({} shells, {:?})",
            self.n_like, self.n_shells, self.termination
        );
        println!("posterior summary:");
        for (m, s) in self.posterior_mean.iter().zip(&self.posterior_std) {
            println!("    {m:.3} +/- {s:.3}");
        }
    }
}

/**
The importance nested sampler.

# Type Parameters
- `L`: the log-likelihood callable, `Fn(&[f64]) -> f64`. Must be
  deterministic; called only through the batch executor.
- `P`: the prior transform, mapping a unit-cube vector to parameter space.
- `E`: the batch executor (defaults to the rayon thread pool).
*/
pub struct NestedSampler<L, P, E = RayonExecutor>
where
    L: Fn(&[f64]) -> f64 + Sync,
    P: Fn(&[f64]) -> Vec<f64> + Sync,
    E: BatchExecutor,
{
    likelihood: L,
    prior_transform: P,
    executor: E,
    state: RunState,
    rng: SmallRng,
    cached: Option<SamplerResult>,
}

impl<L, P> NestedSampler<L, P, RayonExecutor>
where
    L: Fn(&[f64]) -> f64 + Sync,
    P: Fn(&[f64]) -> Vec<f64> + Sync,
{
    /// Validates `config` and sets up a run in dimension `ndim`.
    pub fn new(likelihood: L, prior_transform: P, ndim: usize, config: Config) -> Result<Self> {
        Self::with_executor(likelihood, prior_transform, ndim, config, RayonExecutor)
    }

    /// Restores a checkpointed run. The caller supplies the same likelihood
    /// and prior transform the checkpoint was produced with.
    pub fn load(path: &Path, likelihood: L, prior_transform: P) -> Result<Self> {
        let state = load_state(path)?;
        let rng = SmallRng::seed_from_u64(state.rng_reseed);
        Ok(Self {
            likelihood,
            prior_transform,
            executor: RayonExecutor,
            state,
            rng,
            cached: None,
        })
    }
}

impl<L, P, E> NestedSampler<L, P, E>
where
    L: Fn(&[f64]) -> f64 + Sync,
    P: Fn(&[f64]) -> Vec<f64> + Sync,
    E: BatchExecutor,
{
    /// Like [`NestedSampler::new`] with a custom batch executor.
    pub fn with_executor(
        likelihood: L,
        prior_transform: P,
        ndim: usize,
        config: Config,
        executor: E,
    ) -> Result<Self> {
        config.validate(ndim)?;
        let seed = config.seed_or_random();
        Ok(Self {
            likelihood,
            prior_transform,
            executor,
            state: RunState::new(config, ndim, seed),
            rng: SmallRng::seed_from_u64(seed),
            cached: None,
        })
    }

    /// Runs the state machine to completion.
    pub fn run(&mut self) -> Result<SamplerResult> {
        self.run_inner(None)
    }

    /// Runs to completion with an indicatif progress readout of the shell
    /// count, evidence, effective sample size and call counter.
    pub fn run_with_progress(&mut self) -> Result<SamplerResult> {
        let pb = ProgressBar::new(self.state.config.n_eff.ceil() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:9} {bar:40.white} ETA {eta:3} | {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );
        pb.set_prefix("mini-nest");
        let result = self.run_inner(Some(&pb))?;
        pb.finish_with_message("Done!");
        Ok(result)
    }

    /// Writes the full run state to `path`. Safe between batches only; the
    /// engine never checkpoints mid-batch.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.state.rng_reseed = self.rng.gen();
        save_state(path, &self.state)?;
        // Continue on the stream the checkpoint will resume from, so a
        // saved-and-resumed run and an uninterrupted one stay comparable.
        self.rng = SmallRng::seed_from_u64(self.state.rng_reseed);
        Ok(())
    }

    /// Equal-weight posterior draws from the current point store.
    pub fn posterior(&mut self, n: usize) -> Vec<Vec<f64>> {
        resample_equal(&self.state.store, n, &mut self.rng)
    }

    pub fn log_evidence(&self) -> f64 {
        log_evidence(&self.state.store)
    }

    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.state.store)
    }

    pub fn n_like(&self) -> usize {
        self.state.n_like
    }

    pub fn n_shells(&self) -> usize {
        self.state.shells.len()
    }

    pub fn is_done(&self) -> bool {
        self.state.phase == Phase::Done
    }

    /// Lifts or removes the likelihood-call budget, typically to continue a
    /// run that stopped with [`Termination::BudgetExhausted`].
    pub fn set_n_like_max(&mut self, n_like_max: Option<usize>) {
        self.state.config.n_like_max = n_like_max;
    }

    fn run_inner(&mut self, pb: Option<&ProgressBar>) -> Result<SamplerResult> {
        if let Some(result) = &self.cached {
            return Ok(result.clone());
        }
        if self.state.store.is_empty() {
            self.initialize()?;
        }

        while self.state.phase == Phase::Exploring {
            if live_evidence_fraction(&self.state.store) < self.state.config.f_live {
                self.state.phase = Phase::Sampling;
                self.recompute();
                break;
            }
            if self.budget_exhausted() {
                // Resumable: the phase is left untouched so a later call
                // (after lifting the budget) picks up where this one stopped.
                return Ok(self.result());
            }
            self.explore_batch()?;
            self.report(pb);
        }

        while self.state.phase == Phase::Sampling {
            if effective_sample_size(&self.state.store) >= self.state.config.n_eff {
                break;
            }
            if self.budget_exhausted() {
                return Ok(self.result());
            }
            self.sample_batch()?;
            self.report(pb);
        }
        self.state.phase = Phase::Done;

        let result = self.result();
        self.cached = Some(result.clone());
        Ok(result)
    }

    /// Initializing: `n_live` uniform cube points through the prior
    /// transform, one batch evaluation, root shell covering the whole cube.
    fn initialize(&mut self) -> Result<()> {
        let ndim = self.state.ndim;
        let n_live = self.state.config.n_live;
        let cubes: Vec<Vec<f64>> = (0..n_live)
            .map(|_| (0..ndim).map(|_| self.rng.gen::<f64>()).collect())
            .collect();
        let params: Vec<Vec<f64>> = cubes.iter().map(|c| (self.prior_transform)(c)).collect();
        let log_ls = self.executor.map_batch(&self.likelihood, &params)?;
        self.state.n_like += n_live;

        self.state.shells.push(Shell::root(ndim));
        for ((cube, param), log_l) in cubes.into_iter().zip(params).zip(log_ls) {
            let id = self.state.store.push(cube, param, log_l, 0, true, true);
            self.state.live.push(id);
        }
        self.recompute();
        Ok(())
    }

    /// One exploration batch: draw from the innermost bound, evaluate,
    /// promote candidates above the live floor (killing the worst live point
    /// each time), and build a new shell once enough promotions accumulated.
    fn explore_batch(&mut self) -> Result<()> {
        let n_batch = self.state.config.n_batch;
        let cubes = {
            let bound = &self.state.shells.last().expect("initialized").bound;
            bound.sample_batch(n_batch, &mut self.rng)
        };
        let params: Vec<Vec<f64>> = cubes.iter().map(|c| (self.prior_transform)(c)).collect();
        let log_ls = self.executor.map_batch(&self.likelihood, &params)?;
        self.state.n_like += n_batch;

        let shell_id = self.state.shells.len() - 1;
        let threshold = self.live_floor();
        for ((cube, param), log_l) in cubes.into_iter().zip(params).zip(log_ls) {
            let accept = log_l > threshold;
            let id = self
                .state
                .store
                .push(cube, param, log_l, shell_id, accept, true);
            if accept {
                self.state.live.push(id);
                self.kill_worst();
                self.state.n_accepted_since_shell += 1;
            }
        }

        if self.state.n_accepted_since_shell >= self.state.config.n_update() {
            let prev = self.state.shells.last().expect("initialized");
            if let Some(shell) = build_shell(
                &self.state.store,
                &self.state.live,
                prev,
                &self.state.config,
                self.state.ndim,
                &mut self.rng,
            ) {
                if self.state.config.verbose {
                    eprintln!(
                        "shell {}: log V = {:.3}, threshold = {:.3}, calls = {}",
                        shell.id, shell.log_bound_volume, shell.threshold, self.state.n_like
                    );
                }
                self.state.shells.push(shell);
                self.state.n_accepted_since_shell = 0;
            }
        }
        self.recompute();
        Ok(())
    }

    /// One sampling-phase batch: pick the shell with the highest per-point
    /// evidence contribution (unpopulated shells first) and fill it. Points
    /// landing in deeper bounds are simply assigned deeper on recompute.
    fn sample_batch(&mut self) -> Result<()> {
        let n_batch = self.state.config.n_batch;
        let target = self.neediest_shell();
        let cubes = {
            let bound = &self.state.shells[target].bound;
            bound.sample_batch(n_batch, &mut self.rng)
        };
        let params: Vec<Vec<f64>> = cubes.iter().map(|c| (self.prior_transform)(c)).collect();
        let log_ls = self.executor.map_batch(&self.likelihood, &params)?;
        self.state.n_like += n_batch;

        for ((cube, param), log_l) in cubes.into_iter().zip(params).zip(log_ls) {
            self.state
                .store
                .push(cube, param, log_l, target, false, false);
        }
        self.recompute();
        Ok(())
    }

    /// Smallest live log-likelihood: the current acceptance floor.
    fn live_floor(&self) -> f64 {
        self.state
            .live
            .iter()
            .map(|&id| self.state.store.get(id).log_l)
            .fold(f64::INFINITY, f64::min)
    }

    /// Removes the lowest-likelihood live point from the live set.
    fn kill_worst(&mut self) {
        let store = &self.state.store;
        if let Some(pos) = (0..self.state.live.len()).min_by(|&a, &b| {
            let la = store.get(self.state.live[a]).log_l;
            let lb = store.get(self.state.live[b]).log_l;
            la.partial_cmp(&lb).expect("log-likelihoods are ordered")
        }) {
            let id = self.state.live.swap_remove(pos);
            self.state.store.set_live(id, false);
        }
    }

    /// Shell whose points contribute the most evidence each: the best target
    /// for variance reduction. Shells without retained points come first so
    /// no shell volume is left unsampled after `discard_exploration`.
    fn neediest_shell(&self) -> usize {
        let store = &self.state.store;
        let mut z = vec![f64::NEG_INFINITY; self.state.shells.len()];
        let mut n = vec![0usize; self.state.shells.len()];
        for p in store.retained() {
            n[p.shell] += 1;
            let t = p.log_weight + p.log_l;
            let m = z[p.shell].max(t);
            if m.is_finite() {
                z[p.shell] = m + ((z[p.shell] - m).exp() + (t - m).exp()).ln();
            }
        }
        let mut best = self.state.shells.len() - 1;
        let mut best_score = f64::NEG_INFINITY;
        for k in 0..self.state.shells.len() {
            if n[k] == 0 {
                return k;
            }
            let score = z[k] - (n[k] as f64).ln();
            if score > best_score {
                best_score = score;
                best = k;
            }
        }
        best
    }

    /// True when the next batch would push the call counter past the budget.
    /// Checked between batches only; in-flight batches always complete.
    fn budget_exhausted(&self) -> bool {
        match self.state.config.n_like_max {
            Some(max) => self.state.n_like + self.state.config.n_batch > max,
            None => false,
        }
    }

    /// Reassign points and recompute weights. Once exploration is over, the
    /// discard flag removes every exploration point from the weighting, so
    /// the ESS target is always judged on the points that stay in the final
    /// posterior.
    fn recompute(&mut self) {
        let discard =
            self.state.config.discard_exploration && self.state.phase != Phase::Exploring;
        self.state
            .store
            .recompute_weights(&mut self.state.shells, discard);
    }

    fn report(&self, pb: Option<&ProgressBar>) {
        if let Some(pb) = pb {
            let ess = effective_sample_size(&self.state.store);
            pb.set_position(ess.min(self.state.config.n_eff) as u64);
            pb.set_message(format!(
                "shells={} logZ={:.2} ESS={:.0} calls={}",
                self.state.shells.len(),
                log_evidence(&self.state.store),
                ess,
                self.state.n_like,
            ));
        }
    }

    fn result(&self) -> SamplerResult {
        let store = &self.state.store;
        let n_eff = effective_sample_size(store);
        let (posterior_mean, posterior_std) = posterior_mean_std(store);
        let termination = if n_eff >= self.state.config.n_eff {
            Termination::Converged
        } else {
            Termination::BudgetExhausted
        };
        SamplerResult {
            log_z: log_evidence(store),
            log_z_err: log_evidence_error(store),
            n_eff,
            n_like: self.state.n_like,
            n_shells: self.state.shells.len(),
            termination,
            posterior_mean,
            posterior_std,
            max_log_l: max_likelihood_point(store).map(|(l, _)| l).unwrap_or(f64::NEG_INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SerialExecutor;
    use approx::assert_abs_diff_eq;

    fn gaussian_log_l(theta: &[f64]) -> f64 {
        -0.5 * theta.iter().map(|t| t * t).sum::<f64>()
            - theta.len() as f64 * 0.5 * (2.0 * std::f64::consts::PI).ln()
    }

    fn prior(cube: &[f64]) -> Vec<f64> {
        cube.iter().map(|u| 10.0 * u - 5.0).collect()
    }

    fn small_config() -> Config {
        Config::default()
            .with_n_live(200)
            .with_n_update(100)
            .with_n_batch(50)
            .with_n_eff(500.0)
            .with_n_networks(0)
            .with_n_points_min(10)
            .with_seed(42)
    }

    #[test]
    fn live_set_size_is_invariant_during_exploration() {
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, small_config(), SerialExecutor)
                .unwrap();
        sampler.run().unwrap();
        assert_eq!(sampler.state.live.len(), 200);
        let n_live_flagged = sampler.state.store.iter().filter(|p| p.live).count();
        assert_eq!(n_live_flagged, 200);
    }

    #[test]
    fn shell_bound_volumes_strictly_decrease() {
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, small_config(), SerialExecutor)
                .unwrap();
        sampler.run().unwrap();
        let shells = &sampler.state.shells;
        assert!(shells.len() > 1, "expected nested shells to be built");
        for pair in shells.windows(2) {
            assert!(pair[1].log_bound_volume < pair[0].log_bound_volume);
        }
    }

    #[test]
    fn weights_sum_to_one_after_completion() {
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, small_config(), SerialExecutor)
                .unwrap();
        sampler.run().unwrap();
        let total: f64 = sampler
            .state
            .store
            .retained()
            .map(|p| p.log_weight.exp())
            .sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn budget_stops_are_orderly_and_resumable() {
        // ESS can never exceed the point count, so a budget below n_eff
        // guarantees the run stops on the budget.
        let config = small_config().with_n_like_max(450);
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, config, SerialExecutor).unwrap();
        let result = sampler.run().unwrap();
        assert!(result.n_like <= 450);
        assert_eq!(result.termination, Termination::BudgetExhausted);
        assert!(!sampler.is_done());

        sampler.set_n_like_max(None);
        let resumed = sampler.run().unwrap();
        assert_eq!(resumed.termination, Termination::Converged);
        assert!(resumed.n_like > result.n_like);
        assert!(sampler.is_done());
    }

    #[test]
    fn discard_exploration_drops_exploration_points_from_the_posterior() {
        // ESS target low enough that the exploration points alone would meet
        // it; the final weighting must still come from sampling-phase points.
        let config = small_config()
            .with_n_eff(50.0)
            .with_discard_exploration(true);
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, config, SerialExecutor)
                .unwrap();
        let result = sampler.run().unwrap();
        assert_eq!(result.termination, Termination::Converged);
        assert!(result.n_eff >= 50.0);

        let weighted_explore = sampler.state.store.retained().filter(|p| p.explore).count();
        assert_eq!(weighted_explore, 0);
        let weighted_sampling = sampler
            .state
            .store
            .retained()
            .filter(|p| !p.explore)
            .count();
        assert!(weighted_sampling >= 50);
    }

    #[test]
    fn done_runs_are_no_ops() {
        let mut sampler =
            NestedSampler::with_executor(gaussian_log_l, prior, 2, small_config(), SerialExecutor)
                .unwrap();
        let first = sampler.run().unwrap();
        let calls = sampler.n_like();
        let second = sampler.run().unwrap();
        assert_eq!(sampler.n_like(), calls);
        assert_eq!(first.log_z, second.log_z);
        assert_eq!(first.n_eff, second.n_eff);
    }

    #[test]
    fn same_seed_reproduces_the_run() {
        let run = || {
            let mut sampler = NestedSampler::with_executor(
                gaussian_log_l,
                prior,
                2,
                small_config(),
                SerialExecutor,
            )
            .unwrap();
            sampler.run().unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.log_z, b.log_z);
        assert_eq!(a.n_like, b.n_like);
        assert_eq!(a.n_shells, b.n_shells);
    }

    #[test]
    fn evaluation_error_aborts_the_run() {
        let bad = |theta: &[f64]| {
            if theta[0] > 0.0 {
                f64::NAN
            } else {
                gaussian_log_l(theta)
            }
        };
        let mut sampler =
            NestedSampler::with_executor(bad, prior, 2, small_config(), SerialExecutor).unwrap();
        assert!(sampler.run().is_err());
        assert!(!sampler.is_done());
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = Config::default().with_n_live(0);
        assert!(NestedSampler::new(gaussian_log_l, prior, 2, config).is_err());
    }
}
