//! Posterior and evidence estimation over the weighted point store.
//!
//! Every retained point carries `log_weight` (its shell's exclusive volume
//! over the shell occupancy) and `log_l`; the evidence is the log-sum-exp of
//! their sum, the effective sample size follows from the normalized
//! importance weights, and equal-weight posterior draws come from systematic
//! (stochastic universal) resampling.

use ndarray::{Array1, Array2, Axis};
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::points::PointStore;

/// Numerically stable log(Σ exp(x_i)).
pub(crate) fn logsumexp(xs: &[f64]) -> f64 {
    let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    m + xs.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

fn posterior_terms(store: &PointStore) -> Vec<f64> {
    store
        .retained()
        .map(|p| p.log_weight + p.log_l)
        .collect()
}

/// Log-evidence: log-sum-exp of `log_weight + log_l` over retained points.
pub fn log_evidence(store: &PointStore) -> f64 {
    logsumexp(&posterior_terms(store))
}

/// Uncertainty on the log-evidence from the variance of per-shell
/// sub-evidence estimates: each shell contributes `W_k² N_k Var(L)` where
/// `W_k` is the per-point weight of the shell.
pub fn log_evidence_error(store: &PointStore) -> f64 {
    use std::collections::BTreeMap;

    let mut by_shell: BTreeMap<usize, Vec<(f64, f64)>> = BTreeMap::new();
    for p in store.retained() {
        by_shell.entry(p.shell).or_default().push((p.log_weight, p.log_l));
    }

    let mut log_vars = Vec::new();
    for points in by_shell.values() {
        if points.len() < 2 {
            continue;
        }
        let log_w = points[0].0;
        let n = points.len() as f64;
        let m = points
            .iter()
            .map(|&(_, ll)| ll)
            .fold(f64::NEG_INFINITY, f64::max);
        if m == f64::NEG_INFINITY {
            continue;
        }
        let s1: f64 = points.iter().map(|&(_, ll)| (ll - m).exp()).sum();
        let s2: f64 = points.iter().map(|&(_, ll)| (2.0 * (ll - m)).exp()).sum();
        let var = (s2 / n - (s1 / n).powi(2)).max(0.0);
        if var > 0.0 {
            // Var(Z_k) = W_k^2 * n * Var(L) with the exp(m) shift restored.
            log_vars.push(2.0 * log_w + n.ln() + var.ln() + 2.0 * m);
        }
    }

    if log_vars.is_empty() {
        return 0.0;
    }
    let log_var = logsumexp(&log_vars);
    // sqrt(Var Z) / Z is the first-order error on ln Z.
    (0.5 * log_var - log_evidence(store)).exp()
}

/// Effective sample size (Σw)² / Σw² of the unnormalized posterior weights.
pub fn effective_sample_size(store: &PointStore) -> f64 {
    let terms = posterior_terms(store);
    if terms.is_empty() {
        return 0.0;
    }
    let doubled: Vec<f64> = terms.iter().map(|t| 2.0 * t).collect();
    (2.0 * logsumexp(&terms) - logsumexp(&doubled)).exp()
}

/// Evidence contribution of the current live set relative to the total, the
/// exploration-phase stopping quantity.
pub fn live_evidence_fraction(store: &PointStore) -> f64 {
    let live: Vec<f64> = store
        .retained()
        .filter(|p| p.live)
        .map(|p| p.log_weight + p.log_l)
        .collect();
    if live.is_empty() {
        return 0.0;
    }
    (logsumexp(&live) - log_evidence(store)).exp()
}

/// Normalized posterior weights of the retained points, summing to 1.
pub fn normalized_weights(store: &PointStore) -> Vec<f64> {
    let terms = posterior_terms(store);
    let total = logsumexp(&terms);
    terms.iter().map(|t| (t - total).exp()).collect()
}

/// Draws `n` equal-weight posterior samples by systematic resampling.
pub fn resample_equal(store: &PointStore, n: usize, rng: &mut SmallRng) -> Vec<Vec<f64>> {
    let weights = normalized_weights(store);
    let params: Vec<&Vec<f64>> = store.retained().map(|p| &p.params).collect();
    if params.is_empty() || n == 0 {
        return Vec::new();
    }

    let start: f64 = rng.gen::<f64>() / n as f64;
    let mut out = Vec::with_capacity(n);
    let mut cumulative = weights[0];
    let mut idx = 0;
    for j in 0..n {
        let u = start + j as f64 / n as f64;
        while u > cumulative && idx + 1 < params.len() {
            idx += 1;
            cumulative += weights[idx];
        }
        out.push(params[idx].clone());
    }
    out
}

/// Posterior mean and standard deviation per dimension, from the weighted
/// points directly (no resampling noise).
pub fn posterior_mean_std(store: &PointStore) -> (Vec<f64>, Vec<f64>) {
    let weights = Array1::from(normalized_weights(store));
    let params: Vec<&Vec<f64>> = store.retained().map(|p| &p.params).collect();
    if params.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let ndim = params[0].len();
    let mut data = Array2::<f64>::zeros((params.len(), ndim));
    for (i, p) in params.iter().enumerate() {
        for (j, &v) in p.iter().enumerate() {
            data[(i, j)] = v;
        }
    }

    let weighted = &data * &weights.view().insert_axis(Axis(1));
    let mean = weighted.sum_axis(Axis(0));
    let centered = &data - &mean.view().insert_axis(Axis(0));
    let var = (&centered * &centered * &weights.view().insert_axis(Axis(1))).sum_axis(Axis(0));
    (mean.to_vec(), var.mapv(f64::sqrt).to_vec())
}

/// Log-likelihood and parameters of the best point seen so far.
pub fn max_likelihood_point(store: &PointStore) -> Option<(f64, Vec<f64>)> {
    let log_ls: Vec<f64> = store.retained().map(|p| p.log_l).collect();
    if log_ls.is_empty() {
        return None;
    }
    let arr = Array1::from(log_ls);
    let idx = arr.argmax().ok()?;
    let p = store.retained().nth(idx)?;
    Some((p.log_l, p.params.clone()))
}
