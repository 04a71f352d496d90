//! Nested shells and their construction.
//!
//! A shell is a nested volume of the unit cube bounded below by a likelihood
//! threshold and represented geometrically by a [`Bound`]. Shells are created
//! in order, never deleted, and their bound volumes decrease strictly; the
//! bound volume of shell k+1 is accumulated multiplicatively from shell k's
//! via the Monte Carlo fraction of shell-k points the new bound contains.

use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::ellipsoid::Ellipsoid;
use crate::neural::ClassifierEnsemble;
use crate::points::PointStore;
use crate::union::{EllipsoidUnion, FitOptions, OverlapRule};

/// Sampling boundary of a shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Bound {
    /// The full unit cube (root shell only).
    Cube { ndim: usize },
    /// A union of bounding ellipsoids.
    Union(EllipsoidUnion),
    /// An ellipsoid union trimmed by a classifier ensemble. Containment is
    /// the intersection, so the refined region never extends outside the
    /// geometric bound.
    Refined {
        geometry: EllipsoidUnion,
        ensemble: ClassifierEnsemble,
    },
}

impl Bound {
    pub fn contains(&self, x: &[f64]) -> bool {
        match self {
            Bound::Cube { ndim } => x.len() == *ndim && x.iter().all(|&v| (0.0..=1.0).contains(&v)),
            Bound::Union(union) => union.contains(x),
            Bound::Refined { geometry, ensemble } => {
                geometry.contains(x) && ensemble.predict(x)
            }
        }
    }

    /// Containment for a whole batch, with the classifier evaluated once per
    /// member network instead of once per point.
    pub fn contains_batch(&self, xs: &[Vec<f64>]) -> Vec<bool> {
        match self {
            Bound::Cube { .. } | Bound::Union(_) => {
                xs.iter().map(|x| self.contains(x)).collect()
            }
            Bound::Refined { geometry, ensemble } => {
                let mut out: Vec<bool> = xs.iter().map(|x| geometry.contains(x)).collect();
                let candidates: Vec<Vec<f64>> = xs
                    .iter()
                    .zip(&out)
                    .filter(|(_, &inside)| inside)
                    .map(|(x, _)| x.clone())
                    .collect();
                if candidates.is_empty() {
                    return out;
                }
                let verdicts = ensemble.predict_batch(&candidates);
                let mut it = verdicts.into_iter();
                for flag in out.iter_mut() {
                    if *flag {
                        *flag = it.next().unwrap_or(false);
                    }
                }
                out
            }
        }
    }

    /// Draws `n` points from the bound. Classifier-refined bounds rejection
    /// sample against the ensemble; if the ensemble rejects essentially
    /// everything the batch is topped up with geometric draws so a run never
    /// stalls on an over-tight classifier.
    pub fn sample_batch(&self, n: usize, rng: &mut SmallRng) -> Vec<Vec<f64>> {
        match self {
            Bound::Cube { ndim } => (0..n)
                .map(|_| (0..*ndim).map(|_| rng.gen::<f64>()).collect())
                .collect(),
            Bound::Union(union) => (0..n).map(|_| union.sample(rng)).collect(),
            Bound::Refined { geometry, ensemble } => {
                let mut out = Vec::with_capacity(n);
                for _ in 0..MAX_REJECTION_ROUNDS {
                    if out.len() >= n {
                        break;
                    }
                    let chunk: Vec<Vec<f64>> =
                        (0..n.max(64)).map(|_| geometry.sample(rng)).collect();
                    let keep = ensemble.predict_batch(&chunk);
                    for (x, k) in chunk.into_iter().zip(keep) {
                        if k && out.len() < n {
                            out.push(x);
                        }
                    }
                }
                while out.len() < n {
                    out.push(geometry.sample(rng));
                }
                out
            }
        }
    }
}

const MAX_REJECTION_ROUNDS: usize = 200;

/// One record of the shell arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shell {
    pub id: usize,
    pub bound: Bound,
    /// Log-volume of the region inside this shell's bound (not the annulus).
    pub log_bound_volume: f64,
    /// Log-likelihood floor that defined this shell.
    pub threshold: f64,
    /// Points currently assigned to this shell (innermost containment).
    pub n_points: usize,
}

impl Shell {
    /// The root shell: the whole unit cube, no likelihood floor.
    pub fn root(ndim: usize) -> Self {
        Self {
            id: 0,
            bound: Bound::Cube { ndim },
            log_bound_volume: 0.0,
            threshold: f64::NEG_INFINITY,
            n_points: 0,
        }
    }
}

/// Exclusive (annular) log-volumes of the shell sequence: each shell's bound
/// volume minus the next shell's. These sum to the unit-cube volume, which is
/// what makes point weights sum to 1.
pub fn exclusive_log_volumes(shells: &[Shell]) -> Vec<f64> {
    let mut out = Vec::with_capacity(shells.len());
    for (k, shell) in shells.iter().enumerate() {
        if let Some(next) = shells.get(k + 1) {
            let ratio = (next.log_bound_volume - shell.log_bound_volume).exp();
            let remainder = (1.0 - ratio).max(f64::MIN_POSITIVE);
            out.push(shell.log_bound_volume + remainder.ln());
        } else {
            out.push(shell.log_bound_volume);
        }
    }
    out
}

/// Builds the next nested shell from the current live set, or defers.
///
/// The threshold is the smallest live log-likelihood (the live set is held at
/// exactly `n_live` points, so this is the n_live-th largest overall), the
/// geometry is fitted on all live points, and classifier refinement uses
/// points below the threshold that the geometry still covers as negatives.
/// Degenerate geometry falls back to a minimally enlarged ball; classifier
/// training silently skips when data-starved. Returns `None` when the
/// would-be membership is below `n_shell` (creation deferred).
pub fn build_shell(
    store: &PointStore,
    live: &[usize],
    prev: &Shell,
    config: &Config,
    ndim: usize,
    rng: &mut SmallRng,
) -> Option<Shell> {
    if live.len() < config.n_shell() {
        return None;
    }

    let threshold = live
        .iter()
        .map(|&id| store.get(id).log_l)
        .fold(f64::INFINITY, f64::min);
    let members: Vec<Vec<f64>> = live.iter().map(|&id| store.get(id).cube.clone()).collect();

    // Count the parent shell's current occupants once; both the split gate's
    // occupied-volume target and the shell volume ratio derive from them.
    let parent_points: Vec<&crate::points::Point> =
        store.iter().filter(|p| p.shell == prev.id).collect();
    let n_parent = parent_points.len().max(1);
    let occupancy = (members.len() as f64 / n_parent as f64).min(1.0);

    let options = FitOptions {
        enlarge_per_dim: config.enlarge_per_dim,
        n_points_min: config.n_points_min(ndim),
        split_threshold: config.split_threshold,
        log_volume_target: Some(prev.log_bound_volume + occupancy.ln()),
        rule: OverlapRule::Reciprocal,
    };

    let geometry = match EllipsoidUnion::fit(&members, &options, rng) {
        Ok(union) => union,
        Err(_) => EllipsoidUnion::from_ellipsoid(
            Ellipsoid::ball(&members, config.enlarge_per_dim),
            options.rule,
        ),
    };

    let negatives: Vec<Vec<f64>> = store
        .iter()
        .filter(|p| p.log_l < threshold && geometry.contains(&p.cube))
        .map(|p| p.cube.clone())
        .collect();
    let ensemble = ClassifierEnsemble::train(
        &members,
        &negatives,
        config.n_networks,
        config.vote_policy,
        rng,
    );
    if config.verbose && ensemble.is_none() && config.n_networks > 0 {
        eprintln!(
            "shell {}: classifier refinement skipped ({} negatives)",
            prev.id + 1,
            negatives.len()
        );
    }

    let bound = match ensemble {
        Some(ensemble) => Bound::Refined { geometry, ensemble },
        None => Bound::Union(geometry),
    };

    // Monte Carlo volume ratio against the parent shell's occupants; clamped
    // so the bound-volume sequence stays strictly decreasing.
    let parent_cubes: Vec<Vec<f64>> = parent_points.iter().map(|p| p.cube.clone()).collect();
    let contained = bound
        .contains_batch(&parent_cubes)
        .into_iter()
        .filter(|&c| c)
        .count();
    let ratio = (contained as f64 / n_parent as f64).clamp(1e-10, 1.0 - 1e-3);
    let log_bound_volume = prev.log_bound_volume + ratio.ln();

    Some(Shell {
        id: prev.id + 1,
        bound,
        log_bound_volume,
        threshold,
        n_points: 0,
    })
}
