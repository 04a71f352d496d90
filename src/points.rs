//! Append-only store of evaluated points.
//!
//! Every likelihood evaluation lands here exactly once. A point is immutable
//! after evaluation except for its weight bookkeeping (`shell`, `log_weight`,
//! `live`), which is recomputed as shells are added: each point is assigned
//! to the innermost shell whose bound contains it, and its log-weight is that
//! shell's exclusive log-volume minus the log of the shell's point count.
//! With exclusive (annular) shell volumes the weights of all retained points
//! sum to 1.

use serde::{Deserialize, Serialize};

use crate::shell::{exclusive_log_volumes, Shell};

/// One evaluated point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    /// Position in the unit hypercube.
    pub cube: Vec<f64>,
    /// Position in parameter space (prior transform of `cube`).
    pub params: Vec<f64>,
    /// Log-likelihood at `params`.
    pub log_l: f64,
    /// Id of the shell this point currently belongs to.
    pub shell: usize,
    /// Log of the importance weight (shell volume over shell occupancy).
    /// `-inf` marks a point excluded from the posterior weighting.
    pub log_weight: f64,
    /// Whether the point is part of the current live set.
    pub live: bool,
    /// Whether the point was evaluated during the exploration phase.
    pub explore: bool,
}

/// Append-only table of evaluated points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointStore {
    points: Vec<Point>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an evaluated point, returning its id.
    pub fn push(
        &mut self,
        cube: Vec<f64>,
        params: Vec<f64>,
        log_l: f64,
        shell: usize,
        live: bool,
        explore: bool,
    ) -> usize {
        self.points.push(Point {
            cube,
            params,
            log_l,
            shell,
            log_weight: f64::NEG_INFINITY,
            live,
            explore,
        });
        self.points.len() - 1
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, id: usize) -> &Point {
        &self.points[id]
    }

    pub fn set_live(&mut self, id: usize, live: bool) {
        self.points[id].live = live;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.iter()
    }

    /// Points that carry posterior weight after the last recomputation.
    pub fn retained(&self) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(|p| p.log_weight.is_finite())
    }

    /// Reassigns every point to the innermost shell containing it and
    /// recomputes all log-weights from the shells' exclusive volumes.
    ///
    /// With `discard_exploration`, exploration-phase points keep their shell
    /// assignment but are excluded from occupancy counts and get `-inf`
    /// weight. Shells left without retained points have their volume folded
    /// into the nearest populated outer shell so no probability mass is
    /// silently dropped.
    pub fn recompute_weights(&mut self, shells: &mut [Shell], discard_exploration: bool) {
        if shells.is_empty() {
            return;
        }

        // Shell-major assignment so classifier-refined bounds run one batched
        // prediction per shell instead of one per point.
        let cubes: Vec<Vec<f64>> = self.points.iter().map(|p| p.cube.clone()).collect();
        let mut assignment = vec![0usize; self.points.len()];
        for (k, shell) in shells.iter().enumerate().skip(1) {
            for (a, inside) in assignment.iter_mut().zip(shell.bound.contains_batch(&cubes)) {
                if inside {
                    *a = k;
                }
            }
        }

        let mut counts = vec![0usize; shells.len()];
        let mut retained = vec![0usize; shells.len()];
        for (p, &assigned) in self.points.iter_mut().zip(&assignment) {
            p.shell = assigned;
            counts[assigned] += 1;
            if !(discard_exploration && p.explore) {
                retained[assigned] += 1;
            }
        }
        for (shell, &n) in shells.iter_mut().zip(&counts) {
            shell.n_points = n;
        }

        // Exclusive shell volumes; empty shells fold outward so their region
        // still counts toward some populated shell's weight.
        let volumes = exclusive_log_volumes(shells);
        let mut effective = vec![f64::NEG_INFINITY; shells.len()];
        let mut pending = f64::NEG_INFINITY;
        for k in (0..shells.len()).rev() {
            let combined = log_add_exp(volumes[k], pending);
            if retained[k] > 0 {
                effective[k] = combined;
                pending = f64::NEG_INFINITY;
            } else {
                pending = combined;
            }
        }
        if pending.is_finite() {
            // Everything up to the outermost populated shell folded inward.
            if let Some(k) = (0..shells.len()).find(|&k| retained[k] > 0) {
                effective[k] = log_add_exp(effective[k], pending);
            }
        }

        for p in &mut self.points {
            if discard_exploration && p.explore {
                p.log_weight = f64::NEG_INFINITY;
            } else {
                p.log_weight = effective[p.shell] - (retained[p.shell] as f64).ln();
            }
        }
    }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{Bound, Shell};
    use approx::assert_abs_diff_eq;

    fn cube_only_shell() -> Shell {
        Shell {
            id: 0,
            bound: Bound::Cube { ndim: 2 },
            log_bound_volume: 0.0,
            threshold: f64::NEG_INFINITY,
            n_points: 0,
        }
    }

    #[test]
    fn weights_sum_to_one_single_shell() {
        let mut store = PointStore::new();
        for i in 0..10 {
            let x = i as f64 / 10.0;
            store.push(vec![x, x], vec![x, x], -x, 0, false, true);
        }
        let mut shells = vec![cube_only_shell()];
        store.recompute_weights(&mut shells, false);
        let total: f64 = store.retained().map(|p| p.log_weight.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_eq!(shells[0].n_points, 10);
    }

    #[test]
    fn discard_exploration_excludes_points() {
        let mut store = PointStore::new();
        store.push(vec![0.1, 0.1], vec![0.1, 0.1], -1.0, 0, false, true);
        store.push(vec![0.9, 0.9], vec![0.9, 0.9], -2.0, 0, false, false);
        let mut shells = vec![cube_only_shell()];
        store.recompute_weights(&mut shells, true);
        assert_eq!(store.retained().count(), 1);
        let total: f64 = store.retained().map(|p| p.log_weight.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn append_returns_sequential_ids() {
        let mut store = PointStore::new();
        let a = store.push(vec![0.5], vec![0.5], 0.0, 0, true, true);
        let b = store.push(vec![0.6], vec![0.6], 0.0, 0, true, true);
        assert_eq!((a, b), (0, 1));
        assert!(store.get(a).live);
    }
}
