//! Unions of bounding ellipsoids.
//!
//! A point cloud is first wrapped in a single ellipsoid. When that ellipsoid
//! is much larger than the volume the points plausibly occupy, the cloud is
//! split two ways (k-means style) and sub-ellipsoids are fitted recursively;
//! a split is kept only when it reduces the total bounding volume and leaves
//! both halves enough points. Sampling picks a component by volume share and
//! corrects for overlaps so draws stay uniform over the union.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ellipsoid::{centroid, Degenerate, Ellipsoid};
use crate::estimate::logsumexp;

/// Draws used for the Monte Carlo overlap correction of the union volume.
const VOLUME_DRAWS: usize = 1000;

/// Policy applied when a sampled point lies inside several overlapping
/// ellipsoids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapRule {
    /// Accept with probability 1/q, q = number of covering components.
    Reciprocal,
    /// Accept only when the source component is the lowest-index cover.
    First,
}

/// Knobs for [`EllipsoidUnion::fit`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub enlarge_per_dim: f64,
    pub n_points_min: usize,
    pub split_threshold: f64,
    /// Estimated log-volume the whole cloud actually occupies. Splits are
    /// only attempted on sub-clouds whose bounding volume exceeds their share
    /// of this by `split_threshold`. `None` attempts splits unconditionally.
    pub log_volume_target: Option<f64>,
    pub rule: OverlapRule,
}

/// An ordered set of ellipsoids covering a point cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EllipsoidUnion {
    members: Vec<Ellipsoid>,
    /// Overlap-corrected log-volume of the union.
    log_volume: f64,
    rule: OverlapRule,
}

impl EllipsoidUnion {
    /// Fits a union to `points`. Fails with [`Degenerate`] only when even the
    /// root single-ellipsoid fit fails; callers then fall back to
    /// [`Ellipsoid::ball`] via [`EllipsoidUnion::from_ellipsoid`].
    pub fn fit(
        points: &[Vec<f64>],
        options: &FitOptions,
        rng: &mut SmallRng,
    ) -> Result<Self, Degenerate> {
        let root = Ellipsoid::fit(points, options.enlarge_per_dim)?;
        let n_total = points.len();
        let mut members = Vec::new();
        split_recursive(points.to_vec(), root, n_total, options, rng, &mut members);

        let mut union = Self {
            members,
            log_volume: f64::NAN,
            rule: options.rule,
        };
        union.log_volume = union.estimate_log_volume(rng);
        Ok(union)
    }

    /// Wraps a single ellipsoid (the degeneracy fallback path).
    pub fn from_ellipsoid(ellipsoid: Ellipsoid, rule: OverlapRule) -> Self {
        let log_volume = ellipsoid.log_volume();
        Self {
            members: vec![ellipsoid],
            log_volume,
            rule,
        }
    }

    pub fn members(&self) -> &[Ellipsoid] {
        &self.members
    }

    /// Overlap-corrected log-volume of the union.
    pub fn log_volume(&self) -> f64 {
        self.log_volume
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        self.members.iter().any(|e| e.contains(x))
    }

    /// Number of member ellipsoids covering `x`.
    fn multiplicity(&self, x: &[f64]) -> usize {
        self.members.iter().filter(|e| e.contains(x)).count()
    }

    /// Draws one point uniformly over the union: component chosen by volume
    /// share, candidate resampled according to the overlap rule.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        if self.members.len() == 1 {
            return self.members[0].sample(rng);
        }
        let cumulative = self.volume_shares();
        loop {
            let k = pick_weighted(&cumulative, rng);
            let x = self.members[k].sample(rng);
            match self.rule {
                OverlapRule::Reciprocal => {
                    let q = self.multiplicity(&x);
                    if q <= 1 || rng.gen::<f64>() < 1.0 / q as f64 {
                        return x;
                    }
                }
                OverlapRule::First => {
                    let first = self
                        .members
                        .iter()
                        .position(|e| e.contains(&x))
                        .unwrap_or(k);
                    if first == k {
                        return x;
                    }
                }
            }
        }
    }

    /// A restartable lazy stream of uniform draws from the union. The same
    /// `seed` reproduces the same sequence.
    pub fn sample_iter(&self, seed: u64) -> UnionSampler<'_> {
        UnionSampler {
            union: self,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Cumulative volume shares of the members, for weighted component picks.
    fn volume_shares(&self) -> Vec<f64> {
        let logs: Vec<f64> = self.members.iter().map(|e| e.log_volume()).collect();
        let total = logsumexp(&logs);
        let mut cumulative = Vec::with_capacity(logs.len());
        let mut acc = 0.0;
        for l in &logs {
            acc += (l - total).exp();
            cumulative.push(acc);
        }
        cumulative
    }

    /// Monte Carlo union volume: sum of member volumes times the expected
    /// reciprocal multiplicity of volume-weighted draws.
    fn estimate_log_volume(&self, rng: &mut SmallRng) -> f64 {
        let logs: Vec<f64> = self.members.iter().map(|e| e.log_volume()).collect();
        let log_sum = logsumexp(&logs);
        if self.members.len() == 1 {
            return log_sum;
        }
        let cumulative = self.volume_shares();
        let mut acc = 0.0;
        for _ in 0..VOLUME_DRAWS {
            let k = pick_weighted(&cumulative, rng);
            let x = self.members[k].sample(rng);
            acc += 1.0 / self.multiplicity(&x) as f64;
        }
        log_sum + (acc / VOLUME_DRAWS as f64).ln()
    }
}

/// Lazy, finite-on-demand, restartable sequence of union draws.
pub struct UnionSampler<'a> {
    union: &'a EllipsoidUnion,
    rng: SmallRng,
}

impl Iterator for UnionSampler<'_> {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Vec<f64>> {
        Some(self.union.sample(&mut self.rng))
    }
}

fn pick_weighted<R: Rng>(cumulative: &[f64], rng: &mut R) -> usize {
    let r: f64 = rng.gen();
    cumulative
        .iter()
        .position(|&c| r < c)
        .unwrap_or(cumulative.len() - 1)
}

fn split_recursive(
    points: Vec<Vec<f64>>,
    ellipsoid: Ellipsoid,
    n_total: usize,
    options: &FitOptions,
    rng: &mut SmallRng,
    out: &mut Vec<Ellipsoid>,
) {
    if points.len() >= 2 * options.n_points_min && split_worthwhile(&points, &ellipsoid, n_total, options) {
        if let Some((left, right)) = two_means(&points, rng) {
            if left.len() >= options.n_points_min && right.len() >= options.n_points_min {
                if let (Ok(ell_l), Ok(ell_r)) = (
                    Ellipsoid::fit(&left, options.enlarge_per_dim),
                    Ellipsoid::fit(&right, options.enlarge_per_dim),
                ) {
                    let combined = logsumexp(&[ell_l.log_volume(), ell_r.log_volume()]);
                    if combined < ellipsoid.log_volume() {
                        split_recursive(left, ell_l, n_total, options, rng, out);
                        split_recursive(right, ell_r, n_total, options, rng, out);
                        return;
                    }
                }
            }
        }
    }
    out.push(ellipsoid);
}

/// Gate on the ratio of bounding volume to the cloud's share of the target
/// occupied volume.
fn split_worthwhile(
    points: &[Vec<f64>],
    ellipsoid: &Ellipsoid,
    n_total: usize,
    options: &FitOptions,
) -> bool {
    match options.log_volume_target {
        Some(target) => {
            let share = target + (points.len() as f64 / n_total as f64).ln();
            ellipsoid.log_volume() > share + options.split_threshold.ln()
        }
        None => true,
    }
}

/// One round of 2-means: centers seeded with the two mutually farthest-ish
/// points, then a few Lloyd iterations. Returns `None` when a cluster runs
/// empty.
fn two_means(points: &[Vec<f64>], rng: &mut SmallRng) -> Option<(Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    let start = rng.gen_range(0..points.len());
    let c1_idx = farthest_from(points, &points[start]);
    let c2_idx = farthest_from(points, &points[c1_idx]);
    if c1_idx == c2_idx {
        return None;
    }
    let mut c1 = points[c1_idx].clone();
    let mut c2 = points[c2_idx].clone();

    let mut assignment = vec![false; points.len()];
    for _ in 0..10 {
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let to_second = distance_sq(p, &c2) < distance_sq(p, &c1);
            if assignment[i] != to_second {
                assignment[i] = to_second;
                changed = true;
            }
        }
        let left: Vec<Vec<f64>> = points
            .iter()
            .zip(&assignment)
            .filter(|(_, &a)| !a)
            .map(|(p, _)| p.clone())
            .collect();
        let right: Vec<Vec<f64>> = points
            .iter()
            .zip(&assignment)
            .filter(|(_, &a)| a)
            .map(|(p, _)| p.clone())
            .collect();
        if left.is_empty() || right.is_empty() {
            return None;
        }
        c1 = centroid(&left).iter().copied().collect();
        c2 = centroid(&right).iter().copied().collect();
        if !changed {
            break;
        }
    }

    let left: Vec<Vec<f64>> = points
        .iter()
        .zip(&assignment)
        .filter(|(_, &a)| !a)
        .map(|(p, _)| p.clone())
        .collect();
    let right: Vec<Vec<f64>> = points
        .iter()
        .zip(&assignment)
        .filter(|(_, &a)| a)
        .map(|(p, _)| p.clone())
        .collect();
    if left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left, right))
}

fn farthest_from(points: &[Vec<f64>], origin: &[f64]) -> usize {
    let mut best = 0;
    let mut best_d = -1.0;
    for (i, p) in points.iter().enumerate() {
        let d = distance_sq(p, origin);
        if d > best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, StandardNormal};

    fn options(n_points_min: usize) -> FitOptions {
        FitOptions {
            enlarge_per_dim: 1.1,
            n_points_min,
            split_threshold: 1.0,
            log_volume_target: None,
            rule: OverlapRule::Reciprocal,
        }
    }

    /// Two well-separated blobs along the first axis.
    fn dumbbell(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let offset = if i % 2 == 0 { -5.0 } else { 5.0 };
                let x: f64 = StandardNormal.sample(&mut rng);
                let y: f64 = StandardNormal.sample(&mut rng);
                vec![offset + 0.1 * x, 0.1 * y]
            })
            .collect()
    }

    #[test]
    fn union_covers_all_input_points() {
        let points = dumbbell(300, 5);
        let mut rng = SmallRng::seed_from_u64(0);
        let union = EllipsoidUnion::fit(&points, &options(30), &mut rng).unwrap();
        for p in &points {
            assert!(union.contains(p));
        }
    }

    #[test]
    fn dumbbell_splits_into_smaller_volume() {
        let points = dumbbell(300, 6);
        let mut rng = SmallRng::seed_from_u64(1);
        let single = Ellipsoid::fit(&points, 1.1).unwrap();
        let union = EllipsoidUnion::fit(&points, &options(30), &mut rng).unwrap();
        assert!(union.members().len() >= 2, "dumbbell should split");
        assert!(union.log_volume() < single.log_volume());
    }

    #[test]
    fn split_rejected_below_member_minimum() {
        let points = dumbbell(60, 7);
        let mut rng = SmallRng::seed_from_u64(2);
        let union = EllipsoidUnion::fit(&points, &options(50), &mut rng).unwrap();
        assert_eq!(union.members().len(), 1);
    }

    #[test]
    fn samples_stay_inside_union() {
        let points = dumbbell(300, 8);
        let mut rng = SmallRng::seed_from_u64(3);
        let union = EllipsoidUnion::fit(&points, &options(30), &mut rng).unwrap();
        for x in union.sample_iter(42).take(500) {
            assert!(union.contains(&x));
        }
    }

    #[test]
    fn sample_iter_is_restartable() {
        let points = dumbbell(200, 9);
        let mut rng = SmallRng::seed_from_u64(4);
        let union = EllipsoidUnion::fit(&points, &options(30), &mut rng).unwrap();
        let a: Vec<Vec<f64>> = union.sample_iter(99).take(20).collect();
        let b: Vec<Vec<f64>> = union.sample_iter(99).take(20).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn overlap_sampling_balances_modes() {
        let points = dumbbell(400, 10);
        let mut rng = SmallRng::seed_from_u64(5);
        let union = EllipsoidUnion::fit(&points, &options(30), &mut rng).unwrap();
        if union.members().len() < 2 {
            return;
        }
        let n = 4000;
        let left = union
            .sample_iter(123)
            .take(n)
            .filter(|x| x[0] < 0.0)
            .count();
        let share = left as f64 / n as f64;
        assert!(
            (share - 0.5).abs() < 0.1,
            "expected balanced draws over equal-volume modes, got {share}"
        );
    }
}
