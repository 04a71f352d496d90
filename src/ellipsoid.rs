//! Single bounding ellipsoids.
//!
//! An [`Ellipsoid`] is stored as a center plus the affine map taking the unit
//! ball onto it (and its inverse). Fitting uses the empirical covariance of
//! the point cloud, rescaled so every input point sits at Mahalanobis radius
//! ≤ 1 and then inflated by `enlarge_per_dim` along every axis.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Raised internally when a point cloud has no usable covariance (too few
/// points, identical points, or a singular covariance). Callers recover by
/// switching to [`Ellipsoid::ball`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degenerate;

/// Log-volume of the d-dimensional unit ball.
pub fn log_ball_volume(ndim: usize) -> f64 {
    let half_d = ndim as f64 / 2.0;
    half_d * std::f64::consts::PI.ln() - ln_gamma(half_d + 1.0)
}

/// A d-dimensional ellipsoid `{ c + T u : |u| <= 1 }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ellipsoid {
    center: DVector<f64>,
    /// Maps the unit ball onto the ellipsoid.
    transform: DMatrix<f64>,
    /// Maps the ellipsoid back onto the unit ball.
    inverse: DMatrix<f64>,
    log_volume: f64,
}

impl Ellipsoid {
    /// Fits a bounding ellipsoid to `points` via the point covariance.
    ///
    /// The shape matrix is the empirical covariance scaled so all points lie
    /// at radius ≤ 1, then enlarged by `enlarge_per_dim` per axis. Fails with
    /// [`Degenerate`] when the covariance is singular or there are not enough
    /// points to estimate it.
    pub fn fit(points: &[Vec<f64>], enlarge_per_dim: f64) -> Result<Self, Degenerate> {
        let n = points.len();
        if n < 2 {
            return Err(Degenerate);
        }
        let ndim = points[0].len();
        if n <= ndim {
            return Err(Degenerate);
        }

        let center = centroid(points);
        let mut cov = DMatrix::<f64>::zeros(ndim, ndim);
        for p in points {
            let diff = DVector::from_row_slice(p) - &center;
            cov += &diff * diff.transpose();
        }
        cov /= (n - 1) as f64;

        let eigen = SymmetricEigen::new(cov);
        let max_eig = eigen.eigenvalues.max();
        if !(max_eig > 0.0) {
            return Err(Degenerate);
        }
        // Relative cutoff on the spectrum; flatter directions mean the cloud
        // does not span the space.
        if eigen.eigenvalues.iter().any(|&l| l <= max_eig * 1e-12) {
            return Err(Degenerate);
        }

        let axes = eigen.eigenvalues.map(|l| l.sqrt());
        let vectors = eigen.eigenvectors;
        let transform0 = &vectors * DMatrix::from_diagonal(&axes);
        let inverse0 = DMatrix::from_diagonal(&axes.map(|a| 1.0 / a)) * vectors.transpose();

        // Rescale so the farthest point sits exactly on the boundary.
        let mut r_max_sq: f64 = 0.0;
        for p in points {
            let u = &inverse0 * (DVector::from_row_slice(p) - &center);
            r_max_sq = r_max_sq.max(u.norm_squared());
        }
        if !(r_max_sq > 0.0) {
            return Err(Degenerate);
        }
        let scale = r_max_sq.sqrt() * enlarge_per_dim;

        let log_volume = log_ball_volume(ndim)
            + ndim as f64 * scale.ln()
            + axes.iter().map(|a| a.ln()).sum::<f64>();

        Ok(Self {
            center,
            transform: transform0 * scale,
            inverse: inverse0 / scale,
            log_volume,
        })
    }

    /// A sphere covering `points`, the recovery path for degenerate clouds.
    ///
    /// The radius is the largest center distance (floored away from zero so
    /// identical points still yield a sampleable bound), enlarged per axis.
    pub fn ball(points: &[Vec<f64>], enlarge_per_dim: f64) -> Self {
        let ndim = points[0].len();
        let center = centroid(points);
        let mut r_max: f64 = 0.0;
        for p in points {
            let diff = DVector::from_row_slice(p) - &center;
            r_max = r_max.max(diff.norm());
        }
        let radius = r_max.max(1e-6) * enlarge_per_dim;
        let log_volume = log_ball_volume(ndim) + ndim as f64 * radius.ln();
        Self {
            center,
            transform: DMatrix::identity(ndim, ndim) * radius,
            inverse: DMatrix::identity(ndim, ndim) / radius,
            log_volume,
        }
    }

    pub fn ndim(&self) -> usize {
        self.center.len()
    }

    pub fn log_volume(&self) -> f64 {
        self.log_volume
    }

    /// Squared Mahalanobis radius of `x` under this ellipsoid.
    pub fn radius_squared(&self, x: &[f64]) -> f64 {
        let u = &self.inverse * (DVector::from_row_slice(x) - &self.center);
        u.norm_squared()
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        self.radius_squared(x) <= 1.0 + 1e-9
    }

    /// Draws one point uniformly inside the ellipsoid: a uniform unit-ball
    /// draw (Gaussian direction, radius `U^(1/d)`) pushed through the shape
    /// transform.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        let ndim = self.ndim();
        let mut direction = DVector::<f64>::zeros(ndim);
        for i in 0..ndim {
            direction[i] = StandardNormal.sample(rng);
        }
        let norm = direction.norm();
        if norm > 0.0 {
            direction /= norm;
        }
        let radius: f64 = rng.gen::<f64>().powf(1.0 / ndim as f64);
        let x = &self.center + &self.transform * (direction * radius);
        x.iter().copied().collect()
    }
}

pub(crate) fn centroid(points: &[Vec<f64>]) -> DVector<f64> {
    let ndim = points[0].len();
    let mut center = DVector::<f64>::zeros(ndim);
    for p in points {
        center += DVector::from_row_slice(p);
    }
    center / points.len() as f64
}
