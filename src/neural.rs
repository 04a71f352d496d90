//! Neural boundary classifier.
//!
//! Ellipsoidal bounds overestimate curved or non-convex likelihood contours.
//! A small ensemble of feed-forward binary classifiers is trained on points
//! known to lie above/below the current shell threshold and trims the
//! sampling region inside the geometric bound. Training runs full-batch
//! gradient descent with momentum through `burn`'s autodiff; weights live in
//! plain vectors so the ensemble serializes into checkpoints.

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::Backend;
use burn::tensor::{activation, Tensor, TensorData};
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::VotePolicy;

type Auto = Autodiff<NdArray>;
type Inner = NdArray;

/// Hidden layer widths of each ensemble member.
const HIDDEN: [usize; 2] = [32, 32];
const EPOCHS: usize = 200;
const LEARNING_RATE: f64 = 0.1;
const MOMENTUM: f64 = 0.9;
/// Training is skipped when either class is smaller than this.
const MIN_CLASS_SIZE: usize = 32;
/// Quantile of inside-class scores used to calibrate the acceptance cutoff,
/// so (almost) no known-inside point is rejected.
const THRESHOLD_QUANTILE: f64 = 0.05;

/// One dense layer, stored row-major `[fan_in, fan_out]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerParams {
    weight: Vec<f32>,
    bias: Vec<f32>,
    fan_in: usize,
    fan_out: usize,
}

/// A single trained member network.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Network {
    layers: Vec<LayerParams>,
}

/// An ensemble of independently initialized classifiers plus the input
/// standardization moments and the calibrated score cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierEnsemble {
    networks: Vec<Network>,
    mean: Vec<f64>,
    std: Vec<f64>,
    threshold: f64,
    vote_policy: VotePolicy,
}

impl ClassifierEnsemble {
    /// Trains `n_networks` classifiers separating `inside` from `outside`.
    ///
    /// Returns `None` (callers fall back to the pure geometric bound) when
    /// either class is too small to train on.
    pub fn train(
        inside: &[Vec<f64>],
        outside: &[Vec<f64>],
        n_networks: usize,
        vote_policy: VotePolicy,
        rng: &mut SmallRng,
    ) -> Option<Self> {
        if n_networks == 0 || inside.len() < MIN_CLASS_SIZE || outside.len() < MIN_CLASS_SIZE {
            return None;
        }
        let ndim = inside[0].len();
        let (mean, std) = moments(inside.iter().chain(outside.iter()), ndim);

        let n = inside.len() + outside.len();
        let mut flat = Vec::with_capacity(n * ndim);
        let mut labels = Vec::with_capacity(n);
        for p in inside {
            flat.extend(standardize(p, &mean, &std));
            labels.push(1.0f32);
        }
        for p in outside {
            flat.extend(standardize(p, &mean, &std));
            labels.push(0.0f32);
        }

        let device = Default::default();
        let x = Tensor::<Auto, 2>::from_data(TensorData::new(flat, [n, ndim]), &device);
        let y = Tensor::<Auto, 1>::from_data(TensorData::new(labels, [n]), &device);

        let networks: Vec<Network> = (0..n_networks)
            .map(|_| train_network(x.clone(), y.clone(), ndim, rng))
            .collect();

        let mut ensemble = Self {
            networks,
            mean,
            std,
            threshold: 0.5,
            vote_policy,
        };

        // Calibrate the cutoff so the inside class stays inside.
        let scores = ensemble.mean_scores(inside);
        ensemble.threshold = quantile(&scores, THRESHOLD_QUANTILE).min(0.5);
        Some(ensemble)
    }

    /// Mean ensemble score for each point (1 ≈ inside, 0 ≈ outside).
    pub fn mean_scores(&self, points: &[Vec<f64>]) -> Vec<f64> {
        let per_member = self.member_scores(points);
        let mut out = vec![0.0; points.len()];
        for scores in &per_member {
            for (o, s) in out.iter_mut().zip(scores) {
                *o += *s / self.networks.len() as f64;
            }
        }
        out
    }

    /// Ensemble acceptance for each point under the configured vote policy.
    pub fn predict_batch(&self, points: &[Vec<f64>]) -> Vec<bool> {
        let per_member = self.member_scores(points);
        (0..points.len())
            .map(|i| {
                let votes = per_member
                    .iter()
                    .filter(|scores| scores[i] >= self.threshold)
                    .count();
                match self.vote_policy {
                    VotePolicy::Majority => 2 * votes > self.networks.len(),
                    VotePolicy::Unanimous => votes == self.networks.len(),
                }
            })
            .collect()
    }

    pub fn predict(&self, point: &[f64]) -> bool {
        self.predict_batch(std::slice::from_ref(&point.to_vec()))[0]
    }

    fn member_scores(&self, points: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = points.len();
        let ndim = self.mean.len();
        let mut flat = Vec::with_capacity(n * ndim);
        for p in points {
            flat.extend(standardize(p, &self.mean, &self.std));
        }
        let device = Default::default();
        let x = Tensor::<Inner, 2>::from_data(TensorData::new(flat, [n, ndim]), &device);

        self.networks
            .iter()
            .map(|net| {
                let (ws, bs) = net.tensors::<Inner>();
                let scores = forward(x.clone(), &ws, &bs);
                scores
                    .into_data()
                    .to_vec::<f32>()
                    .expect("score tensor readback")
                    .into_iter()
                    .map(f64::from)
                    .collect()
            })
            .collect()
    }
}

impl Network {
    fn tensors<B: Backend>(&self) -> (Vec<Tensor<B, 2>>, Vec<Tensor<B, 1>>) {
        let device = Default::default();
        let mut ws = Vec::with_capacity(self.layers.len());
        let mut bs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            ws.push(Tensor::from_data(
                TensorData::new(layer.weight.clone(), [layer.fan_in, layer.fan_out]),
                &device,
            ));
            bs.push(Tensor::from_data(
                TensorData::new(layer.bias.clone(), [layer.fan_out]),
                &device,
            ));
        }
        (ws, bs)
    }
}

/// Forward pass: dense layers with ReLU between them and a sigmoid head.
fn forward<B: Backend>(x: Tensor<B, 2>, ws: &[Tensor<B, 2>], bs: &[Tensor<B, 1>]) -> Tensor<B, 1> {
    let mut h = x;
    let last = ws.len() - 1;
    for (i, (w, b)) in ws.iter().zip(bs).enumerate() {
        h = h.matmul(w.clone()) + b.clone().unsqueeze();
        if i < last {
            h = activation::relu(h);
        }
    }
    activation::sigmoid(h).squeeze(1)
}

fn binary_cross_entropy(p: Tensor<Auto, 1>, y: Tensor<Auto, 1>) -> Tensor<Auto, 1> {
    let p = p.clamp(1e-7, 1.0 - 1e-7);
    let ones = p.ones_like();
    -(y.clone() * p.clone().log() + (ones.clone() - y) * (ones - p).log()).mean()
}

/// Trains one member by full-batch gradient descent with momentum, in the
/// same low-level autodiff style as the leapfrog gradient extraction: tag
/// parameters with `require_grad`, `backward()` the loss, pull gradients per
/// tensor, step on the inner backend.
fn train_network(x: Tensor<Auto, 2>, y: Tensor<Auto, 1>, ndim: usize, rng: &mut SmallRng) -> Network {
    let device = Default::default();
    let sizes = [ndim, HIDDEN[0], HIDDEN[1], 1];

    let mut ws: Vec<Tensor<Auto, 2>> = Vec::new();
    let mut bs: Vec<Tensor<Auto, 1>> = Vec::new();
    for pair in sizes.windows(2) {
        let (fan_in, fan_out) = (pair[0], pair[1]);
        let a = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let weight: Vec<f32> = (0..fan_in * fan_out)
            .map(|_| rng.gen_range(-a..a) as f32)
            .collect();
        ws.push(
            Tensor::from_data(TensorData::new(weight, [fan_in, fan_out]), &device).require_grad(),
        );
        bs.push(
            Tensor::from_data(TensorData::new(vec![0.0f32; fan_out], [fan_out]), &device)
                .require_grad(),
        );
    }

    let mut vw: Vec<Tensor<Inner, 2>> = ws.iter().map(|w| w.clone().inner().zeros_like()).collect();
    let mut vb: Vec<Tensor<Inner, 1>> = bs.iter().map(|b| b.clone().inner().zeros_like()).collect();

    for _ in 0..EPOCHS {
        let p = forward(x.clone(), &ws, &bs);
        let loss = binary_cross_entropy(p, y.clone());
        let grads = loss.backward();
        for i in 0..ws.len() {
            if let Some(g) = ws[i].grad(&grads) {
                vw[i] = vw[i].clone().mul_scalar(MOMENTUM) + g;
                ws[i] = Tensor::from_inner(
                    ws[i].clone().inner() - vw[i].clone().mul_scalar(LEARNING_RATE),
                )
                .require_grad();
            }
            if let Some(g) = bs[i].grad(&grads) {
                vb[i] = vb[i].clone().mul_scalar(MOMENTUM) + g;
                bs[i] = Tensor::from_inner(
                    bs[i].clone().inner() - vb[i].clone().mul_scalar(LEARNING_RATE),
                )
                .require_grad();
            }
        }
    }

    let layers = ws
        .iter()
        .zip(&bs)
        .zip(sizes.windows(2))
        .map(|((w, b), pair)| LayerParams {
            weight: w
                .clone()
                .inner()
                .into_data()
                .to_vec::<f32>()
                .expect("weight readback"),
            bias: b
                .clone()
                .inner()
                .into_data()
                .to_vec::<f32>()
                .expect("bias readback"),
            fan_in: pair[0],
            fan_out: pair[1],
        })
        .collect();
    Network { layers }
}

fn moments<'a>(points: impl Iterator<Item = &'a Vec<f64>>, ndim: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mean = vec![0.0; ndim];
    let mut mean_sq = vec![0.0; ndim];
    let mut n = 0usize;
    for p in points {
        n += 1;
        for j in 0..ndim {
            mean[j] += p[j];
            mean_sq[j] += p[j] * p[j];
        }
    }
    for j in 0..ndim {
        mean[j] /= n as f64;
        let var = (mean_sq[j] / n as f64 - mean[j] * mean[j]).max(0.0);
        mean_sq[j] = var.sqrt().max(1e-8);
    }
    (mean, mean_sq)
}

fn standardize(p: &[f64], mean: &[f64], std: &[f64]) -> Vec<f32> {
    p.iter()
        .zip(mean.iter().zip(std))
        .map(|(x, (m, s))| ((x - m) / s) as f32)
        .collect()
}

fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Inside class: points with radius < 1. Outside class: radius in (1, 2).
    fn annulus_data(n: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut inside = Vec::new();
        let mut outside = Vec::new();
        while inside.len() < n || outside.len() < n {
            let x: f64 = rng.gen_range(-2.0..2.0);
            let y: f64 = rng.gen_range(-2.0..2.0);
            let r = (x * x + y * y).sqrt();
            if r < 0.9 && inside.len() < n {
                inside.push(vec![x, y]);
            } else if r > 1.1 && r < 2.0 && outside.len() < n {
                outside.push(vec![x, y]);
            }
        }
        (inside, outside)
    }

    #[test]
    fn skips_training_on_tiny_classes() {
        let inside = vec![vec![0.0, 0.0]; 5];
        let outside = vec![vec![1.0, 1.0]; 100];
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(
            ClassifierEnsemble::train(&inside, &outside, 4, VotePolicy::Majority, &mut rng)
                .is_none()
        );
    }

    #[test]
    fn zero_networks_disables_refinement() {
        let (inside, outside) = annulus_data(64, 1);
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(
            ClassifierEnsemble::train(&inside, &outside, 0, VotePolicy::Majority, &mut rng)
                .is_none()
        );
    }

    #[test]
    fn separates_circle_from_annulus() {
        let (inside, outside) = annulus_data(200, 2);
        let mut rng = SmallRng::seed_from_u64(2);
        let ensemble =
            ClassifierEnsemble::train(&inside, &outside, 2, VotePolicy::Majority, &mut rng)
                .expect("enough data to train");

        // Nearly all inside-class points must stay accepted; that is what the
        // calibrated cutoff is for.
        let kept = ensemble.predict_batch(&inside).iter().filter(|&&b| b).count();
        assert!(
            kept as f64 >= 0.9 * inside.len() as f64,
            "only {kept}/{} inside points kept",
            inside.len()
        );

        // A clear majority of far-outside points should be rejected.
        let far: Vec<Vec<f64>> = outside
            .iter()
            .filter(|p| (p[0] * p[0] + p[1] * p[1]).sqrt() > 1.5)
            .cloned()
            .collect();
        let rejected = ensemble.predict_batch(&far).iter().filter(|&&b| !b).count();
        assert!(
            rejected as f64 >= 0.6 * far.len() as f64,
            "only {rejected}/{} far points rejected",
            far.len()
        );
    }

    #[test]
    fn training_is_deterministic_for_a_seed() {
        let (inside, outside) = annulus_data(100, 3);
        let train = |seed| {
            let mut rng = SmallRng::seed_from_u64(seed);
            ClassifierEnsemble::train(&inside, &outside, 2, VotePolicy::Majority, &mut rng)
                .unwrap()
                .mean_scores(&inside)
        };
        assert_eq!(train(7), train(7));
    }
}
