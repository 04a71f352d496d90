//! Batch likelihood evaluation.
//!
//! The engine submits a whole batch and blocks until every result is back;
//! it never observes partial batches. Any unusable value (NaN or +inf) fails
//! the batch as a whole. `-inf` is a legitimate likelihood (zero density).

use rayon::prelude::*;

use crate::error::{Error, Result};

/// A collaborator that evaluates a batch of parameter vectors, possibly in
/// parallel. All-or-nothing: a single bad evaluation fails the whole batch.
pub trait BatchExecutor: Send + Sync {
    fn map_batch(
        &self,
        f: &(dyn Fn(&[f64]) -> f64 + Sync),
        inputs: &[Vec<f64>],
    ) -> Result<Vec<f64>>;
}

/// Data-parallel executor over the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonExecutor;

impl BatchExecutor for RayonExecutor {
    fn map_batch(
        &self,
        f: &(dyn Fn(&[f64]) -> f64 + Sync),
        inputs: &[Vec<f64>],
    ) -> Result<Vec<f64>> {
        let out: Vec<f64> = inputs.par_iter().map(|x| f(x)).collect();
        validate(&out)?;
        Ok(out)
    }
}

/// Single-threaded executor, mainly for deterministic debugging.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialExecutor;

impl BatchExecutor for SerialExecutor {
    fn map_batch(
        &self,
        f: &(dyn Fn(&[f64]) -> f64 + Sync),
        inputs: &[Vec<f64>],
    ) -> Result<Vec<f64>> {
        let out: Vec<f64> = inputs.iter().map(|x| f(x)).collect();
        validate(&out)?;
        Ok(out)
    }
}

fn validate(values: &[f64]) -> Result<()> {
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() || v == f64::INFINITY {
            return Err(Error::LikelihoodEvaluation(format!(
                "batch entry {i} returned {v}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_executor_preserves_order() {
        let inputs: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64]).collect();
        let out = RayonExecutor
            .map_batch(&|x: &[f64]| -x[0], &inputs)
            .unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(out[99], -99.0);
    }

    #[test]
    fn nan_fails_the_whole_batch() {
        let inputs = vec![vec![0.0], vec![1.0]];
        let result = SerialExecutor.map_batch(
            &|x: &[f64]| if x[0] > 0.5 { f64::NAN } else { 0.0 },
            &inputs,
        );
        assert!(matches!(result, Err(Error::LikelihoodEvaluation(_))));
    }

    #[test]
    fn negative_infinity_is_a_valid_likelihood() {
        let inputs = vec![vec![0.0]];
        let out = SerialExecutor
            .map_batch(&|_: &[f64]| f64::NEG_INFINITY, &inputs)
            .unwrap();
        assert_eq!(out[0], f64::NEG_INFINITY);
    }
}
