//! Numeric comparison and deterministic data helpers.

use crate::backend::ReferenceEvaluator;
use crate::config::{OperatorDesc, Tensor, TuningTask};
use anyhow::Result;
use ndarray::IxDyn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Approximate-equality tolerance, `|actual - expect| <= atol + rtol * |expect|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f32,
    pub atol: f32,
    pub equal_nan: bool,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 5e-3,
            atol: 5e-3,
            equal_nan: true,
        }
    }
}

impl Tolerance {
    pub fn close(&self, actual: f32, expect: f32) -> bool {
        if actual.is_nan() || expect.is_nan() {
            return self.equal_nan && actual.is_nan() && expect.is_nan();
        }
        if actual.is_infinite() || expect.is_infinite() {
            return actual == expect;
        }
        (actual - expect).abs() <= self.atol + self.rtol * expect.abs()
    }
}

/// Element-wise comparison with NumPy broadcasting. Shapes that cannot be
/// broadcast together never match.
pub fn allclose(actual: &Tensor, expect: &Tensor, tolerance: &Tolerance) -> bool {
    if actual.shape() == expect.shape() {
        return actual
            .iter()
            .zip(expect.iter())
            .all(|(a, e)| tolerance.close(*a, *e));
    }
    let Some(shape) = broadcast_shape(actual.shape(), expect.shape()) else {
        return false;
    };
    match (actual.broadcast(IxDyn(&shape)), expect.broadcast(IxDyn(&shape))) {
        (Some(actual), Some(expect)) => actual
            .iter()
            .zip(expect.iter())
            .all(|(a, e)| tolerance.close(*a, *e)),
        _ => false,
    }
}

/// Shapes are aligned from the trailing axis; a length of 1 stretches.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let len_at = |shape: &[usize], axis: usize| {
        (axis + shape.len())
            .checked_sub(rank)
            .map_or(1, |i| shape[i])
    };
    (0..rank)
        .map(|axis| match (len_at(a, axis), len_at(b, axis)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Conjunctive comparison over every output tensor.
pub fn outputs_match(actual: &[Tensor], expect: &[Tensor], tolerance: &Tolerance) -> bool {
    if actual.len() != expect.len() {
        return false;
    }
    actual
        .par_iter()
        .zip(expect.par_iter())
        .all(|(a, e)| allclose(a, e, tolerance))
}

/// Seeded uniform tensor in `[-1, 1)`.
pub fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
    let mut rng = fastrand::Rng::with_seed(seed);
    Tensor::from_shape_fn(IxDyn(shape), |_| rng.f32() * 2.0 - 1.0)
}

/// Build a task from generated inputs and the reference evaluator's outputs.
pub fn generate_task(
    op: OperatorDesc,
    input_shapes: &[Vec<usize>],
    seed: u64,
    reference: &dyn ReferenceEvaluator,
) -> Result<TuningTask> {
    let inputs: Vec<Tensor> = input_shapes
        .iter()
        .enumerate()
        .map(|(idx, shape)| random_tensor(shape, seed.wrapping_add(idx as u64)))
        .collect();
    let expect = reference.evaluate(&op, &inputs)?;
    Ok(TuningTask::new(op, inputs, expect))
}
