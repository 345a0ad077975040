use serde::{Serialize, Deserialize};

use crate::math::matrix::Matrix;

/// Lower clip applied to every probability before a logarithm.
pub const PROB_MIN: f64 = 1.0e-38;
/// Upper clip applied to every probability before a logarithm.
pub const PROB_MAX: f64 = 1.0e20;

/// How the flat pre-activation rows are turned into the layer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationFunction {
    /// Row-wise softmax over the class axis.
    Softmax,
    /// Raw scores; used for regression-style losses.
    Identity,
}

impl ActivationFunction {
    /// Applies the activation to every row of `m`.
    pub fn apply_rows(&self, m: &Matrix) -> Matrix {
        match self {
            ActivationFunction::Softmax => Matrix {
                rows: m.rows,
                cols: m.cols,
                data: m.data.iter().map(|row| softmax(row)).collect(),
            },
            ActivationFunction::Identity => m.clone(),
        }
    }
}

/// Numerically stable softmax of one row.
pub fn softmax(row: &[f64]) -> Vec<f64> {
    let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let n = row.len().max(1) as f64;
        return vec![1.0 / n; row.len()];
    }
    let exps: Vec<f64> = row.iter().map(|x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// `log(Σ exp(x))`, shifted by the maximum. Returns -inf for an empty or all -inf input.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Row-wise log-softmax: `x - log Σ exp(x)`.
pub fn log_softmax(row: &[f64]) -> Vec<f64> {
    let lse = log_sum_exp(row);
    row.iter().map(|x| x - lse).collect()
}

/// `ln(clip(p, PROB_MIN, PROB_MAX))`.
pub fn clipped_ln(p: f64) -> f64 {
    p.clamp(PROB_MIN, PROB_MAX).ln()
}
