use crate::activation::activation::{clipped_ln, softmax, PROB_MAX, PROB_MIN};
use crate::math::matrix::Matrix;

/// Cross-entropy on prior-normalized posteriors, `p(c|x) / prior[c]`.
///
/// The prior is a positive per-class vector trained jointly with the layer.
/// The loss is not scaled by the truncation norm.
pub struct PrioriLoss;

impl PrioriLoss {
    /// Row-wise `softmax(z) / prior`.
    pub fn probabilities(logits: &Matrix, prior: &[f64]) -> Matrix {
        Matrix {
            rows: logits.rows,
            cols: logits.cols,
            data: logits.data.iter()
                .map(|row| softmax(row).iter().zip(prior.iter()).map(|(p, q)| p / q).collect())
                .collect(),
        }
    }

    /// L = -Σ_i log(clip(softmax(z_i)[y_i] / prior[y_i]))
    pub fn loss(logits: &Matrix, prior: &[f64], rows: &[usize], labels: &[usize]) -> f64 {
        rows.iter().zip(labels.iter())
            .map(|(&r, &y)| -clipped_ln(softmax(logits.row(r))[y] / prior[y]))
            .sum()
    }

    /// Gradients w.r.t. the logits and the prior. Positions whose scaled
    /// probability sits in the clip region contribute nothing.
    ///
    ///   ∂L/∂z_i     = softmax(z_i) - onehot(y_i)
    ///   ∂L/∂prior_c = Σ_{i: y_i = c} 1 / prior_c
    pub fn derivative(
        logits: &Matrix,
        prior: &[f64],
        rows: &[usize],
        labels: &[usize],
    ) -> (Matrix, Vec<f64>) {
        let mut d_logits = Matrix::zeros(logits.rows, logits.cols);
        let mut d_prior = vec![0.0; prior.len()];
        for (&r, &y) in rows.iter().zip(labels.iter()) {
            let mut p = softmax(logits.row(r));
            let scaled = p[y] / prior[y];
            if !(PROB_MIN..=PROB_MAX).contains(&scaled) {
                continue;
            }
            p[y] -= 1.0;
            d_logits.data[r] = p;
            d_prior[y] += 1.0 / prior[y];
        }
        (d_logits, d_prior)
    }
}
