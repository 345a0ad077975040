use crate::activation::activation::{clipped_ln, log_softmax, softmax, PROB_MIN};
use crate::math::matrix::Matrix;

/// Softmax cross-entropy restricted to a set of flat positions.
///
/// `logits` is the flat (time×batch, classes) pre-activation; `rows` are the
/// valid positions and `labels[i]` is the class of `rows[i]`.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Combined softmax + negative log-likelihood:
    ///   L = Σ_i -log softmax(z_i)[y_i]
    ///
    /// Computed in the log domain; the per-position term is capped at
    /// `-ln(1e-38)`, matching the probability clip used everywhere else.
    pub fn loss(logits: &Matrix, rows: &[usize], labels: &[usize]) -> f64 {
        let floor = PROB_MIN.ln();
        rows.iter().zip(labels.iter())
            .map(|(&r, &y)| -log_softmax(logits.row(r))[y].max(floor))
            .sum()
    }

    /// Gradient of [`CrossEntropyLoss::loss`] w.r.t. the logits:
    ///   ∂L/∂z_i = softmax(z_i) - onehot(y_i)   on the given rows, 0 elsewhere.
    pub fn derivative(logits: &Matrix, rows: &[usize], labels: &[usize]) -> Matrix {
        let mut grad = Matrix::zeros(logits.rows, logits.cols);
        for (&r, &y) in rows.iter().zip(labels.iter()) {
            let mut p = softmax(logits.row(r));
            p[y] -= 1.0;
            grad.data[r] = p;
        }
        grad
    }

    /// Cross-entropy against soft (distribution) targets:
    ///   L = -Σ_i Σ_c log(clip(p_ic)) · t_ic
    ///
    /// `probs` are already normalized; `targets` has one row per flat position.
    pub fn soft_loss(probs: &Matrix, rows: &[usize], targets: &Matrix) -> f64 {
        rows.iter()
            .map(|&r| {
                probs.row(r).iter().zip(targets.row(r).iter())
                    .map(|(&p, &t)| -clipped_ln(p) * t)
                    .sum::<f64>()
            })
            .sum()
    }

    /// Gradient of [`CrossEntropyLoss::soft_loss`] w.r.t. the logits, when
    /// `probs = softmax(logits)`:
    ///   ∂L/∂z_ic = p_ic · Σ_k t_ik - t_ic
    pub fn soft_derivative(probs: &Matrix, rows: &[usize], targets: &Matrix) -> Matrix {
        let mut grad = Matrix::zeros(probs.rows, probs.cols);
        for &r in rows {
            let mass: f64 = targets.row(r).iter().sum();
            grad.data[r] = probs.row(r).iter().zip(targets.row(r).iter())
                .map(|(&p, &t)| p * mass - t)
                .collect();
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confident_correct_prediction_costs_almost_nothing() {
        let logits = Matrix::from_data(vec![vec![50.0, 0.0], vec![0.0, 50.0]]);
        let loss = CrossEntropyLoss::loss(&logits, &[0, 1], &[0, 1]);
        assert!(loss >= 0.0 && loss < 1e-12);
    }

    #[test]
    fn rows_outside_the_index_are_ignored() {
        let logits = Matrix::from_data(vec![vec![0.0, 0.0], vec![-30.0, 30.0]]);
        let only_first = CrossEntropyLoss::loss(&logits, &[0], &[1]);
        assert!((only_first - 2f64.ln()).abs() < 1e-12);
        let grad = CrossEntropyLoss::derivative(&logits, &[0], &[1]);
        assert_eq!(grad.data[1], vec![0.0, 0.0]);
        assert!((grad.data[0][0] - 0.5).abs() < 1e-12);
        assert!((grad.data[0][1] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn soft_targets_reduce_to_hard_ones() {
        let logits = Matrix::from_data(vec![vec![0.2, 1.3, -0.4]]);
        let probs = Matrix::from_data(vec![softmax(logits.row(0))]);
        let target = Matrix::from_data(vec![vec![0.0, 1.0, 0.0]]);
        let hard = CrossEntropyLoss::loss(&logits, &[0], &[1]);
        let soft = CrossEntropyLoss::soft_loss(&probs, &[0], &target);
        assert!((hard - soft).abs() < 1e-12);
        let gh = CrossEntropyLoss::derivative(&logits, &[0], &[1]);
        let gs = CrossEntropyLoss::soft_derivative(&probs, &[0], &target);
        for (a, b) in gh.to_flat().iter().zip(gs.to_flat().iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
