use crate::math::matrix::Matrix;

/// Squared error on the raw (identity-activated) scores.
pub struct SseLoss;

impl SseLoss {
    /// Integer targets: mean over valid rows and classes of (s - onehot(y))².
    pub fn one_hot_loss(scores: &Matrix, rows: &[usize], labels: &[usize]) -> f64 {
        let n = (rows.len() * scores.cols) as f64;
        if n == 0.0 {
            return 0.0;
        }
        rows.iter().zip(labels.iter())
            .map(|(&r, &y)| {
                scores.row(r).iter().enumerate()
                    .map(|(c, &s)| (s - one_hot(c, y)).powi(2))
                    .sum::<f64>()
            })
            .sum::<f64>() / n
    }

    /// Per-output gradient of [`SseLoss::one_hot_loss`]: 2·(s - onehot(y)) / n
    pub fn one_hot_derivative(scores: &Matrix, rows: &[usize], labels: &[usize]) -> Matrix {
        let mut grad = Matrix::zeros(scores.rows, scores.cols);
        let n = (rows.len() * scores.cols) as f64;
        if n == 0.0 {
            return grad;
        }
        for (&r, &y) in rows.iter().zip(labels.iter()) {
            grad.data[r] = scores.row(r).iter().enumerate()
                .map(|(c, &s)| 2.0 * (s - one_hot(c, y)) / n)
                .collect();
        }
        grad
    }

    /// Float targets: Σ over valid rows of (s - t)², no averaging.
    pub fn loss(scores: &Matrix, rows: &[usize], targets: &Matrix) -> f64 {
        rows.iter()
            .map(|&r| {
                scores.row(r).iter().zip(targets.row(r).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
            })
            .sum()
    }

    /// Per-output gradient of [`SseLoss::loss`]: 2·(s - t)
    pub fn derivative(scores: &Matrix, rows: &[usize], targets: &Matrix) -> Matrix {
        let mut grad = Matrix::zeros(scores.rows, scores.cols);
        for &r in rows {
            grad.data[r] = scores.row(r).iter().zip(targets.row(r).iter())
                .map(|(a, b)| 2.0 * (a - b))
                .collect();
        }
        grad
    }
}

fn one_hot(c: usize, y: usize) -> f64 {
    if c == y { 1.0 } else { 0.0 }
}
