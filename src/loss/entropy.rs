use crate::activation::activation::{log_softmax, softmax};
use crate::error::{OutputError, Result};
use crate::math::matrix::Matrix;
use crate::output::index::Mask;
use crate::output::targets::Labels;

/// Probability clip for the entropy term.
const ENTROPY_MIN: f64 = 1.0e-6;
const ENTROPY_MAX: f64 = 1.0e6;

/// Semi-supervised loss over batch columns.
///
/// A column containing at least one positive label at a valid step is scored
/// with softmax cross-entropy; a column without one contributes the entropy
/// `H = -Σ_c p_c·log p_c` of its predictions instead. Both terms are weighted by
/// the mask value of each cell.
pub struct EntropyLoss;

impl EntropyLoss {
    /// Which batch columns are supervised.
    pub fn supervised_columns(mask: &Mask, labels: &Labels) -> Vec<bool> {
        (0..mask.batch)
            .map(|b| (0..mask.time).any(|t| labels.get(t, b) as f64 * mask.get(t, b) > 0.0))
            .collect()
    }

    pub fn loss(logits: &Matrix, mask: &Mask, labels: &Labels) -> Result<f64> {
        check_shapes(logits, mask, labels)?;
        let supervised = Self::supervised_columns(mask, labels);
        let mut total = 0.0;
        for t in 0..mask.time {
            for b in 0..mask.batch {
                let m = mask.get(t, b);
                if m <= 0.0 {
                    continue;
                }
                let k = t * mask.batch + b;
                let row = logits.row(k);
                total += m * if supervised[b] {
                    let y = checked_label(labels.data[k], row.len())?;
                    -log_softmax(row)[y]
                } else {
                    entropy(&softmax(row))
                };
            }
        }
        Ok(total)
    }

    /// Gradient w.r.t. the logits. Supervised cells get `m·(p - onehot(y))`,
    /// unsupervised ones `m·∂H/∂z` with `∂H/∂z_k = -p_k·(log p_k + H)`.
    pub fn derivative(logits: &Matrix, mask: &Mask, labels: &Labels) -> Result<Matrix> {
        check_shapes(logits, mask, labels)?;
        let supervised = Self::supervised_columns(mask, labels);
        let mut grad = Matrix::zeros(logits.rows, logits.cols);
        for t in 0..mask.time {
            for b in 0..mask.batch {
                let m = mask.get(t, b);
                if m <= 0.0 {
                    continue;
                }
                let k = t * mask.batch + b;
                let p = softmax(logits.row(k));
                grad.data[k] = if supervised[b] {
                    let y = checked_label(labels.data[k], p.len())?;
                    p.iter().enumerate()
                        .map(|(c, &pc)| m * (pc - if c == y { 1.0 } else { 0.0 }))
                        .collect()
                } else {
                    let h = entropy(&p);
                    p.iter()
                        .map(|&pc| -m * pc * (pc.clamp(ENTROPY_MIN, ENTROPY_MAX).ln() + h))
                        .collect()
                };
            }
        }
        Ok(grad)
    }
}

fn entropy(p: &[f64]) -> f64 {
    p.iter()
        .map(|&pc| {
            let pc = pc.clamp(ENTROPY_MIN, ENTROPY_MAX);
            -pc * pc.ln()
        })
        .sum()
}

/// Labels must cover the mask grid and logits must have one row per cell.
fn check_shapes(logits: &Matrix, mask: &Mask, labels: &Labels) -> Result<()> {
    if labels.time != mask.time || labels.batch != mask.batch {
        return Err(OutputError::ShapeMismatch {
            what: "entropy labels vs mask",
            expected: vec![mask.time, mask.batch],
            found: vec![labels.time, labels.batch],
        });
    }
    if logits.rows != mask.time * mask.batch {
        return Err(OutputError::ShapeMismatch {
            what: "entropy logits rows",
            expected: vec![mask.time * mask.batch],
            found: vec![logits.rows],
        });
    }
    Ok(())
}

fn checked_label(label: i64, classes: usize) -> Result<usize> {
    if label < 0 || label as usize >= classes {
        return Err(OutputError::LabelOutOfRange { label, classes });
    }
    Ok(label as usize)
}
