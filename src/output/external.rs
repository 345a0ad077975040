//! Procedures that produce an error signal outside the layer: CTC
//! forward-backward, forced alignment against an external decoder, and
//! best-path decoding for the error metric.

use crate::activation::activation::clipped_ln;
use crate::error::{OutputError, Result};
use crate::loss::ctc::CtcLoss;
use crate::math::matrix::{argmax, Matrix};
use crate::math::tensor::Tensor3;

/// What a CTC cost procedure returns.
#[derive(Debug, Clone)]
pub struct CtcResult {
    /// Error per sequence.
    pub errors: Vec<f64>,
    /// Gradient w.r.t. the pre-softmax scores, shaped like the probabilities.
    pub grad: Tensor3,
    /// Per-sequence class posteriors, (batch, classes).
    pub priors: Matrix,
}

/// `(probabilities, transcripts, lengths) → (error, gradient, priors)`.
pub trait CtcCost {
    fn cost(&self, probs: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<CtcResult>;
}

/// `(probabilities, lengths) → (error, gradient)` for the reference named `target`.
pub trait AlignmentCost {
    fn cost(&self, target: &str, probs: &Tensor3, lengths: &[usize]) -> Result<(Vec<f64>, Tensor3)>;
}

/// `(probabilities, transcripts, lengths) → mismatch count`.
pub trait BestPathDecoder {
    fn errors(&self, probs: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<f64>;
}

/// The external procedures a sequence layer may call.
pub struct Collaborators {
    pub ctc: Box<dyn CtcCost>,
    pub alignment: Option<Box<dyn AlignmentCost>>,
    pub decoder: Box<dyn BestPathDecoder>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            ctc: Box::new(CtcForwardBackward::default()),
            alignment: None,
            decoder: Box::new(GreedyBestPath::default()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("alignment", &self.alignment.is_some())
            .finish_non_exhaustive()
    }
}

/// Blank index: the configured one, else the last class.
fn blank_for(blank: Option<usize>, classes: usize) -> Result<usize> {
    match blank {
        Some(b) => Ok(b),
        None if classes > 0 => Ok(classes - 1),
        None => Err(OutputError::LabelOutOfRange { label: 0, classes }),
    }
}

/// In-process CTC using the log-domain forward-backward of [`CtcLoss`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CtcForwardBackward {
    /// Defaults to the last class.
    pub blank: Option<usize>,
}

impl CtcCost for CtcForwardBackward {
    fn cost(&self, probs: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<CtcResult> {
        let ctc = CtcLoss::new(blank_for(self.blank, probs.classes)?);
        // softmax(ln p) == p for normalized rows, so log-probabilities stand in for z
        let scores = probs.map(clipped_ln);
        let out = ctc.cost_and_grad(&scores, targets, lengths)?;
        Ok(CtcResult { errors: out.costs, grad: out.grad_z, priors: out.posteriors })
    }
}

/// Best-path decoding: arg-max per frame, merge repeats, drop blanks.
/// Counts the sequences whose decoding differs from the transcript.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyBestPath {
    /// Defaults to the last class.
    pub blank: Option<usize>,
}

impl GreedyBestPath {
    pub fn decode(&self, probs: &Tensor3, b: usize, length: usize) -> Result<Vec<usize>> {
        let blank = blank_for(self.blank, probs.classes)?;
        let mut out = Vec::new();
        let mut prev = None;
        for t in 0..length.min(probs.time) {
            let best = argmax(probs.cell(t, b));
            if Some(best) != prev && best != blank {
                out.push(best);
            }
            prev = Some(best);
        }
        Ok(out)
    }
}

impl BestPathDecoder for GreedyBestPath {
    fn errors(&self, probs: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<f64> {
        if targets.len() != probs.batch || lengths.len() != probs.batch {
            return Err(OutputError::ShapeMismatch {
                what: "best-path targets/lengths per batch",
                expected: vec![probs.batch, probs.batch],
                found: vec![targets.len(), lengths.len()],
            });
        }
        let mut mismatches = 0usize;
        for b in 0..probs.batch {
            if self.decode(probs, b, lengths[b])? != targets[b] {
                mismatches += 1;
            }
        }
        Ok(mismatches as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs(rows: Vec<Vec<f64>>) -> Tensor3 {
        // one sequence, rows are frames
        let classes = rows[0].len();
        let time = rows.len();
        Tensor3::new(time, 1, classes, rows.into_iter().flatten().collect()).unwrap()
    }

    #[test]
    fn greedy_decoding_collapses_and_drops_blanks() {
        // classes {0, 1, blank=2}
        let p = probs(vec![
            vec![0.8, 0.1, 0.1],
            vec![0.8, 0.1, 0.1],
            vec![0.1, 0.1, 0.8],
            vec![0.1, 0.8, 0.1],
        ]);
        let dec = GreedyBestPath::default();
        assert_eq!(dec.decode(&p, 0, 4).unwrap(), vec![0, 1]);
        assert_eq!(dec.errors(&p, &[vec![0, 1]], &[4]).unwrap(), 0.0);
        assert_eq!(dec.errors(&p, &[vec![0]], &[4]).unwrap(), 1.0);
        // only the first two frames count
        assert_eq!(dec.errors(&p, &[vec![0]], &[2]).unwrap(), 0.0);
    }

    #[test]
    fn forward_backward_gradient_is_probability_minus_occupancy() {
        let p = probs(vec![vec![0.5, 0.5]]);
        let out = CtcForwardBackward::default().cost(&p, &[vec![0]], &[1]).unwrap();
        assert!((out.errors[0] - 2f64.ln()).abs() < 1e-9);
        assert!((out.grad.data[0] + 0.5).abs() < 1e-9);
        assert!((out.grad.data[1] - 0.5).abs() < 1e-9);
        assert!((out.priors.data[0][0] - 1.0).abs() < 1e-9);
    }
}
