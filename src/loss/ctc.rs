//! Connectionist temporal classification in the log domain.
//!
//! The forward (alpha) and backward (beta) recursions run over the label
//! sequence with a blank inserted around every label. From them come the
//! per-sequence cost `-log p(l|x)` and the per-frame class posteriors, which
//! give the gradient w.r.t. the pre-softmax scores as `softmax(z) - posterior`.

use crate::activation::activation::{log_softmax, log_sum_exp, softmax};
use crate::error::{OutputError, Result};
use crate::math::matrix::Matrix;
use crate::math::tensor::Tensor3;
use crate::output::index::Mask;
use crate::output::targets::Labels;

/// Output of [`CtcLoss::cost_and_grad`].
#[derive(Debug, Clone)]
pub struct CtcOutput {
    /// `-log p(l|x)` per sequence.
    pub costs: Vec<f64>,
    /// Gradient of `Σ costs` w.r.t. the pre-softmax scores.
    pub grad_z: Tensor3,
    /// Class posteriors summed over time, shape (batch, classes).
    pub posteriors: Matrix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtcLoss {
    pub blank: usize,
}

impl CtcLoss {
    pub fn new(blank: usize) -> CtcLoss {
        CtcLoss { blank }
    }

    /// Cost and gradient for a batch of pre-softmax scores `z` (time, batch, classes).
    ///
    /// `targets[b]` is the transcript of sequence `b` (no blanks) and
    /// `lengths[b]` its number of valid frames. Frames past the length get a
    /// zero gradient. A sequence whose transcript cannot be aligned in its
    /// frames has an infinite cost and zero gradient.
    pub fn cost_and_grad(&self, z: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<CtcOutput> {
        self.check(z, targets, lengths)?;
        let mut grad_z = Tensor3::zeros(z.time, z.batch, z.classes);
        let mut posteriors = Matrix::zeros(z.batch, z.classes);
        let mut costs = Vec::with_capacity(z.batch);

        for b in 0..z.batch {
            let frames = lengths[b].min(z.time);
            let log_probs: Vec<Vec<f64>> = (0..frames).map(|t| log_softmax(z.cell(t, b))).collect();
            let (cost, gamma) = self.sequence(&log_probs, &targets[b]);
            if !cost.is_finite() {
                log::warn!("ctc: sequence {b} has no valid alignment ({} labels in {frames} frames)", targets[b].len());
                costs.push(cost);
                continue;
            }
            for (t, occupancy) in gamma.iter().enumerate() {
                let p = softmax(z.cell(t, b));
                let cell = grad_z.cell_mut(t, b);
                for k in 0..z.classes {
                    cell[k] = p[k] - occupancy[k];
                    posteriors.data[b][k] += occupancy[k];
                }
            }
            costs.push(cost);
        }

        Ok(CtcOutput { costs, grad_z, posteriors })
    }

    fn check(&self, z: &Tensor3, targets: &[Vec<usize>], lengths: &[usize]) -> Result<()> {
        if self.blank >= z.classes {
            return Err(OutputError::LabelOutOfRange { label: self.blank as i64, classes: z.classes });
        }
        if targets.len() != z.batch || lengths.len() != z.batch {
            return Err(OutputError::ShapeMismatch {
                what: "ctc targets/lengths per batch",
                expected: vec![z.batch, z.batch],
                found: vec![targets.len(), lengths.len()],
            });
        }
        for &l in targets.iter().flatten() {
            if l >= z.classes || l == self.blank {
                return Err(OutputError::LabelOutOfRange { label: l as i64, classes: z.classes });
            }
        }
        Ok(())
    }

    /// Label sequence with blanks around every label: `_ a _ b _`.
    fn extend(&self, target: &[usize]) -> Vec<usize> {
        let mut ext = Vec::with_capacity(2 * target.len() + 1);
        ext.push(self.blank);
        for &l in target {
            ext.push(l);
            ext.push(self.blank);
        }
        ext
    }

    /// Whether state `s` may be entered directly from `s - 2`.
    fn can_skip(ext: &[usize], s: usize, blank: usize) -> bool {
        s >= 2 && ext[s] != blank && ext[s] != ext[s - 2]
    }

    fn alpha(&self, lp: &[Vec<f64>], ext: &[usize]) -> (Vec<Vec<f64>>, f64) {
        let frames = lp.len();
        let states = ext.len();
        if frames == 0 {
            let cost = if states == 1 { 0.0 } else { f64::INFINITY };
            return (Vec::new(), cost);
        }
        let mut alpha = vec![vec![f64::NEG_INFINITY; states]; frames];
        alpha[0][0] = lp[0][ext[0]];
        if states > 1 {
            alpha[0][1] = lp[0][ext[1]];
        }
        for t in 1..frames {
            for s in 0..states {
                let mut terms = vec![alpha[t - 1][s]];
                if s >= 1 {
                    terms.push(alpha[t - 1][s - 1]);
                }
                if Self::can_skip(ext, s, self.blank) {
                    terms.push(alpha[t - 1][s - 2]);
                }
                alpha[t][s] = log_sum_exp(&terms) + lp[t][ext[s]];
            }
        }
        let last = &alpha[frames - 1];
        let tail = if states > 1 { vec![last[states - 1], last[states - 2]] } else { vec![last[0]] };
        let log_p = log_sum_exp(&tail);
        (alpha, -log_p)
    }

    fn beta(&self, lp: &[Vec<f64>], ext: &[usize]) -> Vec<Vec<f64>> {
        let frames = lp.len();
        let states = ext.len();
        let mut beta = vec![vec![f64::NEG_INFINITY; states]; frames];
        if frames == 0 {
            return beta;
        }
        beta[frames - 1][states - 1] = lp[frames - 1][ext[states - 1]];
        if states > 1 {
            beta[frames - 1][states - 2] = lp[frames - 1][ext[states - 2]];
        }
        for t in (0..frames - 1).rev() {
            for s in 0..states {
                let mut terms = vec![beta[t + 1][s]];
                if s + 1 < states {
                    terms.push(beta[t + 1][s + 1]);
                }
                if s + 2 < states && Self::can_skip(ext, s + 2, self.blank) {
                    terms.push(beta[t + 1][s + 2]);
                }
                beta[t][s] = log_sum_exp(&terms) + lp[t][ext[s]];
            }
        }
        beta
    }

    /// Cost and per-frame class occupancy for one sequence.
    fn sequence(&self, lp: &[Vec<f64>], target: &[usize]) -> (f64, Vec<Vec<f64>>) {
        let ext = self.extend(target);
        let (alpha, cost) = self.alpha(lp, &ext);
        if !cost.is_finite() || lp.is_empty() {
            return (cost, Vec::new());
        }
        let beta = self.beta(lp, &ext);
        let classes = lp[0].len();
        let gamma = (0..lp.len())
            .map(|t| {
                let mut occ = vec![0.0; classes];
                for (s, &k) in ext.iter().enumerate() {
                    let log_occ = alpha[t][s] + beta[t][s] - lp[t][k] + cost;
                    if log_occ.is_finite() {
                        occ[k] += log_occ.exp();
                    }
                }
                occ
            })
            .collect();
        (cost, gamma)
    }
}

/// Collapses frame-level labels into transcripts.
///
/// For every batch column, walks the valid frames of `labels`, drops blanks and
/// merges runs of the same label. Returns the transcripts and their lengths.
pub fn uniq_with_lengths(labels: &Labels, mask: &Mask, blank: usize) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut targets = Vec::with_capacity(labels.batch);
    for b in 0..labels.batch {
        let mut seq: Vec<usize> = Vec::new();
        let mut prev: Option<i64> = None;
        for t in 0..labels.time.min(mask.time) {
            if !mask.is_valid(t, b) {
                continue;
            }
            let l = labels.get(t, b);
            if prev != Some(l) && l >= 0 && l as usize != blank {
                seq.push(l as usize);
            }
            prev = Some(l);
        }
        targets.push(seq);
    }
    let lengths = targets.iter().map(|s| s.len()).collect();
    (targets, lengths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(time: usize, batch: usize, classes: usize) -> Tensor3 {
        Tensor3::zeros(time, batch, classes)
    }

    #[test]
    fn single_frame_single_label_cost() {
        // classes {a, blank}; one frame must emit `a`
        let z = uniform(1, 1, 2);
        let out = CtcLoss::new(1).cost_and_grad(&z, &[vec![0]], &[1]).unwrap();
        assert!((out.costs[0] - 2f64.ln()).abs() < 1e-12);
        // p = (0.5, 0.5), occupancy = (1, 0)
        assert!((out.grad_z.cell(0, 0)[0] + 0.5).abs() < 1e-12);
        assert!((out.grad_z.cell(0, 0)[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn two_frames_enumerate_all_alignments() {
        // target `a` in 2 frames: aa, a_, _a → 3 of 4 paths with uniform 1/2
        let z = uniform(2, 1, 2);
        let costs = CtcLoss::new(1).cost_and_grad(&z, &[vec![0]], &[2]).unwrap().costs;
        assert!((costs[0] + (0.75f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn repeated_labels_need_a_blank_between_them() {
        let z = uniform(1, 1, 2);
        let out = CtcLoss::new(1).cost_and_grad(&z, &[vec![0, 0]], &[1]).unwrap();
        assert!(out.costs[0].is_infinite());
        assert!(out.grad_z.data.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let z = Tensor3::new(3, 1, 3, vec![0.3, -0.2, 0.1, 1.0, 0.0, -1.0, 0.2, 0.4, -0.3]).unwrap();
        let ctc = CtcLoss::new(2);
        let target = vec![vec![0, 1]];
        let out = ctc.cost_and_grad(&z, &target, &[3]).unwrap();
        let eps = 1e-6;
        for i in 0..z.data.len() {
            let mut plus = z.clone();
            plus.data[i] += eps;
            let mut minus = z.clone();
            minus.data[i] -= eps;
            let f = |t: &Tensor3| ctc.cost_and_grad(t, &target, &[3]).unwrap().costs[0];
            let numeric = (f(&plus) - f(&minus)) / (2.0 * eps);
            assert!((numeric - out.grad_z.data[i]).abs() < 1e-5, "index {i}");
        }
    }

    #[test]
    fn posteriors_sum_to_frame_count() {
        let z = Tensor3::new(2, 1, 2, vec![0.4, -0.1, 0.9, 0.2]).unwrap();
        let out = CtcLoss::new(1).cost_and_grad(&z, &[vec![0]], &[2]).unwrap();
        assert!((out.posteriors.sum() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn uniq_merges_runs_and_skips_blanks() {
        let labels = Labels::from_rows(vec![vec![1], vec![1], vec![3], vec![2], vec![2]]).unwrap();
        let mask = Mask::from_lengths(5, &[5]);
        let (targets, lengths) = uniq_with_lengths(&labels, &mask, 3);
        assert_eq!(targets, vec![vec![1, 2]]);
        assert_eq!(lengths, vec![2]);
    }
}
