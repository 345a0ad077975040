//! Validity masks over the (time, batch) grid, the flat index sets derived
//! from them, and time truncation.

use crate::error::{OutputError, Result};
use crate::math::tensor::Tensor3;

/// Time-major (time, batch) validity mask. Values are 0/1 or continuous weights;
/// a cell is valid when its value is strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub time: usize,
    pub batch: usize,
    pub data: Vec<f64>,
}

impl Mask {
    pub fn new(time: usize, batch: usize, data: Vec<f64>) -> Result<Mask> {
        if data.len() != time * batch {
            return Err(OutputError::ShapeMismatch {
                what: "mask data",
                expected: vec![time * batch],
                found: vec![data.len()],
            });
        }
        Ok(Mask { time, batch, data })
    }

    pub fn ones(time: usize, batch: usize) -> Mask {
        Mask { time, batch, data: vec![1.0; time * batch] }
    }

    /// Builds a mask from `[time][batch]` rows.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Mask> {
        let time = rows.len();
        let batch = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != batch) {
            return Err(OutputError::ShapeMismatch {
                what: "mask rows",
                expected: vec![time, batch],
                found: rows.iter().map(|r| r.len()).collect(),
            });
        }
        Mask::new(time, batch, rows.into_iter().flatten().collect())
    }

    /// Mask with the first `lengths[b]` steps of every column set.
    pub fn from_lengths(time: usize, lengths: &[usize]) -> Mask {
        let batch = lengths.len();
        let mut data = vec![0.0; time * batch];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len.min(time) {
                data[t * batch + b] = 1.0;
            }
        }
        Mask { time, batch, data }
    }

    pub fn get(&self, t: usize, b: usize) -> f64 {
        self.data[t * self.batch + b]
    }

    pub fn is_valid(&self, t: usize, b: usize) -> bool {
        self.get(t, b) > 0.0
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.time, self.batch]
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Per-sequence lengths: the column sums, rounded to whole steps.
    pub fn column_sums(&self) -> Vec<usize> {
        (0..self.batch)
            .map(|b| {
                let s: f64 = (0..self.time).map(|t| self.get(t, b)).sum();
                s.round().max(0.0) as usize
            })
            .collect()
    }
}

/// Flat positions (index `t * batch + b`) of the valid and padding cells.
///
/// The two sets partition `0..time*batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedIndex {
    pub valid: Vec<usize>,
    pub invalid: Vec<usize>,
}

impl MaskedIndex {
    pub fn from_mask(mask: &Mask) -> MaskedIndex {
        let (valid, invalid) = (0..mask.data.len()).partition(|&k| mask.data[k] > 0.0);
        MaskedIndex { valid, invalid }
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}

/// Result of [`truncate`]: the rewritten mask and pre-activation plus the
/// loss normalizer compensating for the dropped steps.
#[derive(Debug, Clone)]
pub struct Truncated {
    pub mask: Mask,
    pub z: Tensor3,
    pub norm: f64,
    /// First dropped step, or `None` when truncation was off.
    pub end: Option<usize>,
}

/// Drops every time step at or beyond `limit`.
///
/// `limit == 0` disables truncation: mask, `z` (same node) and a norm of 1.0
/// come back unchanged. Otherwise the mask and `z` rows at `t >= limit` are
/// zeroed and `norm = sum(mask) / sum(truncated mask)`. If no valid cell
/// survives, the norm stays at 1.0.
pub fn truncate(mask: &Mask, z: &Tensor3, limit: usize) -> Result<Truncated> {
    if limit == 0 {
        return Ok(Truncated { mask: mask.clone(), z: z.clone(), norm: 1.0, end: None });
    }
    if z.batch != mask.batch {
        return Err(OutputError::ShapeMismatch {
            what: "pre-activation batch vs mask",
            expected: vec![mask.batch],
            found: vec![z.batch],
        });
    }

    let before = mask.sum();
    let mut new_mask = mask.clone();
    for t in limit.min(mask.time)..mask.time {
        for b in 0..mask.batch {
            new_mask.data[t * mask.batch + b] = 0.0;
        }
    }

    let mut new_z = z.map(|x| x);
    let keep = limit.min(z.time) * z.batch * z.classes;
    for x in &mut new_z.data[keep..] {
        *x = 0.0;
    }

    let after = new_mask.sum();
    let norm = if after > 0.0 {
        before / after
    } else {
        log::warn!("time_limit {limit} leaves no valid position; keeping norm at 1.0");
        1.0
    };

    Ok(Truncated { mask: new_mask, z: new_z, norm, end: Some(limit) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sets_partition_the_grid() {
        let mask = Mask::from_rows(vec![vec![1.0, 0.0], vec![0.5, 0.0]]).unwrap();
        let idx = MaskedIndex::from_mask(&mask);
        assert_eq!(idx.valid, vec![0, 2]);
        assert_eq!(idx.invalid, vec![1, 3]);
    }

    #[test]
    fn truncation_rescales_norm() {
        let mask = Mask::from_rows(vec![vec![1.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let z = Tensor3::filled(2, 2, 3, 1.0);
        let out = truncate(&mask, &z, 1).unwrap();
        assert_eq!(out.mask.data, vec![1.0, 1.0, 0.0, 0.0]);
        assert!((out.norm - 1.5).abs() < 1e-12);
        assert!(out.z.data[6..].iter().all(|&x| x == 0.0));
        assert!(out.z.data[..6].iter().all(|&x| x == 1.0));
    }

    #[test]
    fn zero_limit_is_a_no_op() {
        let mask = Mask::from_rows(vec![vec![1.0], vec![1.0]]).unwrap();
        let z = Tensor3::filled(2, 1, 2, 3.0);
        let out = truncate(&mask, &z, 0).unwrap();
        assert_eq!(out.mask, mask);
        assert_eq!(out.z.id(), z.id());
        assert_eq!(out.norm, 1.0);
        assert_eq!(out.end, None);
    }

    #[test]
    fn empty_truncated_mask_keeps_unit_norm() {
        let mask = Mask::from_rows(vec![vec![0.0], vec![1.0]]).unwrap();
        let z = Tensor3::zeros(2, 1, 1);
        assert_eq!(truncate(&mask, &z, 1).unwrap().norm, 1.0);
    }

    #[test]
    fn lengths_become_column_sums() {
        let mask = Mask::from_lengths(4, &[4, 2, 0]);
        assert_eq!(mask.column_sums(), vec![4, 2, 0]);
    }
}
