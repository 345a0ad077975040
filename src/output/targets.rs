use crate::error::{OutputError, Result};
use crate::math::matrix::Matrix;

/// Integer class ids laid out (time, batch), time-major. Negative entries are
/// padding; they are only meaningful for transcript-style CTC targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub time: usize,
    pub batch: usize,
    pub data: Vec<i64>,
}

impl Labels {
    pub fn new(time: usize, batch: usize, data: Vec<i64>) -> Result<Labels> {
        if data.len() != time * batch {
            return Err(OutputError::ShapeMismatch {
                what: "label data",
                expected: vec![time * batch],
                found: vec![data.len()],
            });
        }
        Ok(Labels { time, batch, data })
    }

    /// Builds labels from `[time][batch]` rows.
    pub fn from_rows(rows: Vec<Vec<i64>>) -> Result<Labels> {
        let time = rows.len();
        let batch = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != batch) {
            return Err(OutputError::ShapeMismatch {
                what: "label rows",
                expected: vec![time, batch],
                found: rows.iter().map(|r| r.len()).collect(),
            });
        }
        Labels::new(time, batch, rows.into_iter().flatten().collect())
    }

    pub fn get(&self, t: usize, b: usize) -> i64 {
        self.data[t * self.batch + b]
    }

    /// Per-sequence transcripts: the non-negative labels of every batch column,
    /// in time order.
    pub fn sequences(&self) -> Vec<Vec<usize>> {
        (0..self.batch)
            .map(|b| {
                (0..self.time)
                    .map(|t| self.get(t, b))
                    .filter(|&l| l >= 0)
                    .map(|l| l as usize)
                    .collect()
            })
            .collect()
    }
}

/// Target data handed to the output layer, tagged by numeric kind.
///
/// Integer kinds (`Labels`, `OneHot`) are scored as classification, `Dense`
/// as regression.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// One class id per (time, batch) cell.
    Labels(Labels),
    /// Integer-valued target rows, one per flat (time×batch) position.
    OneHot(Matrix),
    /// Float target rows, one per flat (time×batch) position.
    Dense(Matrix),
}

impl Targets {
    pub fn kind(&self) -> &'static str {
        match self {
            Targets::Labels(_) => "integer label",
            Targets::OneHot(_) => "integer one-hot",
            Targets::Dense(_) => "float",
        }
    }

    /// Number of flat (time×batch) positions the targets cover.
    pub fn positions(&self) -> usize {
        match self {
            Targets::Labels(l) => l.time * l.batch,
            Targets::OneHot(m) | Targets::Dense(m) => m.rows,
        }
    }

    pub fn labels(&self) -> Option<&Labels> {
        match self {
            Targets::Labels(l) => Some(l),
            _ => None,
        }
    }

    /// Class id at flat position `k`, checked against `classes`.
    pub fn class_at(&self, k: usize, classes: usize) -> Result<usize> {
        let label = match self {
            Targets::Labels(l) => l.data[k],
            Targets::OneHot(m) => crate::math::matrix::argmax(m.row(k)) as i64,
            Targets::Dense(_) => {
                return Err(OutputError::ShapeMismatch {
                    what: "class id from float targets",
                    expected: vec![],
                    found: vec![k],
                })
            }
        };
        if label < 0 || label as usize >= classes {
            return Err(OutputError::LabelOutOfRange { label, classes });
        }
        Ok(label as usize)
    }

    pub(crate) fn expect_positions(&self, positions: usize) -> Result<()> {
        if self.positions() != positions {
            return Err(OutputError::ShapeMismatch {
                what: "target positions",
                expected: vec![positions],
                found: vec![self.positions()],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_skip_padding() {
        let y = Labels::from_rows(vec![vec![3, 1], vec![4, -1], vec![-1, -1]]).unwrap();
        assert_eq!(y.sequences(), vec![vec![3, 4], vec![1]]);
    }

    #[test]
    fn class_at_rejects_out_of_range_labels() {
        let y = Targets::Labels(Labels::new(1, 2, vec![0, 5]).unwrap());
        assert_eq!(y.class_at(0, 3).unwrap(), 0);
        assert!(matches!(
            y.class_at(1, 3),
            Err(OutputError::LabelOutOfRange { label: 5, classes: 3 })
        ));
    }

    #[test]
    fn one_hot_rows_resolve_to_their_argmax() {
        let y = Targets::OneHot(Matrix::from_data(vec![vec![0.0, 1.0, 0.0]]));
        assert_eq!(y.class_at(0, 3).unwrap(), 1);
    }
}
