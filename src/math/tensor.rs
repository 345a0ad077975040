use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{OutputError, Result};
use crate::math::matrix::Matrix;

static NEXT_NODE: AtomicU64 = AtomicU64::new(1);

/// Identity of a tensor within one layer build.
///
/// Every freshly computed tensor gets a new id; clones share it, the same way
/// two handles on a graph node refer to the same node. Gradient overrides are
/// keyed by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn fresh() -> NodeId {
        NodeId(NEXT_NODE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Rank-3 time-major tensor of shape (time, batch, classes), stored flat in
/// row-major order.
#[derive(Debug, Clone)]
pub struct Tensor3 {
    id: NodeId,
    pub time: usize,
    pub batch: usize,
    pub classes: usize,
    pub data: Vec<f64>,
}

impl PartialEq for Tensor3 {
    /// Value equality; node identity is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.data == other.data
    }
}

impl Tensor3 {
    pub fn new(time: usize, batch: usize, classes: usize, data: Vec<f64>) -> Result<Tensor3> {
        if data.len() != time * batch * classes {
            return Err(OutputError::ShapeMismatch {
                what: "tensor data",
                expected: vec![time * batch * classes],
                found: vec![data.len()],
            });
        }
        Ok(Tensor3 { id: NodeId::fresh(), time, batch, classes, data })
    }

    pub fn zeros(time: usize, batch: usize, classes: usize) -> Tensor3 {
        Tensor3::filled(time, batch, classes, 0.0)
    }

    pub fn filled(time: usize, batch: usize, classes: usize, value: f64) -> Tensor3 {
        Tensor3 {
            id: NodeId::fresh(),
            time,
            batch,
            classes,
            data: vec![value; time * batch * classes],
        }
    }

    /// Builds a tensor from nested `[time][batch][class]` values.
    pub fn from_nested(values: Vec<Vec<Vec<f64>>>) -> Result<Tensor3> {
        let time = values.len();
        let batch = values.first().map_or(0, |b| b.len());
        let classes = values.first().and_then(|b| b.first()).map_or(0, |c| c.len());
        let mut data = Vec::with_capacity(time * batch * classes);
        for step in &values {
            if step.len() != batch {
                return Err(OutputError::ShapeMismatch {
                    what: "nested tensor batch",
                    expected: vec![batch],
                    found: vec![step.len()],
                });
            }
            for cell in step {
                if cell.len() != classes {
                    return Err(OutputError::ShapeMismatch {
                        what: "nested tensor classes",
                        expected: vec![classes],
                        found: vec![cell.len()],
                    });
                }
                data.extend_from_slice(cell);
            }
        }
        Tensor3::new(time, batch, classes, data)
    }

    /// Reassembles a (time×batch, classes) matrix into a (time, batch, classes) tensor.
    pub fn from_matrix(time: usize, batch: usize, m: &Matrix) -> Result<Tensor3> {
        if m.rows != time * batch {
            return Err(OutputError::ShapeMismatch {
                what: "flat matrix rows",
                expected: vec![time * batch],
                found: vec![m.rows],
            });
        }
        Tensor3::new(time, batch, m.cols, m.to_flat())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.time, self.batch, self.classes]
    }

    /// Number of (time, batch) cells.
    pub fn positions(&self) -> usize {
        self.time * self.batch
    }

    pub fn cell(&self, t: usize, b: usize) -> &[f64] {
        let start = (t * self.batch + b) * self.classes;
        &self.data[start..start + self.classes]
    }

    pub fn cell_mut(&mut self, t: usize, b: usize) -> &mut [f64] {
        let start = (t * self.batch + b) * self.classes;
        &mut self.data[start..start + self.classes]
    }

    /// The flat (time×batch, classes) view used by every loss.
    pub fn to_matrix(&self) -> Matrix {
        Matrix::from_flat(self.positions(), self.classes, &self.data)
    }

    /// Element-wise map into a new node.
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Tensor3 {
        Tensor3 {
            id: NodeId::fresh(),
            time: self.time,
            batch: self.batch,
            classes: self.classes,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Element-wise combination of two same-shape tensors into a new node.
    pub fn zip_with<F: Fn(f64, f64) -> f64>(&self, other: &Tensor3, f: F) -> Result<Tensor3> {
        self.expect_shape(other.shape(), "element-wise operand")?;
        Ok(Tensor3 {
            id: NodeId::fresh(),
            time: self.time,
            batch: self.batch,
            classes: self.classes,
            data: self.data.iter().zip(other.data.iter()).map(|(&a, &b)| f(a, b)).collect(),
        })
    }

    /// `self * a + other * b`, element-wise.
    pub fn axpby(&self, a: f64, other: &Tensor3, b: f64) -> Result<Tensor3> {
        self.zip_with(other, |x, y| a * x + b * y)
    }

    /// Repeats a single time step `reps` times along the time axis.
    pub fn repeat_time(&self, reps: usize) -> Tensor3 {
        let mut data = Vec::with_capacity(self.data.len() * reps);
        for _ in 0..reps {
            data.extend_from_slice(&self.data);
        }
        Tensor3 {
            id: NodeId::fresh(),
            time: self.time * reps,
            batch: self.batch,
            classes: self.classes,
            data,
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn expect_shape(&self, shape: [usize; 3], what: &'static str) -> Result<()> {
        if self.shape() != shape {
            return Err(OutputError::ShapeMismatch {
                what,
                expected: shape.to_vec(),
                found: self.shape().to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity_but_new_values_do_not() {
        let z = Tensor3::zeros(2, 1, 3);
        let alias = z.clone();
        assert_eq!(z.id(), alias.id());
        assert_ne!(z.id(), z.map(|x| x + 1.0).id());
    }

    #[test]
    fn flat_view_is_time_major() {
        let z = Tensor3::from_nested(vec![
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![vec![5.0, 6.0], vec![7.0, 8.0]],
        ]).unwrap();
        let m = z.to_matrix();
        assert_eq!(m.rows, 4);
        assert_eq!(m.data[2], vec![5.0, 6.0]);
        assert_eq!(z.cell(1, 1), &[7.0, 8.0]);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(Tensor3::new(2, 2, 2, vec![0.0; 7]).is_err());
    }

    #[test]
    fn repeat_time_copies_the_single_step() {
        let z = Tensor3::new(1, 2, 1, vec![1.0, 2.0]).unwrap();
        let r = z.repeat_time(3);
        assert_eq!(r.shape(), [3, 2, 1]);
        assert_eq!(r.data, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }
}
