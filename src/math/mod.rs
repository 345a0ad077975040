pub mod matrix;
pub mod tensor;

pub use matrix::Matrix;
pub use tensor::{NodeId, Tensor3};
