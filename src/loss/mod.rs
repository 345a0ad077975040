pub mod loss_type;
pub mod cross_entropy;
pub mod sse;
pub mod entropy;
pub mod priori;
pub mod ctc;

pub use loss_type::LossType;
pub use cross_entropy::CrossEntropyLoss;
pub use sse::SseLoss;
pub use entropy::EntropyLoss;
pub use priori::PrioriLoss;
pub use ctc::{CtcLoss, CtcOutput};
