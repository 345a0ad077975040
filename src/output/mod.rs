pub mod index;
pub mod targets;
pub mod known_grads;
pub mod external;
pub mod base;
pub mod framewise;
pub mod decoder;
pub mod sequence;
pub mod head;

pub use index::{truncate, Mask, MaskedIndex, Truncated};
pub use targets::{Labels, Targets};
pub use known_grads::{Cost, KnownGrads};
pub use external::{AlignmentCost, BestPathDecoder, Collaborators, CtcCost, CtcForwardBackward, CtcResult, GreedyBestPath};
pub use base::{LayerInputs, OutputLayer};
pub use framewise::{FramewiseLoss, FramewiseOutput};
pub use decoder::DecoderOutput;
pub use sequence::{SequenceLoss, SequenceOutput};
pub use head::OutputHead;
