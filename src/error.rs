use thiserror::Error;

use crate::loss::loss_type::LossType;

/// Everything that can abort building or evaluating an output layer.
///
/// Configuration problems surface here at construction time; numerical edge
/// cases (log of zero and friends) are clipped instead and never reach this type.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid loss: {0}")]
    UnknownLoss(String),

    #[error("loss `{loss}` is not available for {layer} output layers")]
    LossNotSupported { loss: LossType, layer: &'static str },

    #[error("source/weight/mask counts differ: {sources} sources, {weights} weights, {masks} masks")]
    SourceCountMismatch {
        sources: usize,
        weights: usize,
        masks: usize,
    },

    #[error("output layer has no sources")]
    NoSources,

    #[error("unknown copy_input source `{0}`")]
    UnknownCopyInput(String),

    #[error("{kind} targets are not supported by `{loss}`")]
    UnsupportedTargets { loss: LossType, kind: &'static str },

    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: i64, classes: usize },

    #[error("sprint_smoothed needs a log_prior of length {0}")]
    MissingLogPrior(usize),

    #[error("source `{0}` has no decoder projection (W_lm_in)")]
    MissingLmProjection(String),

    #[error("no {0} procedure configured")]
    MissingCollaborator(&'static str),

    #[error("external procedure failed: {0}")]
    External(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutputError>;
