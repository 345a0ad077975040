pub mod error;
pub mod math;
pub mod activation;
pub mod layers;
pub mod loss;
pub mod output;
pub mod config;

// Convenience re-exports
pub use error::{OutputError, Result};
pub use math::matrix::Matrix;
pub use math::tensor::{NodeId, Tensor3};
pub use config::layer_config::{LayerClass, OutputLayerConfig};
pub use layers::params::{ParamFactory, XavierInit};
pub use layers::source::SourceLayer;
pub use loss::loss_type::LossType;
pub use output::head::OutputHead;
pub use output::base::LayerInputs;
pub use output::index::Mask;
pub use output::targets::{Labels, Targets};
pub use output::known_grads::{Cost, KnownGrads};
