pub mod layer_config;

pub use layer_config::{LayerClass, OutputLayerConfig};
