use crate::config::layer_config::{LayerClass, OutputLayerConfig};
use crate::error::Result;
use crate::layers::params::ParamFactory;
use crate::math::matrix::Matrix;
use crate::math::tensor::Tensor3;
use crate::output::base::{LayerInputs, OutputLayer};
use crate::output::decoder::DecoderOutput;
use crate::output::framewise::FramewiseOutput;
use crate::output::known_grads::Cost;
use crate::output::sequence::SequenceOutput;

/// An output layer of any class, chosen by `config.layer_class`.
#[derive(Debug)]
pub enum OutputHead {
    Framewise(FramewiseOutput),
    Decoder(DecoderOutput),
    Sequence(SequenceOutput),
}

impl OutputHead {
    pub fn build(config: &OutputLayerConfig, inputs: LayerInputs, params: &mut dyn ParamFactory) -> Result<OutputHead> {
        Ok(match config.layer_class {
            LayerClass::Softmax => OutputHead::Framewise(FramewiseOutput::build(config, inputs, params)?),
            LayerClass::Decoder => OutputHead::Decoder(DecoderOutput::build(config, inputs, params)?),
            LayerClass::Sequence => OutputHead::Sequence(SequenceOutput::build(config, inputs, params)?),
        })
    }

    pub fn base(&self) -> &OutputLayer {
        match self {
            OutputHead::Framewise(l) => &l.base,
            OutputHead::Decoder(l) => &l.base,
            OutputHead::Sequence(l) => &l.base,
        }
    }

    /// Flat (time×batch, classes) probabilities.
    pub fn probabilities(&self) -> &Matrix {
        match self {
            OutputHead::Framewise(l) => &l.p_y_given_x,
            OutputHead::Decoder(l) => &l.p_y_given_x,
            OutputHead::Sequence(l) => &l.p_y_given_x,
        }
    }

    pub fn y_pred(&self) -> &[usize] {
        match self {
            OutputHead::Framewise(l) => &l.y_pred,
            OutputHead::Decoder(l) => &l.y_pred,
            OutputHead::Sequence(l) => &l.y_pred,
        }
    }

    pub fn cost(&self) -> Result<Cost> {
        match self {
            OutputHead::Framewise(l) => l.cost(),
            OutputHead::Decoder(l) => l.cost(),
            OutputHead::Sequence(l) => l.cost(),
        }
    }

    /// Gradients of `cost`: one tensor at the layer output for framewise and
    /// sequence layers, one per stream for a decoder ensemble.
    pub fn gradient(&self, cost: &Cost) -> Result<Vec<Tensor3>> {
        match self {
            OutputHead::Framewise(l) => Ok(vec![l.gradient(cost)?]),
            OutputHead::Decoder(l) => l.stream_gradients(),
            OutputHead::Sequence(l) => Ok(vec![l.gradient(cost)?]),
        }
    }

    pub fn errors(&self) -> Result<f64> {
        match self {
            OutputHead::Framewise(l) => l.errors(),
            OutputHead::Decoder(l) => l.errors(),
            OutputHead::Sequence(l) => l.errors(),
        }
    }

    pub fn entropy(&self) -> f64 {
        match self {
            OutputHead::Framewise(l) => l.entropy(),
            OutputHead::Decoder(l) => l.entropy(),
            OutputHead::Sequence(l) => l.entropy(),
        }
    }
}
