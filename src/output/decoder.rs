use crate::activation::activation::ActivationFunction;
use crate::config::layer_config::OutputLayerConfig;
use crate::error::{OutputError, Result};
use crate::layers::params::ParamFactory;
use crate::layers::preactivation::PreActivation;
use crate::layers::source::SourceLayer;
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::loss::loss_type::LossType;
use crate::math::matrix::{argmax, Matrix};
use crate::math::tensor::Tensor3;
use crate::output::base::{options, LayerInputs, OutputLayer};
use crate::output::known_grads::Cost;

/// Ensemble of decoder heads: every source projects its own output onto the
/// classes through its `lm_projection`, and each stream is scored on its own.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub base: OutputLayer,
    /// One (time, batch, classes) score tensor per source.
    pub streams: Vec<Tensor3>,
    /// Element-wise sum of the streams, flattened.
    pub y_m: Matrix,
    pub p_y_given_x: Matrix,
    pub y_pred: Vec<usize>,
    pub output: Tensor3,
}

impl DecoderOutput {
    /// `params` is unused: every stream is projected by its source's `lm_projection`.
    pub fn build(config: &OutputLayerConfig, inputs: LayerInputs, _params: &mut dyn ParamFactory) -> Result<DecoderOutput> {
        match config.loss {
            LossType::Ce | LossType::Decode => {}
            other => return Err(OutputError::LossNotSupported { loss: other, layer: "decoder" }),
        }
        let streams = inputs.sources.iter()
            .map(|s| stream(s, config.n_out))
            .collect::<Result<Vec<_>>>()?;
        let sum = sum_streams(&streams)?;
        // the streams carry their own projections, so z is their sum and no W_in is created
        let pre = PreActivation::copy(&options(config), &SourceLayer::dense(config.name.clone(), sum));
        let mut base = OutputLayer::from_pre(config, &inputs, pre)?;
        base.loss = LossType::Decode;
        DecoderOutput::from_streams(base, streams)
    }

    pub fn from_streams(base: OutputLayer, streams: Vec<Tensor3>) -> Result<DecoderOutput> {
        let sum = sum_streams(&streams)?;
        sum.expect_shape([base.mask.time, base.mask.batch, sum.classes], "decoder streams vs mask")?;
        let y_m = sum.to_matrix();
        let p_y_given_x = ActivationFunction::Softmax.apply_rows(&y_m);
        let y_pred = base.index.valid.iter().map(|&k| argmax(y_m.row(k))).collect();
        let output = Tensor3::from_matrix(sum.time, sum.batch, &p_y_given_x)?;
        log::debug!("{}: decoder ensemble of {} stream(s)", base.name, streams.len());
        Ok(DecoderOutput { base, streams, y_m, p_y_given_x, y_pred, output })
    }

    /// Mean over streams of each stream's cross-entropy at the valid positions.
    pub fn cost(&self) -> Result<Cost> {
        let labels = self.base.valid_labels()?;
        let total: f64 = self.streams.iter()
            .map(|s| CrossEntropyLoss::loss(&s.to_matrix(), &self.base.index.valid, &labels))
            .sum();
        Ok(Cost::plain(total / self.streams.len() as f64))
    }

    /// Gradient of [`DecoderOutput::cost`] w.r.t. every stream, in source order.
    pub fn stream_gradients(&self) -> Result<Vec<Tensor3>> {
        let labels = self.base.valid_labels()?;
        let n = self.streams.len() as f64;
        self.streams.iter()
            .map(|s| {
                let g = CrossEntropyLoss::derivative(&s.to_matrix(), &self.base.index.valid, &labels);
                Tensor3::from_matrix(s.time, s.batch, &g.map(|x| x / n))
            })
            .collect()
    }

    pub fn errors(&self) -> Result<f64> {
        self.base.errors(&self.y_m)
    }

    pub fn entropy(&self) -> f64 {
        self.base.entropy(&self.p_y_given_x)
    }
}

/// Element-wise sum of same-shape streams.
fn sum_streams(streams: &[Tensor3]) -> Result<Tensor3> {
    let first = streams.first().ok_or(OutputError::NoSources)?;
    let mut sum = Tensor3::zeros(first.time, first.batch, first.classes);
    for s in streams {
        sum = sum.axpby(1.0, s, 1.0)?;
    }
    Ok(sum)
}

/// `source.output · W_lm` for one source.
fn stream(source: &SourceLayer, n_out: usize) -> Result<Tensor3> {
    let w = source.lm_projection.as_ref()
        .ok_or_else(|| OutputError::MissingLmProjection(source.name.clone()))?;
    if w.rows != source.output.classes || w.cols != n_out {
        return Err(OutputError::ShapeMismatch {
            what: "decoder projection",
            expected: vec![source.output.classes, n_out],
            found: vec![w.rows, w.cols],
        });
    }
    let x = source.output.to_matrix();
    Tensor3::from_matrix(source.output.time, source.output.batch, &x.dot(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::params::XavierInit;
    use crate::output::index::Mask;
    use crate::output::targets::{Labels, Targets};

    fn source(name: &str, scale: f64) -> SourceLayer {
        let x = Tensor3::from_nested(vec![
            vec![vec![1.0, 0.0]],
            vec![vec![0.0, 1.0]],
        ]).unwrap();
        let w = Matrix::from_data(vec![vec![scale, 0.0, 0.0], vec![0.0, 0.0, scale]]);
        SourceLayer::dense(name, x).with_lm_projection(w)
    }

    fn ensemble(sources: Vec<SourceLayer>) -> DecoderOutput {
        let labels = Labels::from_rows(vec![vec![0], vec![2]]).unwrap();
        let config = OutputLayerConfig::new("dec", 3, LossType::Decode);
        let inputs = LayerInputs::new(sources, Mask::ones(2, 1), Targets::Labels(labels));
        DecoderOutput::build(&config, inputs, &mut XavierInit::default()).unwrap()
    }

    #[test]
    fn identical_streams_cost_the_same_as_one() {
        let one = ensemble(vec![source("a", 2.0)]);
        let three = ensemble(vec![source("a", 2.0), source("b", 2.0), source("c", 2.0)]);
        assert!((one.cost().unwrap().value - three.cost().unwrap().value).abs() < 1e-12);
        assert_eq!(three.base.loss, LossType::Decode);
        assert_eq!(three.y_pred, vec![0, 2]);
    }

    #[test]
    fn output_is_the_sum_of_streams() {
        let dec = ensemble(vec![source("a", 1.0), source("b", 2.0)]);
        assert_eq!(dec.y_m.data[0], vec![3.0, 0.0, 0.0]);
        let grads = dec.stream_gradients().unwrap();
        assert_eq!(grads.len(), 2);
        let row: f64 = grads[0].cell(0, 0).iter().sum();
        assert!(row.abs() < 1e-12);
    }

    #[test]
    fn a_source_without_projection_is_rejected() {
        let labels = Labels::from_rows(vec![vec![0], vec![2]]).unwrap();
        let bare = SourceLayer::dense("x", Tensor3::zeros(2, 1, 2));
        let config = OutputLayerConfig::new("dec", 3, LossType::Decode);
        let inputs = LayerInputs::new(vec![bare], Mask::ones(2, 1), Targets::Labels(labels));
        let err = DecoderOutput::build(&config, inputs, &mut XavierInit::default()).unwrap_err();
        assert!(matches!(err, OutputError::MissingLmProjection(name) if name == "x"));
    }

    /// Counts weight requests.
    struct Counting(usize);

    impl ParamFactory for Counting {
        fn forward_weights(&mut self, n_in: usize, n_out: usize, _name: &str) -> Matrix {
            self.0 += 1;
            Matrix::zeros(n_in, n_out)
        }
    }

    #[test]
    fn no_input_weights_are_created() {
        let labels = Labels::from_rows(vec![vec![0], vec![2]]).unwrap();
        let config = OutputLayerConfig::new("dec", 3, LossType::Decode);
        let inputs = LayerInputs::new(vec![source("a", 1.0), source("b", 1.0)], Mask::ones(2, 1), Targets::Labels(labels));
        let mut params = Counting(0);
        let dec = DecoderOutput::build(&config, inputs, &mut params).unwrap();
        assert_eq!(params.0, 0);
        assert!(dec.base.pre.weights.is_empty());
        assert_eq!(dec.base.z.cell(0, 0), &[2.0, 0.0, 0.0]);
    }
}
