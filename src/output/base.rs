use crate::activation::activation::clipped_ln;
use crate::config::layer_config::OutputLayerConfig;
use crate::error::{OutputError, Result};
use crate::layers::params::ParamFactory;
use crate::layers::preactivation::{ParamGrads, PreActivation, PreActivationOptions};
use crate::layers::source::{Consensus, SourceLayer};
use crate::loss::loss_type::LossType;
use crate::math::matrix::{argmax, Matrix};
use crate::math::tensor::Tensor3;
use crate::output::external::{AlignmentCost, Collaborators, CtcCost, BestPathDecoder};
use crate::output::index::{truncate, Mask, MaskedIndex};
use crate::output::targets::Targets;

/// Everything an output layer is built from besides its configuration.
pub struct LayerInputs {
    pub sources: Vec<SourceLayer>,
    /// Per-source gating masks; `None` for plain projection.
    pub masks: Vec<Option<Mask>>,
    /// The (time, batch) validity mask.
    pub index: Mask,
    pub targets: Targets,
    /// Candidate for the configured `copy_input`.
    pub copy_input: Option<SourceLayer>,
    /// Bias and weights to use instead of freshly created ones.
    pub params: Option<(Vec<f64>, Vec<Matrix>)>,
    pub consensus: Option<Box<dyn Consensus>>,
    pub collaborators: Collaborators,
}

impl LayerInputs {
    pub fn new(sources: Vec<SourceLayer>, index: Mask, targets: Targets) -> LayerInputs {
        let masks = vec![None; sources.len()];
        LayerInputs {
            sources,
            masks,
            index,
            targets,
            copy_input: None,
            params: None,
            consensus: None,
            collaborators: Collaborators::default(),
        }
    }

    pub fn with_masks(mut self, masks: Vec<Option<Mask>>) -> Self {
        self.masks = masks;
        self
    }

    pub fn with_copy_input(mut self, source: SourceLayer) -> Self {
        self.copy_input = Some(source);
        self
    }

    pub fn with_params(mut self, bias: Vec<f64>, weights: Vec<Matrix>) -> Self {
        self.params = Some((bias, weights));
        self
    }

    pub fn with_consensus(mut self, consensus: Box<dyn Consensus>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    pub fn with_ctc(mut self, ctc: Box<dyn CtcCost>) -> Self {
        self.collaborators.ctc = ctc;
        self
    }

    pub fn with_alignment(mut self, alignment: Box<dyn AlignmentCost>) -> Self {
        self.collaborators.alignment = Some(alignment);
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn BestPathDecoder>) -> Self {
        self.collaborators.decoder = decoder;
        self
    }
}

/// State shared by every output strategy: the pre-activation, the mask and
/// its flat index sets, the truncation normalizer and the targets.
#[derive(Debug, Clone)]
pub struct OutputLayer {
    pub name: String,
    pub n_out: usize,
    pub loss: LossType,
    pub pre: PreActivation,
    /// The pre-activation node every loss reads, after truncation.
    pub z: Tensor3,
    /// `consensus(z)` when depth > 1, else `z` itself.
    pub output: Tensor3,
    pub mask: Mask,
    pub index: MaskedIndex,
    pub norm: f64,
    pub targets: Targets,
    /// Names of the connected sources.
    pub from: Vec<String>,
    truncated_at: Option<usize>,
    output_sizes: Option<Vec<usize>>,
}

impl OutputLayer {
    /// Builds z, applies truncation, then derives the index sets, in that order.
    pub fn build(config: &OutputLayerConfig, inputs: &LayerInputs, params: &mut dyn ParamFactory) -> Result<OutputLayer> {
        let opts = options(config);
        let pre = match &config.copy_input {
            Some(name) => {
                let source = inputs.copy_input.iter()
                    .chain(inputs.sources.iter())
                    .find(|s| &s.name == name)
                    .ok_or_else(|| OutputError::UnknownCopyInput(name.clone()))?;
                if !inputs.sources.is_empty() {
                    log::warn!("{}: copy_input `{name}` bypasses {} configured source(s)", config.name, inputs.sources.len());
                }
                PreActivation::copy(&opts, source)
            }
            None => match &inputs.params {
                Some((bias, weights)) => {
                    PreActivation::assemble(&opts, bias.clone(), &inputs.sources, &inputs.masks, weights.clone())?
                }
                None => PreActivation::build(&opts, &inputs.sources, &inputs.masks, params)?,
            },
        };
        OutputLayer::from_pre(config, inputs, pre)
    }

    /// Finishes a layer around an already built pre-activation: truncation,
    /// index sets and the consensus over parallel copies.
    pub fn from_pre(config: &OutputLayerConfig, inputs: &LayerInputs, pre: PreActivation) -> Result<OutputLayer> {
        if pre.z.batch != inputs.index.batch {
            return Err(OutputError::ShapeMismatch {
                what: "pre-activation vs index batch",
                expected: vec![inputs.index.batch],
                found: vec![pre.z.batch],
            });
        }

        let truncated = truncate(&inputs.index, &pre.z, config.time_limit)?;
        let index = MaskedIndex::from_mask(&truncated.mask);

        let output = match (&inputs.consensus, config.depth) {
            (_, 0 | 1) => truncated.z.clone(),
            (Some(consensus), depth) => consensus.collapse(&truncated.z, depth)?,
            (None, _) => return Err(OutputError::MissingCollaborator("consensus")),
        };

        log::debug!(
            "{}: loss={} z={:?} valid={} norm={}",
            config.name,
            config.loss,
            truncated.z.shape(),
            index.len(),
            truncated.norm
        );

        Ok(OutputLayer {
            name: config.name.clone(),
            n_out: config.n_out,
            loss: config.loss,
            pre,
            z: truncated.z,
            output,
            mask: truncated.mask,
            index,
            norm: truncated.norm,
            targets: inputs.targets.clone(),
            from: inputs.sources.iter().map(|s| s.name.clone()).collect(),
            truncated_at: truncated.end,
            output_sizes: inputs.sources.iter().find_map(|s| s.output_sizes.clone()),
        })
    }

    /// `-Σ p·log p` over the valid rows of `probs`.
    pub fn entropy(&self, probs: &Matrix) -> f64 {
        -self.index.valid.iter()
            .map(|&k| probs.row(k).iter().map(|&p| p * clipped_ln(p)).sum::<f64>())
            .sum::<f64>()
    }

    /// Framewise error metric over the valid rows of `y_m`.
    ///
    /// Integer targets count arg-max disagreements, scaled by the norm; float
    /// targets sum the squared residuals.
    pub fn errors(&self, y_m: &Matrix) -> Result<f64> {
        match &self.targets {
            Targets::Labels(_) | Targets::OneHot(_) => {
                self.targets.expect_positions(y_m.rows)?;
                let mut wrong = 0usize;
                for &k in &self.index.valid {
                    if argmax(y_m.row(k)) != self.targets.class_at(k, y_m.cols)? {
                        wrong += 1;
                    }
                }
                Ok(self.norm * wrong as f64)
            }
            Targets::Dense(y) => {
                let y = reshape_like(y, y_m)?;
                Ok(self.index.valid.iter()
                    .map(|&k| {
                        y_m.row(k).iter().zip(y.row(k).iter())
                            .map(|(a, b)| (a - b).powi(2))
                            .sum::<f64>()
                    })
                    .sum())
            }
        }
    }

    /// Class ids at the valid positions, in index order.
    pub fn valid_labels(&self) -> Result<Vec<usize>> {
        self.targets.expect_positions(self.mask.time * self.mask.batch)?;
        self.index.valid.iter()
            .map(|&k| self.targets.class_at(k, self.n_out))
            .collect()
    }

    /// Per-sequence valid lengths: the first length annotation among the
    /// sources, else the column sums of the mask.
    pub fn lengths(&self) -> Vec<usize> {
        match &self.output_sizes {
            Some(sizes) => sizes.clone(),
            None => self.mask.column_sums(),
        }
    }

    /// Pushes a gradient at `z` back to the layer parameters. Truncated steps
    /// receive no gradient.
    pub fn backward(&self, d_z: &Tensor3) -> Result<ParamGrads> {
        let mut grad = d_z.clone();
        if let Some(end) = self.truncated_at {
            let keep = end.min(grad.time) * grad.batch * grad.classes;
            for g in &mut grad.data[keep..] {
                *g = 0.0;
            }
        }
        self.pre.backward(&grad)
    }
}

pub(crate) fn options(config: &OutputLayerConfig) -> PreActivationOptions {
    PreActivationOptions {
        layer_name: config.name.clone(),
        n_out: config.n_out,
        mass: config.mass,
        grad_clip_z: config.grad_clip_z,
        grad_discard_out_of_bound_z: config.grad_discard_out_of_bound_z,
    }
}

/// Reshapes float targets to the row/column layout of `like`.
pub(crate) fn reshape_like(y: &Matrix, like: &Matrix) -> Result<Matrix> {
    if y.rows == like.rows && y.cols == like.cols {
        return Ok(y.clone());
    }
    if y.rows * y.cols != like.rows * like.cols {
        return Err(OutputError::ShapeMismatch {
            what: "float targets",
            expected: vec![like.rows, like.cols],
            found: vec![y.rows, y.cols],
        });
    }
    Ok(Matrix::from_flat(like.rows, like.cols, &y.to_flat()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::params::XavierInit;
    use crate::output::targets::Labels;

    fn copied(config: &mut OutputLayerConfig) {
        config.copy_input = Some("h".into());
    }

    fn labels(time: usize, batch: usize) -> Targets {
        Targets::Labels(Labels::new(time, batch, vec![0; time * batch]).unwrap())
    }

    /// Averages the `depth` equal slices of the class axis.
    struct MeanOfCopies;

    impl Consensus for MeanOfCopies {
        fn collapse(&self, z: &Tensor3, depth: usize) -> Result<Tensor3> {
            let n = z.classes / depth;
            let mut out = Tensor3::zeros(z.time, z.batch, n);
            for t in 0..z.time {
                for b in 0..z.batch {
                    let cell = z.cell(t, b);
                    for (c, o) in out.cell_mut(t, b).iter_mut().enumerate() {
                        *o = (0..depth).map(|d| cell[d * n + c]).sum::<f64>() / depth as f64;
                    }
                }
            }
            Ok(out)
        }
    }

    #[test]
    fn lengths_follow_the_source_annotation() {
        let mut config = OutputLayerConfig::new("out", 2, LossType::Ce);
        copied(&mut config);
        let mask = Mask::from_rows(vec![vec![1.0, 1.0], vec![1.0, 0.0], vec![0.0, 0.0]]).unwrap();

        let plain = LayerInputs::new(vec![SourceLayer::dense("h", Tensor3::zeros(3, 2, 2))], mask.clone(), labels(3, 2));
        let layer = OutputLayer::build(&config, &plain, &mut XavierInit::default()).unwrap();
        assert_eq!(layer.lengths(), vec![2, 1]);

        let annotated = SourceLayer::dense("h", Tensor3::zeros(3, 2, 2)).with_output_sizes(vec![3, 3]);
        let inputs = LayerInputs::new(vec![annotated], mask, labels(3, 2));
        let layer = OutputLayer::build(&config, &inputs, &mut XavierInit::default()).unwrap();
        assert_eq!(layer.lengths(), vec![3, 3]);
    }

    #[test]
    fn consensus_collapses_parallel_copies() {
        let mut config = OutputLayerConfig::new("out", 2, LossType::Ce);
        copied(&mut config);
        config.depth = 2;
        let z = Tensor3::from_nested(vec![vec![vec![1.0, 3.0, 3.0, 5.0]]]).unwrap();
        let inputs = LayerInputs::new(vec![], Mask::ones(1, 1), labels(1, 1))
            .with_copy_input(SourceLayer::dense("h", z))
            .with_consensus(Box::new(MeanOfCopies));
        let layer = OutputLayer::build(&config, &inputs, &mut XavierInit::default()).unwrap();
        assert_eq!(layer.z.shape(), [1, 1, 4]);
        assert_eq!(layer.output.cell(0, 0), &[2.0, 4.0]);
    }

    #[test]
    fn parallel_copies_need_a_consensus() {
        let mut config = OutputLayerConfig::new("out", 2, LossType::Ce);
        copied(&mut config);
        config.depth = 2;
        let inputs = LayerInputs::new(vec![], Mask::ones(1, 1), labels(1, 1))
            .with_copy_input(SourceLayer::dense("h", Tensor3::zeros(1, 1, 4)));
        let err = OutputLayer::build(&config, &inputs, &mut XavierInit::default()).unwrap_err();
        assert!(matches!(err, OutputError::MissingCollaborator("consensus")));
    }

    #[test]
    fn truncated_steps_get_no_gradient() {
        let mut config = OutputLayerConfig::new("out", 2, LossType::Ce);
        copied(&mut config);
        config.time_limit = 1;
        let inputs = LayerInputs::new(vec![], Mask::ones(3, 2), labels(3, 2))
            .with_copy_input(SourceLayer::dense("h", Tensor3::filled(3, 2, 2, 0.5)));
        let layer = OutputLayer::build(&config, &inputs, &mut XavierInit::default()).unwrap();
        assert_eq!(layer.norm, 3.0);

        let grads = layer.backward(&Tensor3::filled(3, 2, 2, 1.0)).unwrap();
        let g = grads.copy_input.unwrap();
        assert_eq!(g.cell(0, 1), &[1.0, 1.0]);
        for t in 1..3 {
            for b in 0..2 {
                assert_eq!(g.cell(t, b), &[0.0, 0.0]);
            }
        }
    }
}
