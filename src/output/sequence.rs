use crate::activation::activation::ActivationFunction;
use crate::config::layer_config::OutputLayerConfig;
use crate::error::{OutputError, Result};
use crate::layers::params::ParamFactory;
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::loss::ctc::{uniq_with_lengths, CtcLoss, CtcOutput};
use crate::loss::loss_type::LossType;
use crate::math::matrix::{argmax, Matrix};
use crate::math::tensor::Tensor3;
use crate::output::base::{LayerInputs, OutputLayer};
use crate::output::external::Collaborators;
use crate::output::known_grads::{Cost, KnownGrads};
use crate::output::targets::Labels;

/// Sequence-level losses and the state each one needs.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceLoss {
    /// External CTC procedure; its gradient overrides z.
    Ctc,
    /// Plain cross-entropy against frame labels, no override.
    CeCtc,
    /// In-process CTC over de-duplicated labels, no override.
    Ctc2,
    /// Forced alignment against the reference named `target`.
    Sprint { target: String },
    /// Forced alignment blended with a prior-shifted cross-entropy.
    SprintSmoothed {
        target: String,
        smoothing: f64,
        prior_scale: f64,
        log_prior: Vec<f64>,
    },
}

impl SequenceLoss {
    pub fn from_config(config: &OutputLayerConfig) -> Result<SequenceLoss> {
        match config.loss {
            LossType::Ctc => Ok(SequenceLoss::Ctc),
            LossType::CeCtc => Ok(SequenceLoss::CeCtc),
            LossType::Ctc2 => Ok(SequenceLoss::Ctc2),
            LossType::Sprint => Ok(SequenceLoss::Sprint { target: config.target.clone() }),
            LossType::SprintSmoothed => match &config.log_prior {
                Some(log_prior) if log_prior.len() == config.n_out => Ok(SequenceLoss::SprintSmoothed {
                    target: config.target.clone(),
                    smoothing: config.ce_smoothing,
                    prior_scale: config.prior_scale,
                    log_prior: log_prior.clone(),
                }),
                _ => Err(OutputError::MissingLogPrior(config.n_out)),
            },
            other => Err(OutputError::LossNotSupported { loss: other, layer: "sequence" }),
        }
    }

    pub fn loss_type(&self) -> LossType {
        match self {
            SequenceLoss::Ctc => LossType::Ctc,
            SequenceLoss::CeCtc => LossType::CeCtc,
            SequenceLoss::Ctc2 => LossType::Ctc2,
            SequenceLoss::Sprint { .. } => LossType::Sprint,
            SequenceLoss::SprintSmoothed { .. } => LossType::SprintSmoothed,
        }
    }
}

/// Output layer trained on whole label sequences.
///
/// Losses backed by an external procedure (ctc, sprint, sprint_smoothed)
/// return their gradient as an override keyed by `base.z`; the rest are
/// differentiated locally.
#[derive(Debug)]
pub struct SequenceOutput {
    pub base: OutputLayer,
    pub loss: SequenceLoss,
    pub y_m: Matrix,
    pub p_y_given_x: Matrix,
    pub y_pred: Vec<usize>,
    /// Softmax over classes, laid out like z.
    pub output: Tensor3,
    collaborators: Collaborators,
}

impl SequenceOutput {
    pub fn build(config: &OutputLayerConfig, inputs: LayerInputs, params: &mut dyn ParamFactory) -> Result<SequenceOutput> {
        let loss = SequenceLoss::from_config(config)?;
        let base = OutputLayer::build(config, &inputs, params)?;
        SequenceOutput::from_base(base, loss, inputs.collaborators)
    }

    pub fn from_base(base: OutputLayer, loss: SequenceLoss, collaborators: Collaborators) -> Result<SequenceOutput> {
        if base.z.shape()[..2] != base.mask.shape() {
            return Err(OutputError::ShapeMismatch {
                what: "z vs mask",
                expected: base.mask.shape().to_vec(),
                found: base.z.shape()[..2].to_vec(),
            });
        }
        let y_m = base.z.to_matrix();
        let p_y_given_x = ActivationFunction::Softmax.apply_rows(&y_m);
        let y_pred = base.index.valid.iter().map(|&k| argmax(p_y_given_x.row(k))).collect();
        let output = Tensor3::from_matrix(base.z.time, base.z.batch, &p_y_given_x)?;
        Ok(SequenceOutput { base, loss, y_m, p_y_given_x, y_pred, output, collaborators })
    }

    fn labels(&self) -> Result<&Labels> {
        self.base.targets.labels().ok_or(OutputError::UnsupportedTargets {
            loss: self.loss.loss_type(),
            kind: self.base.targets.kind(),
        })
    }

    pub fn cost(&self) -> Result<Cost> {
        match &self.loss {
            SequenceLoss::Sprint { target } => {
                let (errors, grad) = self.align(target)?;
                let mut known = KnownGrads::new();
                known.insert(&self.base.z, grad)?;
                Ok(Cost { value: errors.iter().sum(), known_grads: Some(known), priors: None })
            }
            SequenceLoss::SprintSmoothed { target, smoothing, prior_scale, log_prior } => {
                let (errors, grad) = self.align(target)?;
                let w = *smoothing;
                let shifted = self.prior_shifted(*prior_scale, log_prior);
                let labels = self.base.valid_labels()?;
                let rows = &self.base.index.valid;
                let ce = w * CrossEntropyLoss::loss(&shifted, rows, &labels);
                let d_ce = CrossEntropyLoss::derivative(&shifted, rows, &labels).map(|g| w * g);
                let d_ce = Tensor3::from_matrix(self.base.z.time, self.base.z.batch, &d_ce)?;
                let mut known = KnownGrads::new();
                known.insert(&self.base.z, grad.axpby(1.0 - w, &d_ce, 1.0)?)?;
                let value = (1.0 - w) * errors.iter().sum::<f64>() + ce;
                Ok(Cost { value, known_grads: Some(known), priors: None })
            }
            SequenceLoss::Ctc => {
                let lengths = self.base.lengths();
                let out = self.collaborators.ctc.cost(&self.output, &self.labels()?.sequences(), &lengths)?;
                let mut priors = vec![0.0; out.priors.cols];
                for row in &out.priors.data {
                    for (acc, p) in priors.iter_mut().zip(row) {
                        *acc += p;
                    }
                }
                let mut known = KnownGrads::new();
                known.insert(&self.base.z, out.grad)?;
                Ok(Cost { value: out.errors.iter().sum(), known_grads: Some(known), priors: Some(priors) })
            }
            SequenceLoss::CeCtc => {
                let labels = self.base.valid_labels()?;
                Ok(Cost::plain(CrossEntropyLoss::loss(&self.y_m, &self.base.index.valid, &labels)))
            }
            SequenceLoss::Ctc2 => Ok(Cost::plain(self.ctc2()?.costs.iter().sum())),
        }
    }

    /// The gradient at z: the override carried by `cost` when it has one,
    /// otherwise the locally differentiated loss.
    pub fn gradient(&self, cost: &Cost) -> Result<Tensor3> {
        cost.grad_for(&self.base.z, || match &self.loss {
            SequenceLoss::CeCtc => {
                let labels = self.base.valid_labels()?;
                let g = CrossEntropyLoss::derivative(&self.y_m, &self.base.index.valid, &labels);
                Tensor3::from_matrix(self.base.z.time, self.base.z.batch, &g)
            }
            SequenceLoss::Ctc2 => Ok(self.ctc2()?.grad_z),
            _ => {
                // an override-based loss handed a cost without one: recompute it
                let fresh = self.cost()?;
                fresh.known_grads
                    .as_ref()
                    .and_then(|k| k.get(&self.base.z))
                    .cloned()
                    .ok_or(OutputError::MissingCollaborator("gradient override"))
            }
        })
    }

    /// Best-path decoding mismatches for ctc and ce_ctc, the framewise metric otherwise.
    pub fn errors(&self) -> Result<f64> {
        match self.loss {
            SequenceLoss::Ctc | SequenceLoss::CeCtc => {
                let lengths = self.base.lengths();
                self.collaborators.decoder.errors(&self.output, &self.labels()?.sequences(), &lengths)
            }
            _ => self.base.errors(&self.y_m),
        }
    }

    pub fn entropy(&self) -> f64 {
        self.base.entropy(&self.p_y_given_x)
    }

    fn align(&self, target: &str) -> Result<(Vec<f64>, Tensor3)> {
        let alignment = self.collaborators.alignment.as_ref()
            .ok_or(OutputError::MissingCollaborator("alignment"))?;
        alignment.cost(target, &self.output, &self.base.lengths())
    }

    /// `z + prior_scale · log_prior`, flattened.
    fn prior_shifted(&self, prior_scale: f64, log_prior: &[f64]) -> Matrix {
        let mut shifted = self.y_m.clone();
        for row in shifted.data.iter_mut() {
            for (x, lp) in row.iter_mut().zip(log_prior) {
                *x += prior_scale * lp;
            }
        }
        shifted
    }

    fn ctc2(&self) -> Result<CtcOutput> {
        let blank = self.base.n_out.saturating_sub(1);
        let (targets, _) = uniq_with_lengths(self.labels()?, &self.base.mask, blank);
        CtcLoss::new(blank).cost_and_grad(&self.base.z, &targets, &self.base.mask.column_sums())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::params::XavierInit;
    use crate::layers::source::SourceLayer;
    use crate::output::external::AlignmentCost;
    use crate::output::index::Mask;
    use crate::output::targets::Targets;

    /// Returns a fixed error and gradient per call.
    struct FixedAlignment {
        error: f64,
        grad: f64,
    }

    impl AlignmentCost for FixedAlignment {
        fn cost(&self, _target: &str, probs: &Tensor3, lengths: &[usize]) -> Result<(Vec<f64>, Tensor3)> {
            let [t, b, c] = probs.shape();
            Ok((vec![self.error; lengths.len()], Tensor3::filled(t, b, c, self.grad)))
        }
    }

    fn layer(config: OutputLayerConfig, z: Tensor3, labels: Labels) -> SequenceOutput {
        let mut config = config;
        config.copy_input = Some("z".into());
        let mask = Mask::ones(z.time, z.batch);
        let inputs = LayerInputs::new(vec![], mask, Targets::Labels(labels))
            .with_copy_input(SourceLayer::dense("z", z))
            .with_alignment(Box::new(FixedAlignment { error: 2.0, grad: 0.25 }));
        SequenceOutput::build(&config, inputs, &mut XavierInit::default()).unwrap()
    }

    fn labels() -> Labels {
        Labels::from_rows(vec![vec![0], vec![1]]).unwrap()
    }

    #[test]
    fn sprint_installs_the_alignment_gradient_on_z() {
        let config = OutputLayerConfig::new("out", 3, LossType::Sprint);
        let out = layer(config, Tensor3::zeros(2, 1, 3), labels());
        let cost = out.cost().unwrap();
        assert_eq!(cost.value, 2.0);
        let known = cost.known_grads.as_ref().unwrap();
        assert_eq!(known.len(), 1);
        assert!(known.contains(&out.base.z));
        assert_eq!(out.gradient(&cost).unwrap().data, vec![0.25; 6]);
    }

    #[test]
    fn sprint_smoothed_blends_both_gradients() {
        let mut config = OutputLayerConfig::new("out", 2, LossType::SprintSmoothed);
        config.ce_smoothing = 0.3;
        config.log_prior = Some(vec![0.0, 0.0]);
        let out = layer(config, Tensor3::zeros(2, 1, 2), labels());
        let cost = out.cost().unwrap();
        let expected = 0.7 * 2.0 + 0.3 * 2.0 * 2f64.ln();
        assert!((cost.value - expected).abs() < 1e-12);
        let g = out.gradient(&cost).unwrap();
        // 0.7 · 0.25 plus 0.3 · (0.5 - 1) at the labelled class
        assert!((g.cell(0, 0)[0] - (0.175 - 0.15)).abs() < 1e-12);
        assert!((g.cell(0, 0)[1] - (0.175 + 0.15)).abs() < 1e-12);
    }

    #[test]
    fn sprint_smoothed_needs_a_log_prior() {
        let config = OutputLayerConfig::new("out", 2, LossType::SprintSmoothed);
        assert!(matches!(SequenceLoss::from_config(&config), Err(OutputError::MissingLogPrior(2))));
    }

    #[test]
    fn ce_ctc_is_plain_cross_entropy() {
        let config = OutputLayerConfig::new("out", 2, LossType::CeCtc);
        let out = layer(config, Tensor3::zeros(2, 1, 2), labels());
        let cost = out.cost().unwrap();
        assert!(cost.known_grads.is_none());
        assert!((cost.value - 2.0 * 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn ctc_reports_summed_priors() {
        // classes {a, blank}, two frames, transcript "a"
        let config = OutputLayerConfig::new("out", 2, LossType::Ctc);
        let out = layer(config, Tensor3::zeros(2, 1, 2), Labels::from_rows(vec![vec![0], vec![-1]]).unwrap());
        let cost = out.cost().unwrap();
        // paths: a a, a _, _ a out of four equally likely ones
        assert!((cost.value - (4.0f64 / 3.0).ln()).abs() < 1e-9);
        let priors = cost.priors.unwrap();
        assert!((priors.iter().sum::<f64>() - 2.0).abs() < 1e-9);
        assert!(cost.known_grads.unwrap().contains(&out.base.z));
    }

    #[test]
    fn ctc2_matches_the_in_process_recursion() {
        let config = OutputLayerConfig::new("out", 2, LossType::Ctc2);
        let out = layer(config, Tensor3::zeros(2, 1, 2), Labels::from_rows(vec![vec![0], vec![0]]).unwrap());
        let cost = out.cost().unwrap();
        assert!(cost.known_grads.is_none());
        assert!((cost.value - (4.0f64 / 3.0).ln()).abs() < 1e-9);
    }

    #[test]
    fn framewise_losses_are_rejected() {
        let config = OutputLayerConfig::new("out", 2, LossType::Ce);
        assert!(SequenceLoss::from_config(&config).is_err());
    }

    /// Reports a fixed mismatch count.
    struct FixedDecoder(f64);

    impl crate::output::external::BestPathDecoder for FixedDecoder {
        fn errors(&self, _probs: &Tensor3, _targets: &[Vec<usize>], _lengths: &[usize]) -> Result<f64> {
            Ok(self.0)
        }
    }

    fn with_decoder(loss: LossType) -> SequenceOutput {
        let mut config = OutputLayerConfig::new("out", 3, loss);
        config.copy_input = Some("z".into());
        // frame predictions 0, 2 against labels 0, 1: one framewise mistake
        let z = Tensor3::from_nested(vec![vec![vec![5.0, 0.0, 0.0]], vec![vec![0.0, 0.0, 5.0]]]).unwrap();
        let inputs = LayerInputs::new(vec![], Mask::ones(2, 1), Targets::Labels(labels()))
            .with_copy_input(SourceLayer::dense("z", z))
            .with_alignment(Box::new(FixedAlignment { error: 0.0, grad: 0.0 }))
            .with_decoder(Box::new(FixedDecoder(7.0)));
        SequenceOutput::build(&config, inputs, &mut XavierInit::default()).unwrap()
    }

    #[test]
    fn ctc_style_losses_count_best_path_errors() {
        assert_eq!(with_decoder(LossType::Ctc).errors().unwrap(), 7.0);
        assert_eq!(with_decoder(LossType::CeCtc).errors().unwrap(), 7.0);
    }

    #[test]
    fn other_sequence_losses_use_framewise_errors() {
        assert_eq!(with_decoder(LossType::Sprint).errors().unwrap(), 1.0);
        assert_eq!(with_decoder(LossType::Ctc2).errors().unwrap(), 1.0);
    }

    #[test]
    fn z_shorter_than_the_mask_is_rejected() {
        let mut config = OutputLayerConfig::new("out", 3, LossType::CeCtc);
        config.copy_input = Some("z".into());
        let labels = Labels::from_rows(vec![vec![0], vec![1], vec![2]]).unwrap();
        let inputs = LayerInputs::new(vec![], Mask::ones(3, 1), Targets::Labels(labels))
            .with_copy_input(SourceLayer::dense("z", Tensor3::zeros(1, 1, 3)));
        let err = SequenceOutput::build(&config, inputs, &mut XavierInit::default()).unwrap_err();
        assert!(matches!(err, OutputError::ShapeMismatch { what: "z vs mask", .. }));
    }
}
