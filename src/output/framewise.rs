use crate::activation::activation::ActivationFunction;
use crate::config::layer_config::OutputLayerConfig;
use crate::error::{OutputError, Result};
use crate::layers::params::ParamFactory;
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::loss::entropy::EntropyLoss;
use crate::loss::loss_type::LossType;
use crate::loss::priori::PrioriLoss;
use crate::loss::sse::SseLoss;
use crate::math::matrix::{argmax, Matrix};
use crate::math::tensor::Tensor3;
use crate::output::base::{reshape_like, LayerInputs, OutputLayer};
use crate::output::known_grads::Cost;
use crate::output::targets::Targets;

/// Per-frame losses. `Priori` owns the learned class prior.
#[derive(Debug, Clone, PartialEq)]
pub enum FramewiseLoss {
    Ce,
    Entropy,
    Sse,
    Priori { prior: Vec<f64> },
}

impl FramewiseLoss {
    pub fn from_type(loss: LossType, n_out: usize) -> Result<FramewiseLoss> {
        match loss {
            LossType::Ce => Ok(FramewiseLoss::Ce),
            LossType::Entropy => Ok(FramewiseLoss::Entropy),
            LossType::Sse => Ok(FramewiseLoss::Sse),
            LossType::Priori => Ok(FramewiseLoss::Priori { prior: vec![1.0; n_out] }),
            other => Err(OutputError::LossNotSupported { loss: other, layer: "framewise" }),
        }
    }

    pub fn loss_type(&self) -> LossType {
        match self {
            FramewiseLoss::Ce => LossType::Ce,
            FramewiseLoss::Entropy => LossType::Entropy,
            FramewiseLoss::Sse => LossType::Sse,
            FramewiseLoss::Priori { .. } => LossType::Priori,
        }
    }

    pub fn activation(&self) -> ActivationFunction {
        match self {
            FramewiseLoss::Sse => ActivationFunction::Identity,
            _ => ActivationFunction::Softmax,
        }
    }
}

/// Output layer scoring every valid frame independently.
#[derive(Debug, Clone)]
pub struct FramewiseOutput {
    pub base: OutputLayer,
    pub loss: FramewiseLoss,
    /// Flat (time×batch, classes) scores.
    pub y_m: Matrix,
    /// Flat probabilities (or raw scores for `sse`).
    pub p_y_given_x: Matrix,
    /// Arg-max of `y_m` at the valid positions.
    pub y_pred: Vec<usize>,
    /// `p_y_given_x` laid out (time, batch, classes).
    pub output: Tensor3,
    reps: usize,
}

impl FramewiseOutput {
    pub fn build(config: &OutputLayerConfig, inputs: LayerInputs, params: &mut dyn ParamFactory) -> Result<FramewiseOutput> {
        let loss = FramewiseLoss::from_type(config.loss, config.n_out)?;
        let base = OutputLayer::build(config, &inputs, params)?;
        FramewiseOutput::from_base(base, loss)
    }

    pub fn from_base(base: OutputLayer, loss: FramewiseLoss) -> Result<FramewiseOutput> {
        // a single-step output (decoder context) is broadcast over the mask's time axis
        let reps = if base.output.time == 1 { base.mask.time.max(1) } else { 1 };
        let output = base.output.repeat_time(reps);
        if output.shape()[..2] != base.mask.shape() {
            return Err(OutputError::ShapeMismatch {
                what: "output vs mask",
                expected: base.mask.shape().to_vec(),
                found: output.shape()[..2].to_vec(),
            });
        }
        let y_m = output.to_matrix();
        let mut p_y_given_x = loss.activation().apply_rows(&y_m);
        if let FramewiseLoss::Priori { prior } = &loss {
            p_y_given_x = PrioriLoss::probabilities(&y_m, prior);
        }
        let y_pred = base.index.valid.iter().map(|&k| argmax(y_m.row(k))).collect();
        let output = Tensor3::from_matrix(output.time, output.batch, &p_y_given_x)?;
        Ok(FramewiseOutput { base, loss, y_m, p_y_given_x, y_pred, output, reps })
    }

    fn unsupported(&self) -> OutputError {
        OutputError::UnsupportedTargets { loss: self.loss.loss_type(), kind: self.base.targets.kind() }
    }

    pub fn cost(&self) -> Result<Cost> {
        let rows = &self.base.index.valid;
        let value = match (&self.loss, &self.base.targets) {
            (FramewiseLoss::Ce, Targets::Dense(y)) => {
                self.base.norm * CrossEntropyLoss::soft_loss(&self.p_y_given_x, rows, &reshape_like(y, &self.y_m)?)
            }
            (FramewiseLoss::Ce, _) => {
                self.base.norm * CrossEntropyLoss::loss(&self.y_m, rows, &self.base.valid_labels()?)
            }
            (FramewiseLoss::Priori { prior }, Targets::Labels(_) | Targets::OneHot(_)) => {
                PrioriLoss::loss(&self.y_m, prior, rows, &self.base.valid_labels()?)
            }
            (FramewiseLoss::Entropy, Targets::Labels(labels)) => {
                EntropyLoss::loss(&self.y_m, &self.base.mask, labels)?
            }
            (FramewiseLoss::Sse, Targets::Dense(y)) => {
                SseLoss::loss(&self.y_m, rows, &reshape_like(y, &self.y_m)?)
            }
            (FramewiseLoss::Sse, _) => {
                SseLoss::one_hot_loss(&self.p_y_given_x, rows, &self.base.valid_labels()?)
            }
            _ => return Err(self.unsupported()),
        };
        Ok(Cost::plain(value))
    }

    /// Gradient of the cost w.r.t. the layer output (`z` when depth is 1),
    /// summed back over the broadcast time steps.
    pub fn gradient(&self, cost: &Cost) -> Result<Tensor3> {
        cost.grad_for(&self.base.output, || {
            let rows = &self.base.index.valid;
            let flat = match (&self.loss, &self.base.targets) {
                (FramewiseLoss::Ce, Targets::Dense(y)) => {
                    let g = CrossEntropyLoss::soft_derivative(&self.p_y_given_x, rows, &reshape_like(y, &self.y_m)?);
                    g.map(|x| x * self.base.norm)
                }
                (FramewiseLoss::Ce, _) => {
                    let g = CrossEntropyLoss::derivative(&self.y_m, rows, &self.base.valid_labels()?);
                    g.map(|x| x * self.base.norm)
                }
                (FramewiseLoss::Priori { prior }, Targets::Labels(_) | Targets::OneHot(_)) => {
                    PrioriLoss::derivative(&self.y_m, prior, rows, &self.base.valid_labels()?).0
                }
                (FramewiseLoss::Entropy, Targets::Labels(labels)) => {
                    EntropyLoss::derivative(&self.y_m, &self.base.mask, labels)?
                }
                (FramewiseLoss::Sse, Targets::Dense(y)) => {
                    SseLoss::derivative(&self.y_m, rows, &reshape_like(y, &self.y_m)?)
                }
                (FramewiseLoss::Sse, _) => {
                    SseLoss::one_hot_derivative(&self.p_y_given_x, rows, &self.base.valid_labels()?)
                }
                _ => return Err(self.unsupported()),
            };
            self.fold_repeats(&flat)
        })
    }

    /// Gradient w.r.t. the learned prior; `None` unless the loss is `priori`.
    pub fn prior_gradient(&self) -> Result<Option<Vec<f64>>> {
        match &self.loss {
            FramewiseLoss::Priori { prior } => {
                let labels = self.base.valid_labels()?;
                Ok(Some(PrioriLoss::derivative(&self.y_m, prior, &self.base.index.valid, &labels).1))
            }
            _ => Ok(None),
        }
    }

    pub fn errors(&self) -> Result<f64> {
        self.base.errors(&self.y_m)
    }

    pub fn entropy(&self) -> f64 {
        self.base.entropy(&self.p_y_given_x)
    }

    fn fold_repeats(&self, flat: &Matrix) -> Result<Tensor3> {
        let out = &self.base.output;
        let mut grad = Tensor3::zeros(out.time, out.batch, out.classes);
        let step = out.time * out.batch;
        debug_assert_eq!(self.reps * step, flat.rows);
        for (k, row) in flat.data.iter().enumerate() {
            let cell = k % step;
            let (t, b) = (cell / out.batch, cell % out.batch);
            for (acc, g) in grad.cell_mut(t, b).iter_mut().zip(row) {
                *acc += g;
            }
        }
        Ok(grad)
    }
}
