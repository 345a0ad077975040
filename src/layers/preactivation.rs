use crate::error::{OutputError, Result};
use crate::layers::grad_filter::GradFilter;
use crate::layers::params::{create_bias, ParamFactory};
use crate::layers::source::SourceLayer;
use crate::math::matrix::Matrix;
use crate::math::tensor::Tensor3;
use crate::output::index::Mask;

/// How one source adds into `z`, fixed when the layer is built.
#[derive(Debug, Clone)]
enum Contribution {
    /// `W[id]` row lookup for sparse (class id) sources.
    Gather,
    /// `x · W`.
    Project,
    /// `(mass · m · x) · W`, gated by a per-position mask.
    GatedProject(Mask),
}

/// Options shared by every way of building `z`.
#[derive(Debug, Clone, Default)]
pub struct PreActivationOptions {
    pub layer_name: String,
    pub n_out: usize,
    /// Scale applied together with source masks.
    pub mass: f64,
    pub grad_clip_z: Option<f64>,
    pub grad_discard_out_of_bound_z: Option<f64>,
}

/// Gradients of the pre-activation's parameters and inputs.
#[derive(Debug, Clone)]
pub struct ParamGrads {
    pub bias: Vec<f64>,
    /// One entry per source, same order as the weights.
    pub weights: Vec<Matrix>,
    /// Gradient handed to the `copy_input` source, when `z` was copied.
    pub copy_input: Option<Tensor3>,
}

/// The raw per-class score tensor `z = b + Σ_s contribution(s)` with its
/// parameters, plus the gradient filters sitting on top of it.
#[derive(Debug, Clone)]
pub struct PreActivation {
    pub z: Tensor3,
    pub bias: Vec<f64>,
    pub weights: Vec<Matrix>,
    pub weight_names: Vec<String>,
    inputs: Vec<Tensor3>,
    contributions: Vec<Contribution>,
    copied: bool,
    mass: f64,
    filters: Vec<GradFilter>,
}

impl PreActivation {
    /// Creates bias and weights (through `params`) and sums every source.
    pub fn build(
        opts: &PreActivationOptions,
        sources: &[SourceLayer],
        masks: &[Option<Mask>],
        params: &mut dyn ParamFactory,
    ) -> Result<PreActivation> {
        let weights: Vec<Matrix> = sources.iter()
            .map(|s| params.forward_weights(s.n_out, opts.n_out, &weight_name(s, opts)))
            .collect();
        PreActivation::assemble(opts, create_bias(opts.n_out), sources, masks, weights)
    }

    /// Sums `bias` and every source contribution using the given weights.
    ///
    /// Fails when sources, masks and weights differ in number, when there are
    /// no sources, or when shapes disagree.
    pub fn assemble(
        opts: &PreActivationOptions,
        bias: Vec<f64>,
        sources: &[SourceLayer],
        masks: &[Option<Mask>],
        weights: Vec<Matrix>,
    ) -> Result<PreActivation> {
        if sources.len() != masks.len() || sources.len() != weights.len() {
            return Err(OutputError::SourceCountMismatch {
                sources: sources.len(),
                weights: weights.len(),
                masks: masks.len(),
            });
        }
        let first = sources.first().ok_or(OutputError::NoSources)?;
        let (time, batch, n_out) = (first.output.time, first.output.batch, opts.n_out);
        if bias.len() != n_out {
            return Err(OutputError::ShapeMismatch { what: "bias", expected: vec![n_out], found: vec![bias.len()] });
        }

        let mut z = Tensor3::zeros(time, batch, n_out);
        for t in 0..time {
            for b in 0..batch {
                z.cell_mut(t, b).copy_from_slice(&bias);
            }
        }

        let mut contributions = Vec::with_capacity(sources.len());
        for ((source, mask), w) in sources.iter().zip(masks).zip(&weights) {
            if source.output.time != time || source.output.batch != batch {
                return Err(OutputError::ShapeMismatch {
                    what: "source time/batch",
                    expected: vec![time, batch],
                    found: vec![source.output.time, source.output.batch],
                });
            }
            if w.rows != source.n_out || w.cols != n_out {
                return Err(OutputError::ShapeMismatch {
                    what: "source weights",
                    expected: vec![source.n_out, n_out],
                    found: vec![w.rows, w.cols],
                });
            }
            let contribution = if source.sparse {
                Contribution::Gather
            } else {
                if source.output.classes != source.n_out {
                    return Err(OutputError::ShapeMismatch {
                        what: "dense source width",
                        expected: vec![source.n_out],
                        found: vec![source.output.classes],
                    });
                }
                match mask {
                    None => Contribution::Project,
                    Some(m) if m.shape() == [time, batch] => Contribution::GatedProject(m.clone()),
                    Some(m) => {
                        return Err(OutputError::ShapeMismatch {
                            what: "source mask",
                            expected: vec![time, batch],
                            found: m.shape().to_vec(),
                        })
                    }
                }
            };
            let rows = contribution_rows(&contribution, source, w, opts.mass)?;
            for (k, row) in rows.data.iter().enumerate() {
                let (t, b) = (k / batch, k % batch);
                for (acc, v) in z.cell_mut(t, b).iter_mut().zip(row) {
                    *acc += v;
                }
            }
            contributions.push(contribution);
        }

        Ok(PreActivation {
            z,
            bias,
            weights,
            weight_names: sources.iter().map(|s| weight_name(s, opts)).collect(),
            inputs: sources.iter().map(|s| s.output.clone()).collect(),
            contributions,
            copied: false,
            mass: opts.mass,
            filters: filters(opts),
        }
        .log_built())
    }

    /// Takes `z` verbatim from another layer's output; no weights are created.
    pub fn copy(opts: &PreActivationOptions, input: &SourceLayer) -> PreActivation {
        PreActivation {
            z: input.output.clone(),
            bias: Vec::new(),
            weights: Vec::new(),
            weight_names: Vec::new(),
            inputs: Vec::new(),
            contributions: Vec::new(),
            copied: true,
            mass: opts.mass,
            filters: filters(opts),
        }
        .log_built()
    }

    fn log_built(self) -> PreActivation {
        log::debug!(
            "pre-activation {:?}: {} source(s), copied={}, filters={:?}",
            self.z.shape(),
            self.contributions.len(),
            self.copied,
            self.filters
        );
        self
    }

    /// Pushes a gradient at `z` back through the gradient filters and the
    /// weighted sum.
    pub fn backward(&self, d_z: &Tensor3) -> Result<ParamGrads> {
        d_z.expect_shape(self.z.shape(), "gradient at z")?;
        let mut grad = d_z.clone();
        for filter in self.filters.iter().rev() {
            grad = filter.backward(&self.z, &grad);
        }

        if self.copied {
            return Ok(ParamGrads { bias: Vec::new(), weights: Vec::new(), copy_input: Some(grad) });
        }

        let flat = grad.to_matrix();
        let mut bias = vec![0.0; self.bias.len()];
        for row in &flat.data {
            for (acc, g) in bias.iter_mut().zip(row) {
                *acc += g;
            }
        }

        let mut weights = Vec::with_capacity(self.weights.len());
        for ((input, contribution), w) in self.inputs.iter().zip(&self.contributions).zip(&self.weights) {
            let d_w = match contribution {
                Contribution::Gather => {
                    let mut table = Matrix::zeros(w.rows, w.cols);
                    for (k, row) in flat.data.iter().enumerate() {
                        let id = sparse_id(input.data[k * input.classes], w.rows)?;
                        for (acc, g) in table.data[id].iter_mut().zip(row) {
                            *acc += g;
                        }
                    }
                    table
                }
                Contribution::Project => input.to_matrix().transpose().dot(&flat),
                Contribution::GatedProject(mask) => {
                    gated(&input.to_matrix(), mask, self.mass).transpose().dot(&flat)
                }
            };
            weights.push(d_w);
        }

        Ok(ParamGrads { bias, weights, copy_input: None })
    }
}

fn weight_name(source: &SourceLayer, opts: &PreActivationOptions) -> String {
    format!("W_in_{}_{}", source.name, opts.layer_name)
}

fn filters(opts: &PreActivationOptions) -> Vec<GradFilter> {
    let mut filters = Vec::new();
    if let Some(bound) = opts.grad_clip_z {
        filters.push(GradFilter::Clip(bound.abs()));
    }
    if let Some(bound) = opts.grad_discard_out_of_bound_z {
        filters.push(GradFilter::DiscardOutOfBound(bound.abs()));
    }
    filters
}

/// Contribution of one source as flat (time×batch, n_out) rows.
fn contribution_rows(c: &Contribution, source: &SourceLayer, w: &Matrix, mass: f64) -> Result<Matrix> {
    let x = &source.output;
    match c {
        Contribution::Gather => {
            let mut rows = Vec::with_capacity(x.positions());
            for k in 0..x.positions() {
                // older sparse layouts keep extra trailing features; the id is the first one
                let id = sparse_id(x.data[k * x.classes], w.rows)?;
                rows.push(w.data[id].clone());
            }
            Ok(Matrix { rows: x.positions(), cols: w.cols, data: rows })
        }
        Contribution::Project => Ok(x.to_matrix().dot(w)),
        Contribution::GatedProject(mask) => Ok(gated(&x.to_matrix(), mask, mass).dot(w)),
    }
}

fn gated(x: &Matrix, mask: &Mask, mass: f64) -> Matrix {
    let mut out = x.clone();
    for (row, &m) in out.data.iter_mut().zip(mask.data.iter()) {
        for v in row.iter_mut() {
            *v *= mass * m;
        }
    }
    out
}

fn sparse_id(value: f64, vocab: usize) -> Result<usize> {
    let id = value as i64;
    if id < 0 || id as usize >= vocab {
        return Err(OutputError::LabelOutOfRange { label: id, classes: vocab });
    }
    Ok(id as usize)
}
