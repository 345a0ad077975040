use crate::error::Result;
use crate::math::matrix::Matrix;
use crate::math::tensor::Tensor3;

/// An upstream layer feeding the output layer.
///
/// Dense sources carry a (time, batch, n_out) activation. Sparse sources carry
/// class ids in a (time, batch, 1) tensor and `n_out` is their vocabulary size;
/// their contribution is an embedding lookup instead of a projection.
#[derive(Debug, Clone)]
pub struct SourceLayer {
    pub name: String,
    pub output: Tensor3,
    /// Declared feature width (vocabulary size for sparse sources).
    pub n_out: usize,
    pub sparse: bool,
    /// Per-sequence lengths announced by the source, if it knows them.
    pub output_sizes: Option<Vec<usize>>,
    /// Projection onto the output classes used by decoder ensembles (`W_lm_in`).
    pub lm_projection: Option<Matrix>,
}

impl SourceLayer {
    pub fn dense(name: impl Into<String>, output: Tensor3) -> SourceLayer {
        SourceLayer {
            name: name.into(),
            n_out: output.classes,
            output,
            sparse: false,
            output_sizes: None,
            lm_projection: None,
        }
    }

    /// A source emitting class ids out of `vocab` entries. `ids` is (time, batch, 1).
    pub fn sparse(name: impl Into<String>, ids: Tensor3, vocab: usize) -> SourceLayer {
        SourceLayer {
            name: name.into(),
            output: ids,
            n_out: vocab,
            sparse: true,
            output_sizes: None,
            lm_projection: None,
        }
    }

    pub fn with_output_sizes(mut self, sizes: Vec<usize>) -> SourceLayer {
        self.output_sizes = Some(sizes);
        self
    }

    pub fn with_lm_projection(mut self, w: Matrix) -> SourceLayer {
        self.lm_projection = Some(w);
        self
    }
}

/// Collapses `depth` parallel copies of the output, stacked along the class
/// axis, into one.
pub trait Consensus {
    fn collapse(&self, z: &Tensor3, depth: usize) -> Result<Tensor3>;
}
