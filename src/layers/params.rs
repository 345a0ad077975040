use rand::rngs::ThreadRng;
use rand::Rng;

use crate::math::matrix::Matrix;

/// Creates the trainable weights of a layer.
pub trait ParamFactory {
    /// A fresh (n_in, n_out) weight matrix named `name`.
    fn forward_weights(&mut self, n_in: usize, n_out: usize, name: &str) -> Matrix;
}

/// Xavier-initialized weights drawn from `R`.
pub struct XavierInit<R: Rng = ThreadRng> {
    rng: R,
}

impl XavierInit<ThreadRng> {
    pub fn new() -> Self {
        XavierInit { rng: rand::thread_rng() }
    }
}

impl Default for XavierInit<ThreadRng> {
    fn default() -> Self {
        XavierInit::new()
    }
}

impl<R: Rng> XavierInit<R> {
    pub fn with_rng(rng: R) -> Self {
        XavierInit { rng }
    }
}

impl<R: Rng> ParamFactory for XavierInit<R> {
    fn forward_weights(&mut self, n_in: usize, n_out: usize, name: &str) -> Matrix {
        log::debug!("creating {name} ({n_in}x{n_out})");
        Matrix::xavier_with(n_in, n_out, &mut self.rng)
    }
}

/// Output bias initialized to `log(1/n)` for every class, so the initial
/// softmax is uniform whatever the scale. Empty for zero classes.
pub fn create_bias(n: usize) -> Vec<f64> {
    vec![(1.0 / n as f64).ln(); n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn bias_gives_uniform_softmax() {
        let b = create_bias(4);
        let p = crate::activation::softmax(&b);
        assert!(p.iter().all(|x| (x - 0.25).abs() < 1e-12));
        assert!((b[0] - 0.25f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn seeded_factory_is_reproducible() {
        let a = XavierInit::with_rng(StdRng::seed_from_u64(3)).forward_weights(3, 2, "W");
        let b = XavierInit::with_rng(StdRng::seed_from_u64(3)).forward_weights(3, 2, "W");
        assert_eq!(a, b);
    }
}
