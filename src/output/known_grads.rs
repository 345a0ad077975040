use std::collections::HashMap;

use crate::error::Result;
use crate::math::tensor::{NodeId, Tensor3};

/// Externally supplied gradients, keyed by the node they replace.
///
/// Whoever differentiates the loss must use the stored gradient verbatim for
/// any node present here and differentiate normally everywhere else.
#[derive(Debug, Clone, Default)]
pub struct KnownGrads {
    grads: HashMap<NodeId, Tensor3>,
}

impl KnownGrads {
    pub fn new() -> KnownGrads {
        KnownGrads::default()
    }

    /// Overrides the gradient of `node`. The gradient must match its shape.
    pub fn insert(&mut self, node: &Tensor3, grad: Tensor3) -> Result<()> {
        grad.expect_shape(node.shape(), "override gradient")?;
        self.grads.insert(node.id(), grad);
        Ok(())
    }

    pub fn get(&self, node: &Tensor3) -> Option<&Tensor3> {
        self.grads.get(&node.id())
    }

    pub fn contains(&self, node: &Tensor3) -> bool {
        self.grads.contains_key(&node.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// What a loss strategy hands to the training loop.
#[derive(Debug, Clone)]
pub struct Cost {
    pub value: f64,
    /// Present only for losses whose error signal comes from outside.
    pub known_grads: Option<KnownGrads>,
    /// CTC class posteriors summed over the batch, for prior estimation.
    pub priors: Option<Vec<f64>>,
}

impl Cost {
    pub fn plain(value: f64) -> Cost {
        Cost { value, known_grads: None, priors: None }
    }

    /// The gradient at `node`: the override when one is registered for it,
    /// otherwise whatever `local` computes.
    pub fn grad_for<F>(&self, node: &Tensor3, local: F) -> Result<Tensor3>
    where
        F: FnOnce() -> Result<Tensor3>,
    {
        match self.known_grads.as_ref().and_then(|k| k.get(node)) {
            Some(grad) => Ok(grad.clone()),
            None => local(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_follows_identity_not_value() {
        let z = Tensor3::zeros(1, 1, 2);
        let twin = Tensor3::zeros(1, 1, 2);
        let mut known = KnownGrads::new();
        known.insert(&z, Tensor3::filled(1, 1, 2, 1.0)).unwrap();
        assert!(known.contains(&z));
        assert!(known.contains(&z.clone()));
        assert!(!known.contains(&twin));
    }

    #[test]
    fn override_wins_over_local_gradient() {
        let z = Tensor3::zeros(1, 1, 2);
        let mut known = KnownGrads::new();
        known.insert(&z, Tensor3::filled(1, 1, 2, 3.0)).unwrap();
        let cost = Cost { value: 0.0, known_grads: Some(known), priors: None };
        let g = cost.grad_for(&z, || Ok(Tensor3::zeros(1, 1, 2))).unwrap();
        assert_eq!(g.data, vec![3.0, 3.0]);

        let other = Tensor3::zeros(1, 1, 2);
        let g = cost.grad_for(&other, || Ok(Tensor3::filled(1, 1, 2, 1.0))).unwrap();
        assert_eq!(g.data, vec![1.0, 1.0]);
    }

    #[test]
    fn shape_must_match_the_node() {
        let z = Tensor3::zeros(1, 1, 2);
        assert!(KnownGrads::new().insert(&z, Tensor3::zeros(1, 1, 3)).is_err());
    }
}
