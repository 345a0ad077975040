use crate::math::tensor::Tensor3;

/// A gradient-only transform attached to the pre-activation. The forward value
/// passes through untouched; only the gradient flowing back is rewritten.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradFilter {
    /// Clamp the gradient into `[-bound, bound]`.
    Clip(f64),
    /// Zero the gradient wherever the forward value lies outside `[-bound, bound]`.
    DiscardOutOfBound(f64),
}

impl GradFilter {
    /// Rewrites `grad` given the forward value `z` the filter saw.
    pub fn backward(&self, z: &Tensor3, grad: &Tensor3) -> Tensor3 {
        let mut out = grad.clone();
        match *self {
            GradFilter::Clip(bound) => {
                for g in &mut out.data {
                    *g = g.clamp(-bound, bound);
                }
            }
            GradFilter::DiscardOutOfBound(bound) => {
                for (g, &x) in out.data.iter_mut().zip(z.data.iter()) {
                    if x < -bound || x > bound {
                        *g = 0.0;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_bounds_gradient_only() {
        let z = Tensor3::new(1, 1, 3, vec![10.0, 0.0, -10.0]).unwrap();
        let g = Tensor3::new(1, 1, 3, vec![5.0, -0.5, -5.0]).unwrap();
        assert_eq!(GradFilter::Clip(1.0).backward(&z, &g).data, vec![1.0, -0.5, -1.0]);
    }

    #[test]
    fn discard_zeroes_saturated_positions() {
        let z = Tensor3::new(1, 1, 3, vec![10.0, 0.5, -10.0]).unwrap();
        let g = Tensor3::new(1, 1, 3, vec![5.0, -0.5, -5.0]).unwrap();
        assert_eq!(GradFilter::DiscardOutOfBound(1.0).backward(&z, &g).data, vec![0.0, -0.5, 0.0]);
    }
}
