pub mod activation;

pub use activation::{log_softmax, log_sum_exp, softmax, ActivationFunction};
