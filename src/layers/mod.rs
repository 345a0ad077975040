pub mod source;
pub mod params;
pub mod grad_filter;
pub mod preactivation;

pub use source::{Consensus, SourceLayer};
pub use params::{create_bias, ParamFactory, XavierInit};
pub use grad_filter::GradFilter;
pub use preactivation::{ParamGrads, PreActivation, PreActivationOptions};
