pub mod autograd;
pub mod data;
pub mod errors;
pub mod loss;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
pub mod types;
pub mod util;

pub use autograd::Variable;
pub use errors::{MzError, MzResult};
pub use tensor::Tensor;
