pub mod logging;
pub mod rng;
