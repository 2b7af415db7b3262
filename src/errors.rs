use thiserror::Error;

#[derive(Error, Debug)]
pub enum MzError {
    #[error("shape mismatch in {op}: lhs {lhs:?}, rhs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange {
        index: usize,
        axis: usize,
        size: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backward called on a variable with no creator and no seed gradient")]
    UninitializedGrad,
    #[error("backward may run once per graph; this graph was already consumed")]
    GraphConsumed,
    #[error("kv cache overflow: length {len} + {append} new positions exceeds capacity {capacity}")]
    CacheOverflow {
        len: usize,
        append: usize,
        capacity: usize,
    },
    #[error("config validation failed: {0}")]
    ConfigValidation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type MzResult<T> = Result<T, MzError>;

impl MzError {
    /// Shorthand used by the kernel when two operand shapes cannot combine.
    pub(crate) fn shapes(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        MzError::ShapeMismatch {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }
}
