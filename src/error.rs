use crate::tensor::Shape;

/// Every failure the engine can report.
///
/// Configuration problems (mismatched shapes, incompatible weight files, calls
/// out of order) and resource problems (I/O, GPU) are both surfaced here; the
/// engine never retries or recovers internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that must agree do not.
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// `reshape` asked for a different element count.
    #[error("cannot reshape {from} ({from_len} elements) into {to} ({to_len} elements)")]
    ReshapeMismatch {
        from: Shape,
        from_len: usize,
        to: Shape,
        to_len: usize,
    },

    /// A batch tensor whose length is not a whole number of samples.
    #[error("{len} elements is not a multiple of the per-sample size {sample}")]
    BatchMismatch { len: usize, sample: usize },

    /// A layer or tensor was constructed with unusable hyperparameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// forward/backward/update called in an order that would use stale state.
    #[error("{operation} called while the network is {phase}")]
    CallOrder {
        operation: &'static str,
        phase: &'static str,
    },

    /// A tensor's host copy was written and never pushed before device use.
    #[error("{0}: host copy was modified and not pushed to the device")]
    Unsynced(&'static str),

    /// Tensors living on different devices were combined in one operation.
    #[error("tensors passed to {0} live on different devices")]
    DeviceMismatch(&'static str),

    /// The weight file does not match the layer stack it is loaded into.
    #[error("weight file mismatch: {0}")]
    WeightFile(String),

    /// A dataset file is malformed.
    #[error("dataset: {0}")]
    Dataset(String),

    /// Adapter/device acquisition or buffer mapping failed.
    #[error("gpu: {0}")]
    Gpu(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::InvalidConfig(format!("array view: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
