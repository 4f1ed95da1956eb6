//! Error types emitted by opkit operators.

use thiserror::Error;

/// Result alias used by every operator crate.
pub type Result<T> = std::result::Result<T, OpError>;

/// Operator-level error category.
#[derive(Debug, Error)]
pub enum OpError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },

    /// The kernel does not support the requested data type.
    #[error("unsupported dtype: {requested}")]
    UnsupportedDType { requested: String },

    /// A scalar or flag argument is outside its accepted range.
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument { arg: &'static str, reason: String },

    /// The operator cannot run on the device holding its operands.
    #[error("operator '{op}' requires CPU-resident tensors")]
    UnsupportedDevice { op: &'static str },

    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure while reading configs or tensor dumps.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A candle failure propagated to the caller.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),
}

impl OpError {
    pub fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub fn dtype(requested: impl Into<String>) -> Self {
        Self::UnsupportedDType {
            requested: requested.into(),
        }
    }

    pub fn argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}

/// Bridge for custom-op bodies, which must return `candle_core::Result`.
impl From<OpError> for candle_core::Error {
    fn from(err: OpError) -> Self {
        match err {
            OpError::Backend(inner) => inner,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
