use thiserror::Error;

use crate::dtype::Dtype;

/// Errors raised by the public tensor/graph API.
///
/// Construction-time errors (shape factories, op builders) are returned
/// synchronously and prevent node creation. Compile-time errors abort
/// [`crate::graph::Graph::compile`]; runtime errors abort
/// [`crate::graph::Graph::forward`]/`backward`.
#[derive(Error, Debug)]
pub enum GPError {
    #[error("shape error in {op}: {message} (shapes: {shapes:?})")]
    Shape {
        op: &'static str,
        message: String,
        shapes: Vec<Vec<usize>>,
    },

    #[error("dtype error in {op}: {dtype:?} is not supported ({message})")]
    DType {
        op: &'static str,
        dtype: Dtype,
        message: String,
    },

    #[error("no kernel registered for op `{op}` with dtype {dtype:?} and no fused alternative")]
    UnsupportedOp { op: &'static str, dtype: Dtype },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backward() called on a non-scalar root (numel = {numel}); reduce to a scalar first")]
    Gradient { numel: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type GPResult<T> = Result<T, GPError>;

impl GPError {
    pub fn shape(op: &'static str, message: impl Into<String>, shapes: Vec<Vec<usize>>) -> Self {
        GPError::Shape {
            op,
            message: message.into(),
            shapes,
        }
    }

    pub fn dtype(op: &'static str, dtype: Dtype, message: impl Into<String>) -> Self {
        GPError::DType {
            op,
            dtype,
            message: message.into(),
        }
    }
}
