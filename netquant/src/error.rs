//! Failures that abort a quantization run.
use std::path::PathBuf;

use thiserror::Error;

use crate::{layers::LayerError, tensor::TensorError};

#[derive(Debug, Error)]
pub enum QuantizeError {
    #[error("failed to allocate a tensor of {elements} elements")]
    AllocationFailure { elements: usize },

    #[error("no calibration entry {key:?} for operator {op:?}")]
    MissingCalibrationEntry { op: String, key: String },

    #[error("condition not handled at operator {op:?}: {reason}")]
    UnhandledTopology { op: String, reason: String },

    #[error("malformed calibration table {path}: {reason}")]
    MalformedCalibrationFile { path: PathBuf, reason: String },

    #[error("operator {op:?}: {source}")]
    Layer {
        op: String,
        #[source]
        source: LayerError,
    },

    #[error(transparent)]
    Tensor(TensorError),
}

impl From<TensorError> for QuantizeError {
    fn from(e: TensorError) -> Self {
        match e {
            TensorError::Allocation { elements } => QuantizeError::AllocationFailure { elements },
            other => QuantizeError::Tensor(other),
        }
    }
}

impl QuantizeError {
    pub fn unhandled(op: &str, reason: impl Into<String>) -> Self {
        QuantizeError::UnhandledTopology {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    pub fn missing(op: &str, key: impl Into<String>) -> Self {
        QuantizeError::MissingCalibrationEntry {
            op: op.to_string(),
            key: key.into(),
        }
    }

    pub fn layer(op: &str, source: LayerError) -> Self {
        match source {
            LayerError::Allocation { elements } => QuantizeError::AllocationFailure { elements },
            source => QuantizeError::Layer {
                op: op.to_string(),
                source,
            },
        }
    }

    /// Process exit status of the command line tool for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            QuantizeError::AllocationFailure { .. } => -100,
            _ => -1,
        }
    }
}

/// Exit status for an arbitrary error chain: the first [`QuantizeError`] decides.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<QuantizeError>())
        .map(QuantizeError::exit_code)
        .unwrap_or(-1)
}
