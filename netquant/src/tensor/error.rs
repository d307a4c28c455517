//! Error enum for the [`Tensor`](super::Tensor) type and its accessors

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

use super::ElemType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    /// The backing buffer could not be materialized (zero-sized or out of memory).
    Allocation { elements: usize },
    TypeMismatch { expected: ElemType, found: ElemType },
    OutOfRange { offset: usize, len: usize, total: usize },
    ShapeMismatch(String),
}

impl Display for TensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TensorError::Allocation { elements } => {
                write!(f, "failed to allocate a tensor of {elements} elements")
            }
            TensorError::TypeMismatch { expected, found } => {
                write!(f, "expected {expected} elements but tensor holds {found}")
            }
            TensorError::OutOfRange { offset, len, total } => write!(
                f,
                "range {offset}..{} is out of bounds for a buffer of {total} elements",
                offset + len
            ),
            TensorError::ShapeMismatch(s) => write!(f, "shape mismatch: {s}"),
        }
    }
}

impl Error for TensorError {}
