//! Post-training int8 quantization of ncnn inference graphs.
//!
//! A float model (param text + bin weights) and a calibration table go in; the same model
//! with int8 weights, int32 biases and fixed-point scale blocks comes out. See
//! [`pipeline::quantize_model`] for the whole flow.
pub mod calibration;
pub mod error;
pub mod graph;
pub mod layers;
pub mod overrides;
pub mod pipeline;
pub mod propagation;
pub mod quantization;
pub mod serializer;
pub mod tensor;
#[cfg(test)]
mod testing;

pub use calibration::CalibrationTable;
pub use error::QuantizeError;
pub use graph::{Graph, OpKind};
pub use layers::{Layer, Options};
pub use overrides::OverrideTable;
pub use pipeline::{quantize_model, QuantizeOptions, QuantizeReport};
pub use propagation::ScalePlan;
pub use serializer::{SaveOptions, StorageType};
pub use tensor::{ElemType, Tensor};
