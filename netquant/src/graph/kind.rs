//! The closed set of operator types and the per-type facts every pass needs.
use anyhow::ensure;
use serde::Serialize;

use super::param::ParamDict;

macro_rules! op_kinds {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum OpKind {
            $($variant),*
        }

        impl OpKind {
            /// Resolve a type name as it appears in a param file.
            pub fn from_type_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(OpKind::$variant),)*
                    _ => None,
                }
            }

            pub fn type_name(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name),*
                }
            }
        }
    };
}

op_kinds! {
    AbsVal => "AbsVal",
    BatchNorm => "BatchNorm",
    Bias => "Bias",
    BinaryOp => "BinaryOp",
    Clip => "Clip",
    Concat => "Concat",
    Convolution => "Convolution",
    ConvolutionDepthWise => "ConvolutionDepthWise",
    Crop => "Crop",
    Deconvolution => "Deconvolution",
    DeconvolutionDepthWise => "DeconvolutionDepthWise",
    Dequantize => "Dequantize",
    DetectionOutput => "DetectionOutput",
    Dropout => "Dropout",
    Eltwise => "Eltwise",
    Elu => "ELU",
    Exp => "Exp",
    Flatten => "Flatten",
    InnerProduct => "InnerProduct",
    Input => "Input",
    InstanceNorm => "InstanceNorm",
    Interp => "Interp",
    Log => "Log",
    Lrn => "LRN",
    MemoryData => "MemoryData",
    Mvn => "MVN",
    Normalize => "Normalize",
    Padding => "Padding",
    Permute => "Permute",
    PixelShuffle => "PixelShuffle",
    Pooling => "Pooling",
    Power => "Power",
    PRelu => "PReLU",
    PriorBox => "PriorBox",
    Proposal => "Proposal",
    PsRoiPooling => "PSROIPooling",
    Quantize => "Quantize",
    Reduction => "Reduction",
    Relu => "ReLU",
    Reorg => "Reorg",
    Requantize => "Requantize",
    Reshape => "Reshape",
    RoiAlign => "ROIAlign",
    RoiPooling => "ROIPooling",
    Scale => "Scale",
    ShuffleChannel => "ShuffleChannel",
    Sigmoid => "Sigmoid",
    Slice => "Slice",
    Softmax => "Softmax",
    Split => "Split",
    TanH => "TanH",
    Threshold => "Threshold",
    UnaryOp => "UnaryOp",
    YoloDetectionOutput => "YoloDetectionOutput",
    Yolov3DetectionOutput => "Yolov3DetectionOutput",
    Fused => "ncnnfused",
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

impl OpKind {
    /// Convolutions whose input activation scale is calibrated.
    pub fn is_convolution(self) -> bool {
        matches!(self, OpKind::Convolution | OpKind::ConvolutionDepthWise)
    }

    /// Operators whose weights and bias get quantized.
    pub fn has_quantizable_weights(self) -> bool {
        matches!(
            self,
            OpKind::Convolution | OpKind::ConvolutionDepthWise | OpKind::InnerProduct
        )
    }

    /// Operators with an int8 execution path that only needs the `8=1` marker.
    pub fn int8_capable(self) -> bool {
        matches!(
            self,
            OpKind::BinaryOp
                | OpKind::Clip
                | OpKind::Concat
                | OpKind::Flatten
                | OpKind::Input
                | OpKind::Padding
                | OpKind::Permute
                | OpKind::Pooling
                | OpKind::Relu
                | OpKind::Reshape
                | OpKind::Slice
                | OpKind::Split
        )
    }
}

/// Parameter ids shared by several passes.
pub mod keys {
    pub const NUM_OUTPUT: u32 = 0;
    pub const CONV_BIAS_TERM: u32 = 5;
    pub const CONV_WEIGHT_DATA_SIZE: u32 = 6;
    pub const CONV_GROUP: u32 = 7;
    pub const INNER_PRODUCT_BIAS_TERM: u32 = 1;
    pub const INNER_PRODUCT_WEIGHT_DATA_SIZE: u32 = 2;
    /// `int8_scale_term` on weighted ops, `use_int8_inference` on the others.
    pub const INT8: u32 = 8;
    /// `use_factor` on Slice and Split, the scale array on Clip.
    pub const FACTOR: u32 = 9;
    pub const OUTPUT_SCALE_COUNT: u32 = 18;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Tag-prefixed payload (float32, fp16 or int8 depending on the tag).
    Tagged,
    RawF32,
    RawI32,
}

/// One weight blob an operator reads from the weight stream, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightSpec {
    pub len: usize,
    pub storage: Storage,
}

impl WeightSpec {
    fn tagged(len: usize) -> Self {
        Self {
            len,
            storage: Storage::Tagged,
        }
    }

    fn f32(len: usize) -> Self {
        Self {
            len,
            storage: Storage::RawF32,
        }
    }

    fn i32(len: usize) -> Self {
        Self {
            len,
            storage: Storage::RawI32,
        }
    }
}

/// Number of per-channel scales of a weighted operator.
pub fn output_channels(kind: OpKind, params: &ParamDict) -> anyhow::Result<usize> {
    Ok(match kind {
        OpKind::ConvolutionDepthWise => params.get_usize(keys::CONV_GROUP, 1)?,
        _ => params.get_usize(keys::NUM_OUTPUT, 0)?,
    })
}

/// Weight blobs stored for an operator, derived from its parameters.
pub fn weight_layout(kind: OpKind, params: &ParamDict) -> anyhow::Result<Vec<WeightSpec>> {
    let mut specs = Vec::new();
    match kind {
        OpKind::Convolution
        | OpKind::ConvolutionDepthWise
        | OpKind::Deconvolution
        | OpKind::DeconvolutionDepthWise
        | OpKind::InnerProduct => {
            let (size_key, bias_key) = if kind == OpKind::InnerProduct {
                (keys::INNER_PRODUCT_WEIGHT_DATA_SIZE, keys::INNER_PRODUCT_BIAS_TERM)
            } else {
                (keys::CONV_WEIGHT_DATA_SIZE, keys::CONV_BIAS_TERM)
            };
            let num_output = params.get_usize(keys::NUM_OUTPUT, 0)?;
            specs.push(WeightSpec::tagged(params.get_usize(size_key, 0)?));
            let term = if kind.has_quantizable_weights() {
                params.get_int(keys::INT8, 0)
            } else {
                0
            };
            let int8 = term != 0;
            if params.get_int(bias_key, 0) != 0 {
                // quantized biases are stored as int32
                specs.push(if term == 2 {
                    WeightSpec::i32(num_output)
                } else {
                    WeightSpec::f32(num_output)
                });
            }
            let outputs = params.get_usize(keys::OUTPUT_SCALE_COUNT, 0)?;
            if int8 && outputs > 0 {
                specs.push(WeightSpec::i32(output_channels(kind, params)? + 1));
                specs.push(WeightSpec::i32(outputs));
            }
        }
        OpKind::Input => {
            let outputs = params.get_usize(keys::OUTPUT_SCALE_COUNT, 0)?;
            if outputs > 0 {
                specs.push(WeightSpec::i32(outputs));
            }
        }
        OpKind::Split if params.get_int(keys::FACTOR, 0) != 0 => specs.push(WeightSpec::i32(3)),
        OpKind::Slice if params.get_int(keys::FACTOR, 0) != 0 => specs.push(WeightSpec::i32(2)),
        OpKind::BatchNorm => {
            let channels = params.get_usize(0, 0)?;
            // slope, mean, variance, bias
            specs.extend(std::iter::repeat(WeightSpec::f32(channels)).take(4));
        }
        OpKind::Bias => specs.push(WeightSpec::f32(params.get_usize(0, 0)?)),
        OpKind::Scale => {
            let size = params.get_int(0, 0);
            // -233 takes the scale from a second input blob
            if size != -233 {
                let size = params.get_usize(0, 0)?;
                specs.push(WeightSpec::f32(size));
                if params.get_int(1, 0) != 0 {
                    specs.push(WeightSpec::f32(size));
                }
            }
        }
        OpKind::PRelu => specs.push(WeightSpec::f32(params.get_usize(0, 0)?)),
        OpKind::Normalize => specs.push(WeightSpec::f32(params.get_usize(3, 0)?)),
        OpKind::InstanceNorm => {
            let channels = params.get_usize(0, 0)?;
            specs.push(WeightSpec::f32(channels));
            specs.push(WeightSpec::f32(channels));
        }
        OpKind::Requantize if params.get_int(2, 0) != 0 => {
            specs.push(WeightSpec::f32(params.get_usize(3, 0)?))
        }
        OpKind::MemoryData => {
            let (w, h, c) = (
                params.get_usize(0, 0)?,
                params.get_usize(1, 0)?,
                params.get_usize(2, 0)?,
            );
            let len = w * h.max(1) * c.max(1);
            ensure!(w > 0, "MemoryData without width");
            specs.push(WeightSpec::f32(len));
        }
        _ => {}
    }
    Ok(specs)
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(entries: &[&str]) -> ParamDict {
        let mut pd = ParamDict::new();
        for e in entries {
            pd.parse_entry(e).unwrap();
        }
        pd
    }

    #[test]
    fn type_names_round_trip() {
        for name in ["Convolution", "PReLU", "ncnnfused", "ELU", "Yolov3DetectionOutput"] {
            assert_eq!(OpKind::from_type_name(name).unwrap().type_name(), name);
        }
        assert_eq!(OpKind::from_type_name("Swish"), None);
    }

    #[test]
    fn float_convolution_layout() {
        let pd = params(&["0=8", "5=1", "6=72"]);
        let specs = weight_layout(OpKind::Convolution, &pd).unwrap();
        assert_eq!(specs, vec![WeightSpec::tagged(72), WeightSpec::f32(8)]);
    }

    #[test]
    fn quantized_convolution_layout_reads_scale_blocks() {
        let pd = params(&["0=8", "5=1", "6=72", "7=4", "8=2", "18=3"]);
        let specs = weight_layout(OpKind::ConvolutionDepthWise, &pd).unwrap();
        assert_eq!(
            specs,
            vec![
                WeightSpec::tagged(72),
                WeightSpec::i32(8),
                WeightSpec::i32(5),
                WeightSpec::i32(3)
            ]
        );
    }

    #[test]
    fn scale_from_second_input_has_no_weights() {
        let pd = params(&["0=-233", "1=1"]);
        assert!(weight_layout(OpKind::Scale, &pd).unwrap().is_empty());
    }
}
