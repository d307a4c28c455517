//! Conversion of convolution and fully-connected weights to int8 and biases to int32.
use std::slice;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    error::QuantizeError,
    graph::{keys, Int8ScaleTerm, Operator, Storage, Weight},
    layers::{LayerError, Options, Quantize},
    tensor::Tensor,
};

/// Quantizes the weights of one operator at a time. Channels of one operator are
/// processed in parallel on the configured pool.
#[derive(Debug, Clone, Default)]
pub struct WeightQuantizer {
    opt: Options,
}

impl WeightQuantizer {
    pub fn new(opt: Options) -> Self {
        Self { opt }
    }

    /// Quantize `op` in place with one scale per output channel.
    ///
    /// `input_scale` is the calibrated activation scale of the operator input. Returns the
    /// resulting `int8_scale_term`, which is also stored in the operator parameters.
    pub fn quantize(
        &self,
        op: &mut Operator,
        channels: usize,
        weight_scales: &[f32],
        input_scale: f32,
    ) -> Result<Int8ScaleTerm, QuantizeError> {
        let name = op.name.clone();
        if weight_scales.len() < channels {
            return Err(QuantizeError::missing(
                &name,
                format!("{name}_param_0 with {channels} channel scales"),
            ));
        }
        if weight_scales.len() > channels {
            warn!(
                op = %name,
                "ignoring {} weight scales beyond {channels} channels",
                weight_scales.len() - channels
            );
        }
        let scales = &weight_scales[..channels];
        let weight = op
            .weights
            .first()
            .ok_or_else(|| shape_error(&name, "operator has no weight data".to_string()))?;
        let quantized = self.quantize_weight(&name, &weight.data, scales)?;
        op.weights[0] = Weight::new(quantized, Storage::Tagged);

        let term = match op.weights.get(1) {
            Some(bias) => {
                let bias = self.quantize_bias(&name, &bias.data, scales, input_scale)?;
                op.weights[1] = Weight::new(bias, Storage::RawI32);
                Int8ScaleTerm::WeightAndBias
            }
            None => Int8ScaleTerm::Weight,
        };
        op.params.set(keys::INT8, term as i32);
        debug!(op = %name, channels, ?term, "quantized weights");
        Ok(term)
    }

    fn quantize_weight(
        &self,
        name: &str,
        weight: &Tensor,
        scales: &[f32],
    ) -> Result<Tensor, QuantizeError> {
        let src = weight.to_packed::<f32>()?;
        let channels = scales.len();
        if channels == 0 || src.len() % channels != 0 {
            return Err(shape_error(
                name,
                format!("{} weights do not split into {channels} channels", src.len()),
            ));
        }
        let per = src.len() / channels;
        let mut dst = vec![0i8; src.len()];
        self.opt.run(|| {
            dst.par_chunks_mut(per)
                .zip(src.par_chunks(per))
                .zip(scales.par_iter())
                .for_each(|((d, s), scale)| Quantize::new(*scale).quantize_range(s, d))
        });
        Ok(Tensor::from_vec_1d(dst)?)
    }

    /// Bias `n` belongs to channel `n * channels / len` and is scaled by
    /// `weight_scale[channel] * input_scale`.
    fn quantize_bias(
        &self,
        name: &str,
        bias: &Tensor,
        scales: &[f32],
        input_scale: f32,
    ) -> Result<Tensor, QuantizeError> {
        let src = bias.to_packed::<f32>()?;
        let len = src.len();
        let channels = scales.len();
        if len < channels {
            return Err(shape_error(
                name,
                format!("{len} biases for {channels} channels"),
            ));
        }
        let mut dst = vec![0i32; len];
        self.opt.run(|| {
            dst.par_iter_mut().enumerate().for_each(|(n, d)| {
                let scale = scales[n * channels / len] * input_scale;
                Quantize::new(scale).quantize_range_i32(slice::from_ref(&src[n]), slice::from_mut(d))
            })
        });
        Ok(Tensor::from_vec_1d(dst)?)
    }
}

fn shape_error(op: &str, msg: String) -> QuantizeError {
    QuantizeError::layer(op, LayerError::ShapeError(msg))
}
