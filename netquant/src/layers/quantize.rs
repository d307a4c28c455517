//! Float (or pre-scaled int32) to int8/int32 conversion.
use rayon::prelude::*;

use super::{LayerError, LayerResult, Options};
use crate::{
    graph::ParamDict,
    quantization::{float2int8, int2int8},
    tensor::{ElemType, Element, Tensor},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Quantize {
    pub scale: f32,
    pub position_bottom_scale: i32,
    pub position_scale_in: i32,
}

impl Default for Quantize {
    fn default() -> Self {
        Self {
            scale: 1.0,
            position_bottom_scale: 5,
            position_scale_in: 18,
        }
    }
}

impl Quantize {
    pub fn new(scale: f32) -> Self {
        Self {
            scale,
            ..Default::default()
        }
    }

    pub fn load_param(pd: &ParamDict) -> Self {
        let default = Self::default();
        Self {
            scale: pd.get_float(0, default.scale),
            position_bottom_scale: pd.get_int(1, default.position_bottom_scale),
            position_scale_in: pd.get_int(2, default.position_scale_in),
        }
    }

    /// Quantize a sub-range view into an int8 view of the same length.
    pub fn quantize_range(&self, src: &[f32], dst: &mut [i8]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = float2int8(*s * self.scale);
        }
    }

    /// Quantize a sub-range view into int32 storage (no saturation).
    pub fn quantize_range_i32(&self, src: &[f32], dst: &mut [i32]) {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = (*s * self.scale).round() as i32;
        }
    }

    fn requantize_range(&self, src: &[i32], dst: &mut [i8]) {
        let bottom = self.position_bottom_scale.clamp(0, 31);
        let scale_in = self.position_scale_in.clamp(0, 31);
        for (d, s) in dst.iter_mut().zip(src) {
            let scaled = (*s as f32 * self.scale) as i32;
            *d = int2int8((scaled >> bottom) >> scale_in);
        }
    }

    pub fn forward(&self, bottom: &Tensor, opt: &Options) -> LayerResult<Tensor> {
        match bottom.elem_type() {
            Some(ElemType::I32) if opt.use_int_internal => {
                let mut top = Tensor::create_like(bottom, ElemType::I8)?;
                let src = bottom.data::<i32>()?;
                per_channel(&mut top, bottom.cstep(), opt, |q, dst| {
                    self.requantize_range(&src[q * bottom.cstep()..][..dst.len()], dst)
                })?;
                Ok(top)
            }
            Some(ElemType::F32) => {
                let src = bottom.data::<f32>()?;
                let cstep = bottom.cstep();
                if opt.use_int32_storage {
                    let mut top = Tensor::create_like(bottom, ElemType::I32)?;
                    per_channel(&mut top, cstep, opt, |q, dst| {
                        self.quantize_range_i32(&src[q * cstep..][..dst.len()], dst)
                    })?;
                    Ok(top)
                } else {
                    let mut top = Tensor::create_like(bottom, ElemType::I8)?;
                    per_channel(&mut top, cstep, opt, |q, dst| {
                        self.quantize_range(&src[q * cstep..][..dst.len()], dst)
                    })?;
                    Ok(top)
                }
            }
            Some(other) => Err(LayerError::ParameterError(format!(
                "Quantize cannot consume {other} input"
            ))),
            None => Err(LayerError::Allocation { elements: 0 }),
        }
    }
}

/// Run `f(channel, plane)` over the channels of `top` in parallel.
fn per_channel<T: Element>(
    top: &mut Tensor,
    cstep: usize,
    opt: &Options,
    f: impl Fn(usize, &mut [T]) + Send + Sync,
) -> LayerResult<()> {
    let plane = top.w() * top.h();
    let out_cstep = top.cstep();
    let data = top.data_mut::<T>()?;
    // input and output element types may differ in size, so strides differ for 3-D data
    debug_assert!(cstep >= plane && out_cstep >= plane);
    opt.run(|| {
        data.par_chunks_mut(out_cstep)
            .enumerate()
            .for_each(|(q, ch)| f(q, &mut ch[..plane]))
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0.5)]
    #[case(12.7)]
    #[case(100.0)]
    #[case(150.0)]
    fn dequantized_values_stay_within_one_step(#[case] scale: f32) {
        let values = (0..64).map(|i| (i as f32 - 32.0) * 0.0371).collect::<Vec<_>>();
        let input = Tensor::from_packed(3, 4, 4, 4, &values).unwrap();
        let q = Quantize::new(scale);
        let out = q.forward(&input, &Options::default()).unwrap();
        assert_eq!(out.elem_type(), Some(ElemType::I8));
        let quantized = out.to_packed::<i8>().unwrap();
        for (x, v) in values.iter().zip(quantized) {
            if (x * scale).abs() <= 127.0 {
                assert!((x - v as f32 / scale).abs() <= 1.0 / scale);
            } else {
                assert_eq!(v as f32, 127.0 * x.signum());
            }
        }
    }

    #[test]
    fn int32_storage_does_not_saturate() {
        let input = Tensor::from_vec_1d(vec![10.0f32, -3.26]).unwrap();
        let opt = Options {
            use_int32_storage: true,
            ..Default::default()
        };
        let out = Quantize::new(100.0).forward(&input, &opt).unwrap();
        assert_eq!(out.data::<i32>().unwrap(), &[1000, -326]);
    }

    #[test]
    fn internal_int_path_shifts_before_saturating() {
        let input = Tensor::from_vec_1d(vec![1 << 12, -(1 << 20)]).unwrap();
        let mut pd = ParamDict::new();
        pd.set(0, 1.0f32);
        pd.set(1, 2);
        pd.set(2, 3);
        let q = Quantize::load_param(&pd);
        let opt = Options {
            use_int_internal: true,
            ..Default::default()
        };
        let out = q.forward(&input, &opt).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), &[127, -127]);
        let input = Tensor::from_vec_1d(vec![256i32]).unwrap();
        let out = q.forward(&input, &opt).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), &[8]);
    }

    #[test]
    fn range_views_quantize_independently() {
        let src = [0.1f32, 0.2, 0.3, 0.4];
        let mut dst = [0i8; 4];
        let (a, b) = dst.split_at_mut(2);
        Quantize::new(10.0).quantize_range(&src[..2], a);
        Quantize::new(100.0).quantize_range(&src[2..], b);
        assert_eq!(dst, [1, 2, 30, 40]);
    }

    #[test]
    fn runs_on_a_dedicated_pool() {
        let opt = Options::default().with_threads(2).unwrap();
        assert_eq!(opt.threads(), 2);
        let input = Tensor::from_packed(3, 2, 1, 3, &[0.5f32, 1.0, 1.5, 2.0, 2.5, 3.0]).unwrap();
        let out = Quantize::new(2.0).forward(&input, &opt).unwrap();
        assert_eq!(out.to_packed::<i8>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }
}
