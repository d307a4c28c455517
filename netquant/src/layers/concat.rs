//! Join several tensors along one axis.
use itertools::Itertools;
use rayon::prelude::*;

use super::{LayerError, LayerResult, Options};
use crate::{
    graph::{keys, ParamDict},
    overrides::OutputRescale,
    quantization::float2int8,
    tensor::{ElemType, Element, Tensor},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Concat {
    pub axis: usize,
    pub use_int8_inference: bool,
    /// Explicitly configured rescale of the int8 output.
    pub rescale: Option<OutputRescale>,
}

impl Concat {
    pub fn new(axis: usize) -> Self {
        Self {
            axis,
            use_int8_inference: false,
            rescale: None,
        }
    }

    pub fn load_param(pd: &ParamDict) -> LayerResult<Self> {
        let axis = pd.get_int(0, 0);
        let axis = usize::try_from(axis)
            .map_err(|_| LayerError::ParameterError(format!("negative Concat axis {axis}")))?;
        Ok(Self {
            axis,
            use_int8_inference: pd.get_int(keys::INT8, 0) != 0,
            rescale: None,
        })
    }

    pub fn forward(&self, bottoms: &[Tensor], opt: &Options) -> LayerResult<Tensor> {
        let first = bottoms
            .first()
            .ok_or_else(|| LayerError::ShapeError("Concat without inputs".to_string()))?;
        let top = match first.elem_type() {
            Some(ElemType::F32) => concat::<f32>(self.axis, bottoms, opt)?,
            Some(ElemType::I8) => concat::<i8>(self.axis, bottoms, opt)?,
            Some(ElemType::I32) => concat::<i32>(self.axis, bottoms, opt)?,
            None => return Err(LayerError::Allocation { elements: 0 }),
        };
        match self.rescale {
            Some(rescale) if self.use_int8_inference && top.elem_type() == Some(ElemType::I8) => {
                apply_rescale(&top, rescale, opt)
            }
            _ => Ok(top),
        }
    }
}

fn apply_rescale(top: &Tensor, rescale: OutputRescale, opt: &Options) -> LayerResult<Tensor> {
    let src = top.data::<i8>()?;
    match rescale {
        OutputRescale::Dequantize(divisor) => {
            let mut out = Tensor::create_like(top, ElemType::F32)?;
            let dst = out.data_mut::<f32>()?;
            opt.run(|| {
                dst.par_iter_mut()
                    .zip(src.par_iter())
                    .for_each(|(d, s)| *d = *s as f32 / divisor)
            });
            Ok(out)
        }
        OutputRescale::Requantize(ratio) => {
            let mut out = Tensor::create_like(top, ElemType::I8)?;
            let dst = out.data_mut::<i8>()?;
            opt.run(|| {
                dst.par_iter_mut()
                    .zip(src.par_iter())
                    .for_each(|(d, s)| *d = float2int8(*s as f32 * ratio))
            });
            Ok(out)
        }
    }
}

fn shape_error(msg: String) -> LayerError {
    LayerError::ShapeError(msg)
}

fn concat<T: Element>(axis: usize, bottoms: &[Tensor], opt: &Options) -> LayerResult<Tensor> {
    let first = &bottoms[0];
    let dims = first.dims();
    if axis >= dims {
        return Err(LayerError::ParameterError(format!(
            "Concat axis {axis} out of range for {dims}-d inputs"
        )));
    }
    for b in bottoms {
        if b.dims() != dims || b.elem_type() != Some(T::TYPE) {
            return Err(shape_error("Concat inputs differ in rank or type".to_string()));
        }
    }
    let srcs = bottoms
        .iter()
        .map(|b| b.data::<T>())
        .collect::<Result<Vec<_>, _>>()?;
    let same = |f: fn(&Tensor) -> usize, what: &str| {
        if bottoms.iter().map(f).all_equal() {
            Ok(())
        } else {
            Err(shape_error(format!("Concat inputs differ in {what}")))
        }
    };
    let sum = |f: fn(&Tensor) -> usize| bottoms.iter().map(f).sum::<usize>();

    match (dims, axis) {
        (1, 0) => {
            let mut top = Tensor::create_1d(sum(Tensor::w), T::TYPE)?;
            let dst = top.data_mut::<T>()?;
            let mut offset = 0;
            for (b, src) in bottoms.iter().zip(&srcs) {
                dst[offset..offset + b.w()].copy_from_slice(&src[..b.w()]);
                offset += b.w();
            }
            Ok(top)
        }
        (2, 0) => {
            same(Tensor::w, "width")?;
            let mut top = Tensor::create_2d(first.w(), sum(Tensor::h), T::TYPE)?;
            let dst = top.data_mut::<T>()?;
            let mut offset = 0;
            for (b, src) in bottoms.iter().zip(&srcs) {
                let size = b.w() * b.h();
                dst[offset..offset + size].copy_from_slice(&src[..size]);
                offset += size;
            }
            Ok(top)
        }
        (2, 1) => {
            same(Tensor::h, "height")?;
            let out_w = sum(Tensor::w);
            let mut top = Tensor::create_2d(out_w, first.h(), T::TYPE)?;
            let dst = top.data_mut::<T>()?;
            opt.run(|| {
                dst.par_chunks_mut(out_w).enumerate().for_each(|(y, row)| {
                    let mut offset = 0;
                    for (b, src) in bottoms.iter().zip(&srcs) {
                        let w = b.w();
                        row[offset..offset + w].copy_from_slice(&src[y * w..(y + 1) * w]);
                        offset += w;
                    }
                })
            });
            Ok(top)
        }
        (3, 0) => {
            same(Tensor::w, "width")?;
            same(Tensor::h, "height")?;
            let mut top = Tensor::create_3d(first.w(), first.h(), sum(Tensor::c), T::TYPE)?;
            let plane = first.w() * first.h();
            let out_cstep = top.cstep();
            let dst = top.data_mut::<T>()?;
            let mut q = 0;
            for (b, src) in bottoms.iter().zip(&srcs) {
                for p in 0..b.c() {
                    let out = &mut dst[(q + p) * out_cstep..][..plane];
                    out.copy_from_slice(&src[p * b.cstep()..][..plane]);
                }
                q += b.c();
            }
            Ok(top)
        }
        (3, 1) => {
            same(Tensor::w, "width")?;
            same(Tensor::c, "channels")?;
            let w = first.w();
            let mut top = Tensor::create_3d(w, sum(Tensor::h), first.c(), T::TYPE)?;
            let out_cstep = top.cstep();
            let dst = top.data_mut::<T>()?;
            opt.run(|| {
                dst.par_chunks_mut(out_cstep).enumerate().for_each(|(q, ch)| {
                    let mut offset = 0;
                    for (b, src) in bottoms.iter().zip(&srcs) {
                        let size = w * b.h();
                        ch[offset..offset + size].copy_from_slice(&src[q * b.cstep()..][..size]);
                        offset += size;
                    }
                })
            });
            Ok(top)
        }
        (3, 2) => {
            same(Tensor::h, "height")?;
            same(Tensor::c, "channels")?;
            let (out_w, h) = (sum(Tensor::w), first.h());
            let mut top = Tensor::create_3d(out_w, h, first.c(), T::TYPE)?;
            let out_cstep = top.cstep();
            let dst = top.data_mut::<T>()?;
            opt.run(|| {
                dst.par_chunks_mut(out_cstep).enumerate().for_each(|(q, ch)| {
                    for y in 0..h {
                        let row = &mut ch[y * out_w..(y + 1) * out_w];
                        let mut offset = 0;
                        for (b, src) in bottoms.iter().zip(&srcs) {
                            let w = b.w();
                            let start = q * b.cstep() + y * w;
                            row[offset..offset + w].copy_from_slice(&src[start..start + w]);
                            offset += w;
                        }
                    }
                })
            });
            Ok(top)
        }
        _ => Err(LayerError::ParameterError(format!(
            "unsupported Concat of {dims}-d inputs along axis {axis}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn appends_vectors() {
        let a = Tensor::from_vec_1d(vec![1i8, 2]).unwrap();
        let b = Tensor::from_vec_1d(vec![3i8]).unwrap();
        let out = Concat::new(0).forward(&[a, b], &Options::default()).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn interleaves_rows_of_matrices() {
        let a = Tensor::from_packed(2, 1, 2, 1, &[1.0f32, 2.0]).unwrap();
        let b = Tensor::from_packed(2, 2, 2, 1, &[3.0f32, 4.0, 5.0, 6.0]).unwrap();
        let out = Concat::new(1).forward(&[a, b], &Options::default()).unwrap();
        assert_eq!((out.w(), out.h()), (3, 2));
        assert_eq!(out.to_packed::<f32>().unwrap(), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let a = Tensor::from_packed(2, 2, 1, 1, &[1.0f32, 2.0]).unwrap();
        let b = Tensor::from_packed(2, 3, 1, 1, &[1.0f32, 2.0, 3.0]).unwrap();
        assert!(Concat::new(0).forward(&[a.clone(), b], &Options::default()).is_err());
        assert!(Concat::new(2).forward(&[a], &Options::default()).is_err());
        let c = Tensor::from_vec_1d(vec![1i8]).unwrap();
        let d = Tensor::from_vec_1d(vec![1.0f32]).unwrap();
        assert!(Concat::new(0).forward(&[c, d], &Options::default()).is_err());
    }

    #[test]
    fn configured_rescales_only_apply_in_int8_mode() {
        let a = Tensor::from_vec_1d(vec![14i8, -70]).unwrap();
        let mut concat = Concat::new(0);
        concat.rescale = Some(OutputRescale::Dequantize(7.0));
        let out = concat.forward(&[a.clone()], &Options::default()).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), &[14, -70]);

        concat.use_int8_inference = true;
        let out = concat.forward(&[a.clone()], &Options::default()).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[2.0, -10.0]);

        concat.rescale = Some(OutputRescale::Requantize(2.0));
        let out = concat.forward(&[a], &Options::default()).unwrap();
        assert_eq!(out.data::<i8>().unwrap(), &[28, -127]);
    }
}
