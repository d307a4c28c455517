//! Partition one tensor into several along one axis, the inverse of [`super::Concat`].
use rayon::prelude::*;

use super::{LayerError, LayerResult, Options};
use crate::{
    graph::{keys, ParamDict, Weight},
    quantization::rescale,
    tensor::{ElemType, Element, Tensor},
};

/// Slice size meaning "an equal share of what is left".
pub const SENTINEL: i32 = -233;

#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    /// Requested size of every output, possibly [`SENTINEL`].
    pub slices: Vec<i32>,
    pub axis: usize,
    pub use_int8_inference: bool,
    pub use_factor: bool,
    /// `(mantissa, exponent)` applied to every output after the first in int8 mode.
    pub factor: Option<(i32, i32)>,
}

impl Slice {
    pub fn new(slices: Vec<i32>, axis: usize) -> Self {
        Self {
            slices,
            axis,
            use_int8_inference: false,
            use_factor: false,
            factor: None,
        }
    }

    pub fn load_param(pd: &ParamDict) -> LayerResult<Self> {
        let axis = pd.get_int(1, 0);
        let axis = usize::try_from(axis)
            .map_err(|_| LayerError::ParameterError(format!("negative Slice axis {axis}")))?;
        let slices = pd.get_ints(0).unwrap_or_default();
        if slices.is_empty() {
            return Err(LayerError::ParameterError(
                "Slice without output sizes".to_string(),
            ));
        }
        Ok(Self {
            slices,
            axis,
            use_int8_inference: pd.get_int(keys::INT8, 0) != 0,
            use_factor: pd.get_int(keys::FACTOR, 0) != 0,
            factor: None,
        })
    }

    pub fn load_model(&mut self, weights: &[Weight]) -> LayerResult<()> {
        if !self.use_factor {
            return Ok(());
        }
        let factor = weights
            .first()
            .ok_or_else(|| LayerError::ParameterError("Slice factor is missing".to_string()))?;
        match factor.data.data::<i32>()? {
            [mantissa, exponent, ..] => {
                self.factor = Some((*mantissa, *exponent));
                Ok(())
            }
            other => Err(LayerError::ParameterError(format!(
                "Slice factor needs 2 values, got {}",
                other.len()
            ))),
        }
    }

    /// Concrete output sizes for an input `extent` along the slicing axis.
    ///
    /// Sentinel entries take `remaining / remaining_outputs`, evaluated left to right, so
    /// an extent of 10 over three sentinels yields 3, 3, 4.
    pub fn resolve_sizes(&self, extent: usize) -> LayerResult<Vec<usize>> {
        let n = self.slices.len();
        let mut sizes = Vec::with_capacity(n);
        let mut used = 0usize;
        for (i, s) in self.slices.iter().enumerate() {
            let size = match *s {
                SENTINEL => (extent - used) / (n - i),
                s if s >= 0 => s as usize,
                s => {
                    return Err(LayerError::ParameterError(format!(
                        "invalid Slice size {s}"
                    )))
                }
            };
            if used + size > extent {
                return Err(LayerError::ShapeError(format!(
                    "Slice sizes {:?} exceed the extent {extent}",
                    self.slices
                )));
            }
            used += size;
            sizes.push(size);
        }
        Ok(sizes)
    }

    pub fn forward(&self, bottom: &Tensor, opt: &Options) -> LayerResult<Vec<Tensor>> {
        let extent = match (bottom.dims(), self.axis) {
            (1, 0) | (2, 1) | (3, 2) => bottom.w(),
            (2, 0) | (3, 1) => bottom.h(),
            (3, 0) => bottom.c(),
            (dims, axis) => {
                return Err(LayerError::ParameterError(format!(
                    "unsupported Slice of a {dims}-d input along axis {axis}"
                )))
            }
        };
        let sizes = self.resolve_sizes(extent)?;
        let mut tops = match bottom.elem_type() {
            Some(ElemType::F32) => slice::<f32>(self.axis, &sizes, bottom, opt)?,
            Some(ElemType::I8) => slice::<i8>(self.axis, &sizes, bottom, opt)?,
            Some(ElemType::I32) => slice::<i32>(self.axis, &sizes, bottom, opt)?,
            None => return Err(LayerError::Allocation { elements: 0 }),
        };
        if let Some((mantissa, exponent)) = self.factor {
            if self.use_int8_inference && bottom.elem_type() == Some(ElemType::I8) {
                for top in tops.iter_mut().skip(1) {
                    let data = top.data_mut::<i8>()?;
                    opt.run(|| {
                        data.par_iter_mut()
                            .for_each(|v| *v = rescale(*v as i32, mantissa, exponent))
                    });
                }
            }
        }
        Ok(tops)
    }
}

fn slice<T: Element>(
    axis: usize,
    sizes: &[usize],
    bottom: &Tensor,
    opt: &Options,
) -> LayerResult<Vec<Tensor>> {
    let src = bottom.data::<T>()?;
    let (w, h, c) = (bottom.w(), bottom.h(), bottom.c());
    let cstep = bottom.cstep();
    let mut tops = Vec::with_capacity(sizes.len());
    let mut q = 0;
    for &size in sizes {
        let top = match (bottom.dims(), axis) {
            (1, 0) => {
                let mut top = Tensor::create_1d(size, T::TYPE)?;
                top.data_mut::<T>()?.copy_from_slice(&src[q..q + size]);
                top
            }
            (2, 0) => {
                let mut top = Tensor::create_2d(w, size, T::TYPE)?;
                top.data_mut::<T>()?
                    .copy_from_slice(&src[q * w..(q + size) * w]);
                top
            }
            (2, 1) => {
                let mut top = Tensor::create_2d(size, h, T::TYPE)?;
                let dst = top.data_mut::<T>()?;
                opt.run(|| {
                    dst.par_chunks_mut(size).enumerate().for_each(|(y, row)| {
                        row.copy_from_slice(&src[y * w + q..][..size]);
                    })
                });
                top
            }
            (3, 0) => {
                let mut top = Tensor::create_3d(w, h, size, T::TYPE)?;
                let plane = w * h;
                let out_cstep = top.cstep();
                let dst = top.data_mut::<T>()?;
                opt.run(|| {
                    dst.par_chunks_mut(out_cstep).enumerate().for_each(|(p, ch)| {
                        ch[..plane].copy_from_slice(&src[(q + p) * cstep..][..plane]);
                    })
                });
                top
            }
            (3, 1) => {
                let mut top = Tensor::create_3d(w, size, c, T::TYPE)?;
                let len = w * size;
                let out_cstep = top.cstep();
                let dst = top.data_mut::<T>()?;
                opt.run(|| {
                    dst.par_chunks_mut(out_cstep).enumerate().for_each(|(p, ch)| {
                        ch[..len].copy_from_slice(&src[p * cstep + q * w..][..len]);
                    })
                });
                top
            }
            (3, 2) => {
                let mut top = Tensor::create_3d(size, h, c, T::TYPE)?;
                let out_cstep = top.cstep();
                let dst = top.data_mut::<T>()?;
                opt.run(|| {
                    dst.par_chunks_mut(out_cstep).enumerate().for_each(|(p, ch)| {
                        for y in 0..h {
                            ch[y * size..][..size]
                                .copy_from_slice(&src[p * cstep + y * w + q..][..size]);
                        }
                    })
                });
                top
            }
            (dims, axis) => {
                return Err(LayerError::ParameterError(format!(
                    "unsupported Slice of a {dims}-d input along axis {axis}"
                )))
            }
        };
        tops.push(top);
        q += size;
    }
    Ok(tops)
}
