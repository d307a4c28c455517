//! Elementwise clamp.
use rayon::prelude::*;

use super::{LayerError, LayerResult, Options};
use crate::{
    graph::{keys, ParamDict},
    quantization::{shift, INT8_MAX},
    tensor::{ElemType, Element, Tensor},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub min: f32,
    pub max: f32,
    pub use_int8_inference: bool,
    /// `[mantissa, exponent]` or `[mantissa_a, mantissa_b, exponent]` of the input scale.
    pub scales: Vec<i32>,
}

impl Clip {
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            min,
            max,
            use_int8_inference: false,
            scales: Vec::new(),
        }
    }

    pub fn load_param(pd: &ParamDict) -> LayerResult<Self> {
        let clip = Self {
            min: pd.get_float(0, -f32::MAX),
            max: pd.get_float(1, f32::MAX),
            use_int8_inference: pd.get_int(keys::INT8, 0) != 0,
            scales: pd.get_ints(keys::FACTOR).unwrap_or_default(),
        };
        if clip.use_int8_inference && !clip.scales.is_empty() {
            clip.int8_bounds()?;
        }
        Ok(clip)
    }

    /// Bounds of the int8 path. The lower bound is 0: the int8 path is meant for
    /// ReLU6-style clips whose lower float bound is 0.
    pub fn int8_bounds(&self) -> LayerResult<(i8, i8)> {
        let (mantissa, exponent) = match self.scales.as_slice() {
            [m, e] => (*m, *e),
            [a, b, e] => ((*a).max(*b), *e),
            other => {
                return Err(LayerError::ParameterError(format!(
                    "Clip int8 scales must hold 2 or 3 values, got {other:?}"
                )))
            }
        };
        let upper = shift((self.max as f64 * mantissa as f64).round() as i64, exponent);
        Ok((0, upper.clamp(0, INT8_MAX as i64) as i8))
    }

    pub fn forward(&self, bottom: &Tensor, opt: &Options) -> LayerResult<Tensor> {
        let mut top = bottom.clone();
        self.forward_inplace(&mut top, opt)?;
        Ok(top)
    }

    pub fn forward_inplace(&self, blob: &mut Tensor, opt: &Options) -> LayerResult<()> {
        match blob.elem_type() {
            Some(ElemType::I8) if self.use_int8_inference => {
                let (lower, upper) = self.int8_bounds()?;
                clamp_channels(blob, opt, lower, upper)
            }
            Some(ElemType::F32) => clamp_channels(blob, opt, self.min, self.max),
            Some(other) => Err(LayerError::ParameterError(format!(
                "Clip cannot run on {other} data without int8 inference"
            ))),
            None => Err(LayerError::Allocation { elements: 0 }),
        }
    }
}

fn clamp_channels<T: Element + PartialOrd>(
    blob: &mut Tensor,
    opt: &Options,
    lower: T,
    upper: T,
) -> LayerResult<()> {
    let plane = blob.w() * blob.h();
    let cstep = blob.cstep();
    let data = blob.data_mut::<T>()?;
    opt.run(|| {
        data.par_chunks_mut(cstep).for_each(|ch| {
            for v in &mut ch[..plane] {
                if *v < lower {
                    *v = lower;
                }
                if *v > upper {
                    *v = upper;
                }
            }
        })
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn sample() -> Tensor {
        let values = (0..27).map(|i| (i as f32 - 13.0) * 0.7).collect::<Vec<_>>();
        Tensor::from_packed(3, 3, 3, 3, &values).unwrap()
    }

    #[rstest]
    #[case(0.0, 6.0)]
    #[case(-1.5, 1.5)]
    #[case(-f32::MAX, 2.0)]
    fn clip_is_idempotent(#[case] min: f32, #[case] max: f32) {
        let clip = Clip::new(min, max);
        let opt = Options::default();
        let once = clip.forward(&sample(), &opt).unwrap();
        let twice = clip.forward(&once, &opt).unwrap();
        assert_eq!(once, twice);
        assert!(once
            .to_packed::<f32>()
            .unwrap()
            .iter()
            .all(|v| *v >= min && *v <= max));
    }

    #[test]
    fn forward_leaves_the_input_untouched() {
        let input = sample();
        let out = Clip::new(0.0, 1.0).forward(&input, &Options::default()).unwrap();
        assert!(!out.shares_buffer_with(&input));
        assert_eq!(input.channel::<f32>(0).unwrap()[0], -13.0f32 * 0.7);
    }

    #[rstest]
    // relu6 with input scale 21.0 ~= 84 * 2^-2: 6 * 84 >> 2 = 126
    #[case(vec![84, -2], 126)]
    #[case(vec![60, 84, -2], 126)]
    // positive exponents saturate to 127
    #[case(vec![20, 1], 127)]
    fn int8_bounds_follow_the_fixed_point_scale(#[case] scales: Vec<i32>, #[case] upper: i8) {
        let mut pd = ParamDict::new();
        pd.set(0, 0.0f32);
        pd.set(1, 6.0f32);
        pd.set(keys::INT8, 1);
        pd.set(keys::FACTOR, scales);
        let clip = Clip::load_param(&pd).unwrap();
        assert_eq!(clip.int8_bounds().unwrap(), (0, upper));

        let input = Tensor::from_vec_1d(vec![-5i8, 3, 127]).unwrap();
        let opt = Options::default();
        let once = clip.forward(&input, &opt).unwrap();
        assert_eq!(once.data::<i8>().unwrap(), &[0, 3, upper]);
        assert_eq!(clip.forward(&once, &opt).unwrap(), once);
    }

    #[test]
    fn malformed_int8_scales_are_rejected() {
        let mut pd = ParamDict::new();
        pd.set(keys::INT8, 1);
        pd.set(keys::FACTOR, vec![1, 2, 3, 4]);
        assert!(Clip::load_param(&pd).is_err());
    }
}
