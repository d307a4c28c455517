//! Fan one tensor out to several consumers.
use rayon::prelude::*;
use serde::Serialize;

use super::{LayerError, LayerResult, Options};
use crate::{
    graph::{keys, ParamDict, Weight},
    quantization::rescale,
    tensor::{ElemType, Tensor},
};

/// Integer rescale of one Split output, stored as `[output, mantissa, exponent]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitFactor {
    pub output: usize,
    pub mantissa: i32,
    pub exponent: i32,
}

impl SplitFactor {
    pub fn to_ints(self) -> [i32; 3] {
        [self.output as i32, self.mantissa, self.exponent]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub outputs: usize,
    pub use_int8_inference: bool,
    pub use_factor: bool,
    pub factor: Option<SplitFactor>,
}

impl Split {
    pub fn new(outputs: usize) -> Self {
        Self {
            outputs,
            use_int8_inference: false,
            use_factor: false,
            factor: None,
        }
    }

    pub fn load_param(pd: &ParamDict, outputs: usize) -> LayerResult<Self> {
        if outputs == 0 {
            return Err(LayerError::ParameterError(
                "Split without outputs".to_string(),
            ));
        }
        Ok(Self {
            outputs,
            use_int8_inference: pd.get_int(keys::INT8, 0) != 0,
            use_factor: pd.get_int(keys::FACTOR, 0) != 0,
            factor: None,
        })
    }

    pub fn load_model(&mut self, weights: &[Weight]) -> LayerResult<()> {
        if !self.use_factor {
            return Ok(());
        }
        let stored = weights
            .first()
            .ok_or_else(|| LayerError::ParameterError("Split factor is missing".to_string()))?;
        let [output, mantissa, exponent] = match stored.data.data::<i32>()? {
            [o, m, e, ..] => [*o, *m, *e],
            other => {
                return Err(LayerError::ParameterError(format!(
                    "Split factor needs 3 values, got {}",
                    other.len()
                )))
            }
        };
        let output = usize::try_from(output)
            .ok()
            .filter(|o| *o < self.outputs)
            .ok_or_else(|| {
                LayerError::ParameterError(format!(
                    "Split factor targets output {output} of {}",
                    self.outputs
                ))
            })?;
        self.factor = Some(SplitFactor {
            output,
            mantissa,
            exponent,
        });
        Ok(())
    }

    /// Every output shares the input buffer, except the rescaled one in int8 mode.
    pub fn forward(&self, bottom: &Tensor, opt: &Options) -> LayerResult<Vec<Tensor>> {
        let mut tops = vec![bottom.clone(); self.outputs];
        let factor = match self.factor {
            Some(f) if self.use_int8_inference && bottom.elem_type() == Some(ElemType::I8) => f,
            _ => return Ok(tops),
        };
        let mut scaled = Tensor::create_like(bottom, ElemType::I8)?;
        let src = bottom.data::<i8>()?;
        let dst = scaled.data_mut::<i8>()?;
        opt.run(|| {
            dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, s)| {
                *d = rescale(*s as i32, factor.mantissa, factor.exponent)
            })
        });
        tops[factor.output] = scaled;
        Ok(tops)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::Storage;

    fn with_factor(values: Vec<i32>) -> LayerResult<Split> {
        let mut pd = ParamDict::new();
        pd.set(keys::INT8, 1);
        pd.set(keys::FACTOR, 1);
        let mut split = Split::load_param(&pd, 2)?;
        let stored = Tensor::from_vec_1d(values).map_err(LayerError::from)?;
        split.load_model(&[Weight::new(stored, Storage::RawI32)])?;
        Ok(split)
    }

    #[test]
    fn float_outputs_alias_the_input() {
        let input = Tensor::from_vec_1d(vec![1.0f32, 2.0]).unwrap();
        let tops = Split::new(3).forward(&input, &Options::default()).unwrap();
        assert_eq!(tops.len(), 3);
        assert!(tops.iter().all(|t| t.shares_buffer_with(&input)));
    }

    #[test]
    fn factor_rescales_only_its_output() {
        // 2/3 ~= 85 * 2^-7
        let split = with_factor(vec![1, 85, -7]).unwrap();
        let input = Tensor::from_vec_1d(vec![30i8, -60, 127]).unwrap();
        let tops = split.forward(&input, &Options::default()).unwrap();
        assert!(tops[0].shares_buffer_with(&input));
        assert_eq!(tops[1].data::<i8>().unwrap(), &[19, -40, 84]);
    }

    #[test]
    fn factor_is_ignored_without_int8_data() {
        let split = with_factor(vec![0, 85, -7]).unwrap();
        let input = Tensor::from_vec_1d(vec![30.0f32]).unwrap();
        let tops = split.forward(&input, &Options::default()).unwrap();
        assert!(tops.iter().all(|t| t.shares_buffer_with(&input)));
    }

    #[test]
    fn factor_must_target_an_existing_output() {
        assert!(with_factor(vec![2, 85, -7]).is_err());
        assert!(with_factor(vec![1, 85]).is_err());
        assert!(Split::load_param(&ParamDict::new(), 0).is_err());
    }
}
