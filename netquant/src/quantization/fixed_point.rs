//! Shared-exponent fixed-point encoding of float scales.
//!
//! A list of scales is encoded as integer mantissas and one exponent `e` so that
//! `scale[i] ~= mantissa[i] * 2^e`. The largest magnitude gets [`MANTISSA_BITS`] bits of
//! precision; runtime code then replaces `x * scale` by `(x * mantissa) >> -e`.
use serde::Serialize;

use super::rescale;

pub const MANTISSA_BITS: i32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedPoint {
    pub mantissas: Vec<i32>,
    /// Power of two applied to every mantissa; negative means a right shift.
    pub exponent: i32,
}

impl FixedPoint {
    /// Encode `scales`. Returns `None` for an empty list or non-finite values.
    pub fn encode(scales: &[f32]) -> Option<Self> {
        if scales.is_empty() || scales.iter().any(|s| !s.is_finite()) {
            return None;
        }
        let max_abs = scales.iter().fold(0f32, |m, s| m.max(s.abs()));
        if max_abs == 0.0 {
            return Some(Self {
                mantissas: vec![0; scales.len()],
                exponent: 0,
            });
        }
        let int_bits = max_abs.log2().floor() as i32;
        let frac_bits = MANTISSA_BITS - int_bits;
        let quantum = 2f64.powi(-frac_bits);
        let mantissas = scales
            .iter()
            .map(|s| (*s as f64 / quantum).round() as i32)
            .collect();
        Some(Self {
            mantissas,
            exponent: -frac_bits,
        })
    }

    pub fn decode(&self) -> Vec<f32> {
        let quantum = 2f64.powi(self.exponent);
        self.mantissas
            .iter()
            .map(|m| (*m as f64 * quantum) as f32)
            .collect()
    }

    /// Serialized form: the mantissas followed by the exponent.
    pub fn to_ints(&self) -> Vec<i32> {
        let mut v = self.mantissas.clone();
        v.push(self.exponent);
        v
    }

    pub fn from_ints(ints: &[i32]) -> Option<Self> {
        let (exponent, mantissas) = ints.split_last()?;
        Some(Self {
            mantissas: mantissas.to_vec(),
            exponent: *exponent,
        })
    }

    /// Rescale an integer by the `i`-th encoded scale, saturating into int8.
    pub fn apply(&self, i: usize, x: i32) -> i8 {
        rescale(x, self.mantissas[i], self.exponent)
    }

    pub fn len(&self) -> usize {
        self.mantissas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mantissas.is_empty()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[1.0, 0.75, 0.6])]
    #[case(&[0.0123, 0.0101, 0.0099])]
    #[case(&[57.3, 40.1, -33.0])]
    #[case(&[3.0e-5, 2.0e-5])]
    fn decoding_stays_within_the_mantissa_budget(#[case] scales: &[f32]) {
        let fp = FixedPoint::encode(scales).unwrap();
        let max_abs = scales.iter().fold(0f32, |m, s| m.max(s.abs()));
        for (orig, decoded) in scales.iter().zip(fp.decode()) {
            // entries share the exponent of the largest one, so small entries only resolve
            // to its quantum of 2^-7 * max_abs / 2
            let tolerance = 2f32.powi(-MANTISSA_BITS) * orig.abs().max(max_abs / 2.0);
            assert!(
                (orig - decoded).abs() <= tolerance,
                "{orig} decoded as {decoded}"
            );
        }
        assert!(fp.mantissas.iter().all(|m| m.abs() <= 256));
    }

    #[test]
    fn exponent_follows_the_largest_magnitude() {
        // max 0.75 -> log2 floor -1 -> 8 fractional bits
        let fp = FixedPoint::encode(&[0.75, 0.5]).unwrap();
        assert_eq!(fp.exponent, -8);
        assert_eq!(fp.mantissas, vec![192, 128]);
        assert_eq!(fp.to_ints(), vec![192, 128, -8]);
        assert_eq!(FixedPoint::from_ints(&fp.to_ints()), Some(fp));
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(FixedPoint::encode(&[]), None);
        assert_eq!(FixedPoint::encode(&[f32::INFINITY]), None);
        let zero = FixedPoint::encode(&[0.0, 0.0]).unwrap();
        assert_eq!(zero.to_ints(), vec![0, 0, 0]);
    }

    #[test]
    fn apply_matches_float_multiply() {
        let fp = FixedPoint::encode(&[0.5]).unwrap();
        assert_eq!(fp.apply(0, 100), 50);
        assert_eq!(fp.apply(0, -100), -50);
    }
}
