//! Module that takes care of (re)quantizing values and weights.
//!
//! The int8 domain is symmetric, `[-127, 127]`: -128 is never produced so that negating a
//! quantized value cannot overflow.
pub mod fixed_point;
pub mod weights;

pub use fixed_point::FixedPoint;
pub use weights::WeightQuantizer;

pub const INT8_MIN: i32 = -127;
pub const INT8_MAX: i32 = 127;

/// Round to nearest (ties away from zero) and saturate into the int8 domain.
pub fn float2int8(v: f32) -> i8 {
    int2int8(v.round() as i32)
}

pub fn int2int8(v: i32) -> i8 {
    v.clamp(INT8_MIN, INT8_MAX) as i8
}

/// Shift left by `shift` when positive, right by `-shift` when negative.
pub fn shift(v: i64, shift: i32) -> i64 {
    if shift < 0 {
        v >> (-shift).min(63)
    } else {
        v.saturating_mul(1i64 << shift.min(62))
    }
}

/// Integer multiply-and-shift rescale, `(x * mantissa) >> -shift`, saturated into int8.
pub fn rescale(x: i32, mantissa: i32, exponent: i32) -> i8 {
    let v = shift(x as i64 * mantissa as i64, exponent);
    v.clamp(INT8_MIN as i64, INT8_MAX as i64) as i8
}
