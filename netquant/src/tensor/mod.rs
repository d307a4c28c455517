//! Dense tensors of up to three dimensions (`w`, `h`, `c`).
//!
//! Channels are stored as planes of `w * h` elements separated by a channel stride
//! (`cstep`). For 3-D tensors the stride is rounded up so that every plane starts on a
//! 16-byte boundary, exactly like the runtime the quantized models are meant for.
//!
//! Cloning a [`Tensor`] shares its buffer; the first write through [`Tensor::data_mut`]
//! on a shared buffer makes a private copy.
mod error;

use std::{fmt::Debug, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use error::TensorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ElemType {
    #[display("float32")]
    F32,
    #[display("int8")]
    I8,
    #[display("int32")]
    I32,
}

impl ElemType {
    pub fn size(self) -> usize {
        match self {
            ElemType::F32 | ElemType::I32 => 4,
            ElemType::I8 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
}

impl Buffer {
    pub fn elem_type(&self) -> ElemType {
        match self {
            Buffer::F32(_) => ElemType::F32,
            Buffer::I8(_) => ElemType::I8,
            Buffer::I32(_) => ElemType::I32,
        }
    }

    fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::I8(v) => v.len(),
            Buffer::I32(v) => v.len(),
        }
    }

    fn zeroed(elem: ElemType, elements: usize) -> Result<Self, TensorError> {
        Ok(match elem {
            ElemType::F32 => Buffer::F32(alloc(elements)?),
            ElemType::I8 => Buffer::I8(alloc(elements)?),
            ElemType::I32 => Buffer::I32(alloc(elements)?),
        })
    }
}

fn alloc<T: Element>(elements: usize) -> Result<Vec<T>, TensorError> {
    if elements == 0 {
        return Err(TensorError::Allocation { elements });
    }
    let mut v = Vec::new();
    v.try_reserve_exact(elements)
        .map_err(|_| TensorError::Allocation { elements })?;
    v.resize(elements, T::default());
    Ok(v)
}

/// Scalar types a [`Tensor`] can hold.
pub trait Element: bytemuck::Pod + Default + Debug + PartialEq + Send + Sync {
    const TYPE: ElemType;
    fn slice(buf: &Buffer) -> Option<&[Self]>;
    fn slice_mut(buf: &mut Buffer) -> Option<&mut [Self]>;
    fn wrap(data: Vec<Self>) -> Buffer;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const TYPE: ElemType = ElemType::$variant;

            fn slice(buf: &Buffer) -> Option<&[Self]> {
                match buf {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(buf: &mut Buffer) -> Option<&mut [Self]> {
                match buf {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(i8, I8);
impl_element!(i32, I32);

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: usize,
    w: usize,
    h: usize,
    c: usize,
    cstep: usize,
    data: Option<Arc<Buffer>>,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::empty()
    }
}

impl Tensor {
    /// A tensor without storage, the result of a failed allocation.
    pub fn empty() -> Self {
        Self {
            dims: 0,
            w: 0,
            h: 0,
            c: 0,
            cstep: 0,
            data: None,
        }
    }

    pub fn create_1d(w: usize, elem: ElemType) -> Result<Self, TensorError> {
        Self::create(1, w, 1, 1, elem)
    }

    pub fn create_2d(w: usize, h: usize, elem: ElemType) -> Result<Self, TensorError> {
        Self::create(2, w, h, 1, elem)
    }

    pub fn create_3d(w: usize, h: usize, c: usize, elem: ElemType) -> Result<Self, TensorError> {
        Self::create(3, w, h, c, elem)
    }

    /// Allocate a zeroed tensor with the shape of `other`.
    pub fn create_like(other: &Tensor, elem: ElemType) -> Result<Self, TensorError> {
        Self::create(other.dims, other.w, other.h, other.c, elem)
    }

    fn create(dims: usize, w: usize, h: usize, c: usize, elem: ElemType) -> Result<Self, TensorError> {
        let cstep = channel_step(dims, w, h, elem);
        let data = Buffer::zeroed(elem, cstep * c)?;
        Ok(Self {
            dims,
            w,
            h,
            c,
            cstep,
            data: Some(Arc::new(data)),
        })
    }

    pub fn from_vec_1d<T: Element>(data: Vec<T>) -> Result<Self, TensorError> {
        if data.is_empty() {
            return Err(TensorError::Allocation { elements: 0 });
        }
        Ok(Self {
            dims: 1,
            w: data.len(),
            h: 1,
            c: 1,
            cstep: data.len(),
            data: Some(Arc::new(T::wrap(data))),
        })
    }

    /// Build a tensor from densely packed values (`w * h` per channel).
    pub fn from_packed<T: Element>(
        dims: usize,
        w: usize,
        h: usize,
        c: usize,
        packed: &[T],
    ) -> Result<Self, TensorError> {
        if !(1..=3).contains(&dims) || w * h * c != packed.len() {
            return Err(TensorError::ShapeMismatch(format!(
                "{} values do not fill a {dims}-d tensor of {w}x{h}x{c}",
                packed.len()
            )));
        }
        let mut t = Self::create(dims, w, h, c, T::TYPE)?;
        let plane = w * h;
        let cstep = t.cstep;
        let data = t.data_mut::<T>()?;
        for (dst, src) in data.chunks_mut(cstep).zip(packed.chunks(plane)) {
            dst[..plane].copy_from_slice(src);
        }
        Ok(t)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn c(&self) -> usize {
        self.c
    }

    pub fn cstep(&self) -> usize {
        self.cstep
    }

    /// Number of meaningful elements, excluding channel padding.
    pub fn len(&self) -> usize {
        self.w * self.h * self.c
    }

    pub fn elem_type(&self) -> Option<ElemType> {
        self.data.as_deref().map(Buffer::elem_type)
    }

    /// True if both tensors point at the same storage.
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn buffer(&self) -> Result<&Buffer, TensorError> {
        self.data
            .as_deref()
            .ok_or(TensorError::Allocation { elements: 0 })
    }

    /// The whole buffer, channel padding included.
    pub fn data<T: Element>(&self) -> Result<&[T], TensorError> {
        let buf = self.buffer()?;
        T::slice(buf).ok_or(TensorError::TypeMismatch {
            expected: T::TYPE,
            found: buf.elem_type(),
        })
    }

    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T], TensorError> {
        let arc = self
            .data
            .as_mut()
            .ok_or(TensorError::Allocation { elements: 0 })?;
        let found = arc.elem_type();
        T::slice_mut(Arc::make_mut(arc)).ok_or(TensorError::TypeMismatch {
            expected: T::TYPE,
            found,
        })
    }

    /// Read-only sub-range view into the buffer.
    pub fn range<T: Element>(&self, offset: usize, len: usize) -> Result<&[T], TensorError> {
        let data = self.data::<T>()?;
        data.get(offset..offset + len).ok_or(TensorError::OutOfRange {
            offset,
            len,
            total: data.len(),
        })
    }

    /// Read-write sub-range view into the buffer.
    pub fn range_mut<T: Element>(&mut self, offset: usize, len: usize) -> Result<&mut [T], TensorError> {
        let data = self.data_mut::<T>()?;
        let total = data.len();
        data.get_mut(offset..offset + len)
            .ok_or(TensorError::OutOfRange { offset, len, total })
    }

    /// The `w * h` meaningful elements of channel `q`.
    pub fn channel<T: Element>(&self, q: usize) -> Result<&[T], TensorError> {
        self.range(q * self.cstep, self.w * self.h)
    }

    pub fn channel_mut<T: Element>(&mut self, q: usize) -> Result<&mut [T], TensorError> {
        let (offset, len) = (q * self.cstep, self.w * self.h);
        self.range_mut(offset, len)
    }

    /// Values without channel padding, in channel-major order.
    pub fn to_packed<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        let data = self.data::<T>()?;
        if self.cstep == self.w * self.h {
            return Ok(data[..self.len()].to_vec());
        }
        let plane = self.w * self.h;
        Ok(data
            .chunks(self.cstep)
            .flat_map(|ch| ch[..plane].iter().copied())
            .collect())
    }

    /// Packed little-endian bytes of the meaningful elements.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TensorError> {
        Ok(match self.buffer()? {
            Buffer::F32(_) => bytemuck::cast_slice(&self.to_packed::<f32>()?).to_vec(),
            Buffer::I8(_) => bytemuck::cast_slice(&self.to_packed::<i8>()?).to_vec(),
            Buffer::I32(_) => bytemuck::cast_slice(&self.to_packed::<i32>()?).to_vec(),
        })
    }

    /// Reinterpret a 1-D tensor's data with a different logical shape of the same size.
    pub fn reshape(&self, dims: usize, w: usize, h: usize, c: usize) -> Result<Self, TensorError> {
        if w * h * c != self.len() {
            return Err(TensorError::ShapeMismatch(format!(
                "cannot reshape {} elements into {w}x{h}x{c}",
                self.len()
            )));
        }
        match self.buffer()? {
            Buffer::F32(_) => Self::from_packed(dims, w, h, c, &self.to_packed::<f32>()?),
            Buffer::I8(_) => Self::from_packed(dims, w, h, c, &self.to_packed::<i8>()?),
            Buffer::I32(_) => Self::from_packed(dims, w, h, c, &self.to_packed::<i32>()?),
        }
    }

    /// Elements the buffer can hold, channel padding included; 0 for an empty tensor.
    pub fn capacity(&self) -> usize {
        self.data.as_deref().map(Buffer::len).unwrap_or(0)
    }
}

fn channel_step(dims: usize, w: usize, h: usize, elem: ElemType) -> usize {
    let plane = w * h;
    if dims < 3 {
        return plane;
    }
    let size = elem.size();
    (plane * size).div_ceil(16) * 16 / size
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_stride_is_aligned_for_3d() {
        let t = Tensor::create_3d(3, 3, 2, ElemType::F32).unwrap();
        assert_eq!(t.cstep(), 12);
        assert_eq!(t.capacity(), 24);
        let t = Tensor::create_3d(3, 3, 2, ElemType::I8).unwrap();
        assert_eq!(t.cstep(), 16);
        let t = Tensor::create_2d(3, 3, ElemType::F32).unwrap();
        assert_eq!(t.cstep(), 9);
    }

    #[test]
    fn zero_sized_allocation_is_empty() {
        let err = Tensor::create_1d(0, ElemType::F32).unwrap_err();
        assert_eq!(err, TensorError::Allocation { elements: 0 });
        assert!(Tensor::empty().is_empty());
        assert_eq!(Tensor::empty().capacity(), 0);
    }

    #[test]
    fn packed_round_trip_skips_padding() {
        let values = (0..18).map(|v| v as f32).collect::<Vec<_>>();
        let t = Tensor::from_packed(3, 3, 3, 2, &values).unwrap();
        assert_eq!(t.channel::<f32>(1).unwrap()[0], 9.0);
        assert_eq!(t.to_packed::<f32>().unwrap(), values);
    }

    #[test]
    fn clones_share_until_written() {
        let a = Tensor::from_vec_1d(vec![1i8, 2, 3]).unwrap();
        let mut b = a.clone();
        assert!(a.shares_buffer_with(&b));
        b.data_mut::<i8>().unwrap()[0] = 7;
        assert!(!a.shares_buffer_with(&b));
        assert_eq!(a.data::<i8>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn typed_access_checks_element_type() {
        let t = Tensor::from_vec_1d(vec![1i32]).unwrap();
        assert!(matches!(
            t.data::<f32>(),
            Err(TensorError::TypeMismatch {
                expected: ElemType::F32,
                found: ElemType::I32
            })
        ));
        assert!(t.range::<i32>(0, 2).is_err());
    }
}
