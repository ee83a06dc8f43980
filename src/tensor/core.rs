//! Core scalar properties of a tensor: shape, data type and layout

use std::fmt::{self, Display};
use serde::{Serialize, Deserialize};

use crate::error::{IngotError, IngotResult};
use super::devices::Device;

/// Runtime shape of a tensor; an empty dim list is a scalar
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Element count, `None` when it does not fit in `usize`
    pub fn total_elements(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    /// Numpy-style broadcast of two shapes, aligned from the trailing dim
    pub fn broadcast(&self, other: &Shape) -> IngotResult<Shape> {
        let ndim = self.ndim().max(other.ndim());
        let mut dims = vec![0; ndim];

        for i in 0..ndim {
            let a = dim_from_back(&self.dims, i);
            let b = dim_from_back(&other.dims, i);
            dims[ndim - 1 - i] = match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(IngotError::shape_error(
                        &self.to_string(),
                        &other.to_string(),
                        Some("Shapes must be equal or 1 in every trailing dimension"),
                    ))
                }
            };
        }

        Ok(Shape { dims })
    }
}

fn dim_from_back(dims: &[usize], i: usize) -> usize {
    if i < dims.len() {
        dims[dims.len() - 1 - i]
    } else {
        1
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self { dims }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self { dims: dims.to_vec() }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

/// Element data types understood by the backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    I8,
    I16,
    I32,
    U8,
    Bool,
    /// Quantized INT8
    QI8,
}

impl DType {
    /// Get the size in bytes of this data type
    pub const fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 => 4,
            DType::U8 => 1,
            DType::Bool => 1,
            DType::QI8 => 1,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::U8)
    }

    pub const fn is_quantized(&self) -> bool {
        matches!(self, DType::QI8)
    }

    /// Front-end facing name, numpy spelling
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::U8 => "uint8",
            DType::Bool => "bool",
            DType::QI8 => "qint8",
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a shape/dtype/device query can return, in one value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    pub shape: Shape,
    pub dtype: DType,
    pub device: Device,
}

impl TensorLayout {
    pub fn new(shape: impl Into<Shape>, dtype: DType, device: Device) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            device,
        }
    }

    /// Bytes a backend needs to hold this layout, `None` on overflow
    pub fn nbytes(&self) -> Option<usize> {
        self.shape.total_elements()?.checked_mul(self.dtype.size())
    }
}

impl Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.shape, self.dtype, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.total_elements(), Some(24));
        assert_eq!(shape.ndim(), 3);
        assert!(!shape.is_scalar());
        assert!(Shape::scalar().is_scalar());
        assert_eq!(Shape::scalar().total_elements(), Some(1));
        assert_eq!(shape.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_shape_broadcast() {
        let a = Shape::new([4, 1, 3]);
        let b = Shape::new([5, 3]);
        assert_eq!(a.broadcast(&b).unwrap(), Shape::new([4, 5, 3]));
        assert_eq!(Shape::scalar().broadcast(&b).unwrap(), b);

        let err = Shape::new([2, 3]).broadcast(&Shape::new([4])).unwrap_err();
        assert!(err.to_string().contains("Expected [2, 3], got [4]"));
    }

    #[test]
    fn test_dtype_features() {
        assert!(DType::F32.is_float());
        assert!(DType::I32.is_int());
        assert!(DType::QI8.is_quantized());
        assert_eq!(DType::BF16.size(), 2);
        assert_eq!(DType::F32.to_string(), "float32");
    }

    #[test]
    fn test_layout_display() {
        let layout = TensorLayout::new([2, 2], DType::F32, Device::Cuda(1));
        assert_eq!(layout.nbytes(), Some(16));
        assert_eq!(layout.to_string(), "[2, 2] float32 cuda:1");
    }

    #[test]
    fn test_layout_size_overflow() {
        let huge = TensorLayout::new([usize::MAX, 2], DType::F32, Device::Cpu);
        assert_eq!(huge.shape.total_elements(), None);
        assert_eq!(huge.nbytes(), None);

        let wide = TensorLayout::new([usize::MAX / 2], DType::F32, Device::Cpu);
        assert!(wide.shape.total_elements().is_some());
        assert_eq!(wide.nbytes(), None);
    }
}
