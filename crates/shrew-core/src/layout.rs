use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — Strided placement of a tensor in flat storage (shape + strides + offset)
//
// Backends that cannot consume a tensor in its producer's arrangement need a
// precise description of where every element lives. A Layout records it:
//
// 1. **Strides**: elements to skip in flat storage per step along each
//    dimension. A contiguous [2,3] matrix has strides [3,1].
//
// 2. **Offset**: where the first element sits in the backing storage.
//
// 3. **Narrowing**: slicing restricts the shape and moves the offset; the
//    strides stay those of the backing storage.
//
// Layouts are what the memory-descriptor builder turns into explicit-stride
// backend descriptors.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the storage buffer where this tensor's data starts.
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    /// Strides are computed as row-major (C-order).
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset.
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Result<Self> {
        if strides.len() != shape.rank() {
            return Err(Error::RankMismatch {
                expected: shape.rank(),
                got: strides.len(),
            });
        }
        Ok(Layout {
            shape,
            strides,
            offset,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Check if this layout is contiguous (row-major, no gaps, offset 0).
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Narrow along a single dimension, keeping the storage strides.
    ///
    /// Example: [4, 6] narrow(dim=1, start=2, len=3) → [4, 3], offset += 2
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = len;
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[dim],
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
    }

    #[test]
    fn test_new_rejects_arity_mismatch() {
        assert!(Layout::new(Shape::from((2, 3)), vec![1], 0).is_err());
    }

    #[test]
    fn test_narrow() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let narrowed = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(narrowed.dims(), &[4, 3]);
        assert_eq!(narrowed.offset(), 2);
        assert_eq!(narrowed.strides(), &[6, 1]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        assert!(layout.narrow(1, 5, 3).is_err());
        assert!(layout.narrow(2, 0, 1).is_err());
    }

    #[test]
    fn test_narrow_twice_accumulates_offset() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)))
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(2, 2, 2)
            .unwrap();
        assert_eq!(layout.dims(), &[1, 3, 2]);
        assert_eq!(layout.offset(), 12 + 2);
        assert!(!layout.is_contiguous());
    }

}
