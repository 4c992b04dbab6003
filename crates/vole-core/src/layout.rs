use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how a logical shape is laid over a flat buffer
//
// A layout is a shape, one stride per dim and a start offset. Element
// `[i0, i1, ..]` lives at `offset + i0 * s0 + i1 * s1 + ..` in storage.
//
// Every shape transform a QuantTensor supports rewrites the layouts of its
// value and metadata tensors and leaves the buffers alone:
//
//   transpose/permute   shuffle dims and strides together
//   narrow              shrink one dim and move the offset
//   broadcast_to        stride 0 on stretched dims, so a [C, 1, 1] scale
//                       reads the same element for every (h, w)
//
// A layout is contiguous when it has offset 0 and row-major strides; only
// those can be reshaped without copying.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at element 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Self::new(shape, strides, 0)
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        debug_assert_eq!(shape.rank(), strides.len());
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Index of the first element in the underlying buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        let rank = self.rank();
        if dim < rank {
            Ok(())
        } else {
            Err(Error::DimOutOfRange { dim, rank })
        }
    }

    /// Layout whose dim `i` is dim `order[i]` of this one.
    fn reordered(&self, order: &[usize]) -> Layout {
        let dims = order.iter().map(|&d| self.dims()[d]).collect::<Vec<_>>();
        let strides = order.iter().map(|&d| self.strides[d]).collect();
        Layout::new(Shape::new(dims), strides, self.offset)
    }

    /// Swap two dims. `transpose(0, 2)` of `[2, 3, 4]` / `[12, 4, 1]`
    /// is `[4, 3, 2]` / `[1, 4, 12]`.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;
        let mut order = (0..self.rank()).collect::<Vec<_>>();
        order.swap(dim0, dim1);
        Ok(self.reordered(&order))
    }

    /// Reorder dims; `order` must name every dim of `0..rank` exactly once.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if order.len() != rank {
            return Err(Error::msg(format!(
                "permute: {order:?} does not cover the {rank} dims of {}",
                self.shape
            )));
        }
        let mut taken = vec![false; rank];
        for &d in order {
            self.check_dim(d)?;
            if std::mem::replace(&mut taken[d], true) {
                return Err(Error::msg(format!("permute: dim {d} repeated in {order:?}")));
            }
        }
        Ok(self.reordered(order))
    }

    /// Keep `len` entries of `dim`, starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let dim_size = self.dims()[dim];
        if start.checked_add(len).map_or(true, |end| end > dim_size) {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// View this layout as `target`, right-aligned. Dims equal to the target's
    /// keep their stride; size-1 and missing leading dims get stride 0.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        let mismatch = || Error::ShapeMismatch {
            expected: target.clone(),
            got: self.shape.clone(),
        };
        let lead = target
            .rank()
            .checked_sub(self.rank())
            .ok_or_else(mismatch)?;
        let mut strides = vec![0; target.rank()];
        for (i, (&d, &s)) in self.dims().iter().zip(&self.strides).enumerate() {
            match target.dims()[lead + i] {
                t if t == d => strides[lead + i] = s,
                _ if d == 1 => {}
                _ => return Err(mismatch()),
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Buffer positions of every element, in row-major logical order.
    pub fn strided_indices(&self) -> StridedIndices {
        StridedIndices {
            dims: self.dims().to_vec(),
            strides: self.strides.clone(),
            counter: vec![0; self.rank()],
            pos: self.offset,
            left: self.elem_count(),
        }
    }
}

/// Walks a layout like an odometer, carrying the buffer position along
/// instead of recomputing it from the full index.
pub struct StridedIndices {
    dims: Vec<usize>,
    strides: Vec<usize>,
    counter: Vec<usize>,
    pos: usize,
    left: usize,
}

impl Iterator for StridedIndices {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        let here = self.pos;
        if self.left > 0 {
            for d in (0..self.dims.len()).rev() {
                self.counter[d] += 1;
                self.pos += self.strides[d];
                if self.counter[d] < self.dims[d] {
                    break;
                }
                self.pos -= self.counter[d] * self.strides[d];
                self.counter[d] = 0;
            }
        }
        Some(here)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.left, Some(self.left))
    }
}

impl ExactSizeIterator for StridedIndices {}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(layout: &Layout) -> Vec<usize> {
        layout.strided_indices().collect()
    }

    #[test]
    fn test_contiguous_walks_in_order() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        assert_eq!(positions(&layout), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_walks_columns() {
        let t = Layout::contiguous(Shape::from((2, 3))).transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        assert_eq!(positions(&t), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_permute_rejects_bad_orders() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        let p = layout.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        assert_eq!(p.strides(), &[1, 12, 4]);
        assert!(layout.permute(&[1, 1, 0]).is_err());
        assert!(layout.permute(&[0, 1]).is_err());
        assert!(layout.permute(&[0, 1, 3]).is_err());
    }

    #[test]
    fn test_narrow_moves_offset() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let n = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(n.dims(), &[4, 3]);
        assert_eq!(n.offset(), 2);
        assert_eq!(&positions(&n)[..4], &[2, 3, 4, 8]);
        assert!(layout.narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_broadcast_column_over_rows() {
        let column = Layout::contiguous(Shape::from((2, 1)));
        let b = column.broadcast_to(&Shape::from((2, 3))).unwrap();
        assert_eq!(positions(&b), vec![0, 0, 0, 1, 1, 1]);
        assert!(column.broadcast_to(&Shape::from((3, 3))).is_err());
        assert!(column.broadcast_to(&Shape::from(4)).is_err());

        let scalar = Layout::contiguous(Shape::from(()));
        let b = scalar.broadcast_to(&Shape::from((2, 2))).unwrap();
        assert_eq!(b.strides(), &[0, 0]);
        assert_eq!(positions(&b), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_scalar_and_empty_layouts() {
        assert_eq!(positions(&Layout::contiguous(Shape::from(()))), vec![0]);
        assert!(positions(&Layout::contiguous(Shape::from((2, 0)))).is_empty());
    }
}
