use crate::error::{Error, Result};
use std::fmt;

// Shape — dimension sizes of a tensor
//
// `[]` is a scalar with one element, `[5]` a vector, `[3, 4]` a matrix.
//
// Quantization metadata leans on shapes more than most code does: a
// per-channel scale of shape [C, 1, 1] only means something relative to the
// value it is broadcast against, so every "does this metadata fit that
// value" question is answered by the broadcasting helpers here.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the dims; 1 for a scalar, 0 if any dim is 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides: `[2, 3, 4]` gives `[12, 4, 1]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = self
            .0
            .iter()
            .rev()
            .scan(1usize, |run, &d| {
                let stride = *run;
                *run *= d;
                Some(stride)
            })
            .collect::<Vec<_>>();
        strides.reverse();
        strides
    }

    /// Resolve a requested shape holding at most one `-1`, which stands for
    /// whatever size makes the total come out at `elem_count`.
    pub fn infer(request: &[isize], elem_count: usize) -> Result<Shape> {
        let mut hole = None;
        let mut dims = Vec::with_capacity(request.len());
        for (i, &d) in request.iter().enumerate() {
            match d {
                -1 if hole.is_none() => {
                    hole = Some(i);
                    dims.push(1);
                }
                -1 => return Err(Error::msg(format!("view {request:?}: more than one -1"))),
                d if d < 0 => return Err(Error::msg(format!("view {request:?}: bad dim {d}"))),
                d => dims.push(d as usize),
            }
        }

        if let Some(i) = hole {
            let known: usize = dims.iter().product();
            if known == 0 || elem_count % known != 0 {
                return Err(Error::msg(format!(
                    "view {request:?} cannot hold {elem_count} elements"
                )));
            }
            dims[i] = elem_count / known;
        }

        let shape = Shape(dims);
        if shape.elem_count() != elem_count {
            return Err(Error::ReshapeElementMismatch {
                src: elem_count,
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Ok(shape)
    }

    /// NumPy broadcasting of two shapes: right-aligned, missing dims count as
    /// 1, and each pair must be equal or contain a 1.
    ///
    /// `[3, 4]` with `[4]` is `[3, 4]`; `[2, 1]` with `[1, 3]` is `[2, 3]`.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let rank = lhs.rank().max(rhs.rank());
        let padded = |s: &Shape| {
            std::iter::repeat(1)
                .take(rank - s.rank())
                .chain(s.0.iter().copied())
                .collect::<Vec<_>>()
        };
        let out = padded(lhs)
            .into_iter()
            .zip(padded(rhs))
            .map(|(l, r)| match (l, r) {
                (l, r) if l == r || r == 1 => Ok(l),
                (1, r) => Ok(r),
                _ => Err(Error::msg(format!(
                    "shapes {lhs} and {rhs} do not broadcast ({l} against {r})"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Shape(out))
    }

    /// True if broadcasting against `target` leaves `target` unchanged.
    pub fn is_broadcastable_to(&self, target: &Shape) -> bool {
        Shape::broadcast_shape(self, target).is_ok_and(|s| &s == target)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self.0.iter().map(usize::to_string).collect::<Vec<_>>();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(Vec::new())
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

macro_rules! shape_from_tuple {
    ($($d:ident),+) => {
        impl From<($(shape_from_tuple!(@usize $d),)+)> for Shape {
            fn from(($($d,)+): ($(shape_from_tuple!(@usize $d),)+)) -> Self {
                Shape(vec![$($d),+])
            }
        }
    };
    (@usize $d:ident) => {
        usize
    };
}

shape_from_tuple!(d0);
shape_from_tuple!(d0, d1);
shape_from_tuple!(d0, d1, d2);
shape_from_tuple!(d0, d1, d2, d3);

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(Shape::from((2, 3, 4)).stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(Shape::from((5, 1)).stride_contiguous(), vec![1, 1]);
        assert!(Shape::from(()).stride_contiguous().is_empty());
    }

    #[test]
    fn test_elem_count() {
        assert_eq!(Shape::from(()).elem_count(), 1);
        assert_eq!(Shape::from((2, 3, 4)).elem_count(), 24);
        assert_eq!(Shape::from((0, 3)).elem_count(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from((3, 4)).to_string(), "[3, 4]");
        assert_eq!(Shape::from(()).to_string(), "[]");
    }

    #[test]
    fn test_broadcast_shape() {
        let s = Shape::broadcast_shape(&Shape::from((4, 1, 1)), &Shape::from((4, 4))).unwrap();
        assert_eq!(s.dims(), &[4, 4, 4]);
        let s = Shape::broadcast_shape(&Shape::from((2, 1)), &Shape::from((1, 3))).unwrap();
        assert_eq!(s.dims(), &[2, 3]);
        assert!(Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).is_err());
    }

    #[test]
    fn test_metadata_fits_value() {
        let value = Shape::from((4, 4));
        assert!(Shape::from((4, 1)).is_broadcastable_to(&value));
        assert!(Shape::from(()).is_broadcastable_to(&value));
        assert!(!Shape::from((4, 4, 1)).is_broadcastable_to(&value));
        assert!(!Shape::from((2, 1)).is_broadcastable_to(&value));
    }

    #[test]
    fn test_infer() {
        assert_eq!(Shape::infer(&[-1], 16).unwrap().dims(), &[16]);
        assert_eq!(Shape::infer(&[2, -1], 16).unwrap().dims(), &[2, 8]);
        assert_eq!(Shape::infer(&[16, -1], 16).unwrap().dims(), &[16, 1]);
        assert_eq!(Shape::infer(&[4, 4], 16).unwrap().dims(), &[4, 4]);
        assert!(Shape::infer(&[3, -1], 16).is_err());
        assert!(Shape::infer(&[-1, -1], 16).is_err());
        assert!(Shape::infer(&[5, 2], 16).is_err());
        assert!(Shape::infer(&[0, -1], 16).is_err());
    }
}
