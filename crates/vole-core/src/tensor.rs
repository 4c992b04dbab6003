use std::sync::Arc;

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — immutable n-dimensional float array
//
// A Tensor is a cheap handle: an Arc around (storage, layout, dtype, device),
// with the storage itself behind a second Arc so that views can share it.
//
//   views        transpose, permute, narrow, squeeze, unsqueeze, broadcast_as
//                share storage and differ only in Layout
//   reshapes     reshape, view, flatten; these copy first when the input is
//                not contiguous
//   kernels      everything else allocates a contiguous result
//
// Nothing is mutated in place and nothing records history: there is no
// gradient tracking. Binary ops broadcast both operands to a common shape
// before calling the backend.

struct TensorInner<B: Backend> {
    storage: Arc<B::Storage>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

/// An n-dimensional array on backend `B`.
///
/// # Example
/// ```ignore
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
/// let b = a.transpose(0, 1)?.mul_scalar(2.0)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", self.shape())
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device)
            .finish()
    }
}

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, rhs: &Self) -> Result<Self> {
                self.broadcast_binary(rhs, BinaryOp::$op)
            }
        )*
    };
}

macro_rules! unary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self) -> Result<Self> {
                let out = B::unary_op(UnaryOp::$op, self.storage(), self.layout())?;
                Ok(self.fresh(out, self.shape().clone()))
            }
        )*
    };
}

macro_rules! reductions {
    ($($all:ident, $along:ident => $op:ident;)*) => {
        $(
            #[doc = concat!("`", stringify!($op), "` over every element, as a rank-0 tensor.")]
            pub fn $all(&self) -> Result<Self> {
                self.reduce(ReduceOp::$op, None, false)
            }

            #[doc = concat!("`", stringify!($op), "` along `dim`.")]
            pub fn $along(&self, dim: usize, keep_dim: bool) -> Result<Self> {
                self.reduce(ReduceOp::$op, Some(dim), keep_dim)
            }
        )*
    };
}

impl<B: Backend> Tensor<B> {
    fn new(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(storage),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// Same storage, different layout.
    fn with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    /// A kernel result: contiguous, same dtype and device as `self`.
    fn fresh(&self, storage: B::Storage, shape: Shape) -> Self {
        Self::new(
            storage,
            Layout::contiguous(shape),
            self.inner.dtype,
            self.inner.device.clone(),
        )
    }

    fn alloc(
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        make: impl FnOnce(&Shape) -> Result<B::Storage>,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = make(&shape)?;
        Ok(Self::new(storage, Layout::contiguous(shape), dtype, device.clone()))
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn storage(&self) -> &B::Storage {
        &self.inner.storage
    }

    // Construction

    pub fn full(shape: impl Into<Shape>, val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::alloc(shape, dtype, device, |s| B::full(s, val, dtype, device))
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 0.0, dtype, device)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Rank-0 tensor.
    pub fn scalar(val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full((), val, dtype, device)
    }

    /// `data` in row-major order, rounded into `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Self::alloc(shape, dtype, device, |_| B::from_f64_slice(data, dtype, device))
    }

    /// Uniform samples in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::alloc(shape, dtype, device, |s| B::rand_uniform(s, dtype, device))
    }

    /// Standard normal samples.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::alloc(shape, dtype, device, |s| B::rand_normal(s, dtype, device))
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape(), other.dtype(), other.device())
    }

    // Views

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout().transpose(dim0, dim1)?))
    }

    /// `permute(&[2, 0, 1])` maps [A, B, C] to [C, A, B].
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        Ok(self.with_layout(self.layout().permute(dims)?))
    }

    /// Elements `start..start + len` of `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(self.with_layout(self.layout().narrow(dim, start, len)?))
    }

    /// Stride-0 expansion to `target`.
    pub fn broadcast_as(&self, target: impl Into<Shape>) -> Result<Self> {
        Ok(self.with_layout(self.layout().broadcast_to(&target.into())?))
    }

    /// Insert a size-1 dim before position `dim` (`dim == rank` appends).
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.layout().strides().to_vec();
        // never stepped along, so any stride works
        let stride = strides.get(dim).copied().unwrap_or(1);
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        Ok(self.with_layout(Layout::new(Shape::new(dims), strides, self.layout().offset())))
    }

    /// Positions of the size-1 dims.
    pub fn unit_dims(&self) -> Vec<usize> {
        (0..self.rank()).filter(|&i| self.dims()[i] == 1).collect()
    }

    /// Drop every size-1 dim: [1, 3, 1, 4] becomes [3, 4].
    pub fn squeeze_all(&self) -> Self {
        self.without_dims(&self.unit_dims())
    }

    /// Drop `dim`, which must have size 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        self.squeeze_dims(&[dim])
    }

    /// Drop each of `dims`; all must have size 1.
    pub fn squeeze_dims(&self, dims: &[usize]) -> Result<Self> {
        let rank = self.rank();
        if let Some(&dim) = dims.iter().find(|&&d| d >= rank) {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if let Some(&dim) = dims.iter().find(|&&d| self.dims()[d] != 1) {
            return Err(Error::msg(format!(
                "squeeze: dim {dim} of shape {} is not 1",
                self.shape()
            )));
        }
        Ok(self.without_dims(dims))
    }

    fn without_dims(&self, dropped: &[usize]) -> Self {
        let (dims, strides): (Vec<usize>, Vec<usize>) = self
            .dims()
            .iter()
            .zip(self.layout().strides())
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, (&d, &s))| (d, s))
            .unzip();
        self.with_layout(Layout::new(Shape::new(dims), strides, self.layout().offset()))
    }

    // Reshapes

    /// A row-major copy, or `self` when already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = B::to_contiguous(self.storage(), self.layout())?;
        Ok(self.fresh(storage, self.shape().clone()))
    }

    /// Same elements in row-major order, new shape.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Ok(self.contiguous()?.with_layout(Layout::contiguous(shape)))
    }

    /// `reshape` with at most one `-1` inferred: `view(&[2, -1])` on [4, 4] is [2, 8].
    pub fn view(&self, shape: &[isize]) -> Result<Self> {
        self.reshape(Shape::infer(shape, self.elem_count())?)
    }

    /// Merge dims `start..=end` into one.
    pub fn flatten(&self, start: usize, end: usize) -> Result<Self> {
        let rank = self.rank();
        if rank == 0 {
            return self.reshape(1);
        }
        if start > end || end >= rank {
            return Err(Error::DimOutOfRange {
                dim: start.max(end),
                rank,
            });
        }
        let d = self.dims();
        let merged: usize = d[start..=end].iter().product();
        let dims: Vec<usize> = d[..start]
            .iter()
            .copied()
            .chain(std::iter::once(merged))
            .chain(d[end + 1..].iter().copied())
            .collect();
        self.reshape(dims)
    }

    // Element-wise

    fn broadcast_binary(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let out = B::binary_op(
            op,
            self.storage(),
            &self.layout().broadcast_to(&shape)?,
            rhs.storage(),
            &rhs.layout().broadcast_to(&shape)?,
        )?;
        Ok(self.fresh(out, shape))
    }

    binary_ops! {
        add => Add;
        sub => Sub;
        mul => Mul;
        /// IEEE division: `x / 0` is a signed infinity, `0 / 0` is NaN.
        div => Div;
        maximum => Maximum;
        minimum => Minimum;
    }

    unary_ops! {
        neg => Neg;
        abs => Abs;
        relu => Relu;
        /// Nearest integer, ties to even.
        round => Round;
    }

    /// `self * mul + add`
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let out = B::affine(self.storage(), self.layout(), mul, add)?;
        Ok(self.fresh(out, self.shape().clone()))
    }

    pub fn add_scalar(&self, value: f64) -> Result<Self> {
        self.affine(1.0, value)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Self> {
        self.affine(value, 0.0)
    }

    /// Saturate into `[min, max]`.
    pub fn clamp(&self, min: f64, max: f64) -> Result<Self> {
        let out = B::clamp(self.storage(), self.layout(), min, max)?;
        Ok(self.fresh(out, self.shape().clone()))
    }

    // Reductions

    fn reduce(&self, op: ReduceOp, dim: Option<usize>, keep_dim: bool) -> Result<Self> {
        let dims: Vec<usize> = dim.into_iter().collect();
        if let Some(d) = dim {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        if self.elem_count() == 0 && op != ReduceOp::Sum {
            return Err(Error::msg(format!(
                "{op:?} of an empty tensor of shape {}",
                self.shape()
            )));
        }
        let out = B::reduce_op(op, self.storage(), self.layout(), &dims, keep_dim)?;
        let shape = match dim {
            None => Shape::from(()),
            Some(d) if keep_dim => {
                let mut kept = self.dims().to_vec();
                kept[d] = 1;
                Shape::new(kept)
            }
            Some(d) => {
                let mut kept = self.dims().to_vec();
                kept.remove(d);
                Shape::new(kept)
            }
        };
        Ok(self.fresh(out, shape))
    }

    reductions! {
        sum_all, sum => Sum;
        max_all, max => Max;
        min_all, min => Min;
    }

    // Joining and products

    /// Concatenate along `dim`; all other dims must agree.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: no tensors given"))?;
        if tensors.len() == 1 {
            return Ok(first.clone());
        }
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        for t in &tensors[1..] {
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            let compatible = t.rank() == rank
                && (0..rank).all(|d| d == dim || t.dims()[d] == first.dims()[d]);
            if !compatible {
                return Err(Error::msg(format!(
                    "cat along dim {dim}: shape {} does not match {}",
                    t.shape(),
                    first.shape()
                )));
            }
        }

        let mut dims = first.dims().to_vec();
        dims[dim] = tensors.iter().map(|t| t.dims()[dim]).sum();
        let shape = Shape::new(dims);
        let inputs: Vec<(&B::Storage, &Layout)> =
            tensors.iter().map(|t| (t.storage(), t.layout())).collect();
        let storage = B::cat(&inputs, &shape, dim)?;
        Ok(first.fresh(storage, shape))
    }

    /// `[.., m, k] @ [.., k, n] -> [.., m, n]`; leading batch dims broadcast.
    /// Rank-1 operands follow NumPy: `[k] @ [k]` is a scalar, `[k] @ [k, n]`
    /// is `[n]` and `[m, k] @ [k]` is `[m]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        match (self.rank(), rhs.rank()) {
            (0, _) | (_, 0) => {
                return Err(Error::RankMismatch {
                    expected: 1,
                    got: 0,
                })
            }
            // A vector on the left is a one-row matrix, on the right a
            // one-column matrix; the added dim is dropped from the result.
            (1, r) => {
                let out = self.unsqueeze(0)?.matmul(rhs)?;
                let dim = if r == 1 { out.rank() - 1 } else { out.rank() - 2 };
                return out.squeeze(dim);
            }
            (_, 1) => {
                let out = self.matmul(&rhs.unsqueeze(1)?)?;
                return out.squeeze(out.rank() - 1);
            }
            _ => {}
        }
        let (l, r) = (self.dims(), rhs.dims());
        let (m, k1) = (l[l.len() - 2], l[l.len() - 1]);
        let (k2, n) = (r[r.len() - 2], r[r.len() - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch = Shape::broadcast_shape(
            &Shape::from(&l[..l.len() - 2]),
            &Shape::from(&r[..r.len() - 2]),
        )?;
        let out = B::matmul(self.storage(), self.layout(), rhs.storage(), rhs.layout())?;
        let mut dims = batch.dims().to_vec();
        dims.extend([m, n]);
        Ok(self.fresh(out, Shape::new(dims)))
    }

    // Host access

    /// Elements in row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(self.storage(), self.layout())
    }

    /// The only element of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        match self.to_f64_vec()?.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::NotAScalar {
                shape: self.shape().clone(),
            }),
        }
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = B::cast(self.storage(), self.layout(), dtype, self.device())?;
        Ok(Self::new(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
        ))
    }

    /// `|a - b| <= atol + rtol * |b|` everywhere, after broadcasting.
    ///
    /// Infinities match only an infinity of the same sign; NaN matches nothing.
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> Result<bool> {
        let shape = Shape::broadcast_shape(self.shape(), other.shape())?;
        let a = self.broadcast_as(&shape)?.to_f64_vec()?;
        let b = other.broadcast_as(&shape)?.to_f64_vec()?;
        Ok(a.iter().zip(&b).all(|(&x, &y)| {
            if x.is_infinite() || y.is_infinite() {
                x == y
            } else {
                (x - y).abs() <= atol + rtol * y.abs()
            }
        }))
    }
}
