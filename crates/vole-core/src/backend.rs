use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — where tensor data lives and how kernels run on it
//
// Tensor<B> is generic over this trait. A backend owns a storage type and
// implements a small kernel set over (storage, layout) pairs; every higher
// level operation, quantization included, is a composition of these.
//
// Kernels never mutate their inputs. Layouts arrive already broadcast or
// permuted, so a kernel only has to walk strided indices.

/// A compute device handle.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> String;
}

/// A flat buffer of elements of a single dtype.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    fn dtype(&self) -> DType;

    /// Number of elements in the buffer (not in any particular view of it).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise operations of two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        }
    }
}

/// Element-wise operations of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    /// Nearest integer, ties to even.
    Round,
}

impl UnaryOp {
    pub fn apply(&self, v: f64) -> f64 {
        match self {
            UnaryOp::Neg => -v,
            UnaryOp::Abs => v.abs(),
            UnaryOp::Relu => v.max(0.0),
            UnaryOp::Round => v.round_ties_even(),
        }
    }
}

/// Reductions over one dim or the whole tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    /// Neutral starting value of the accumulator.
    pub fn identity(&self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    pub fn combine(&self, acc: f64, v: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + v,
            ReduceOp::Max => acc.max(v),
            ReduceOp::Min => acc.min(v),
        }
    }
}

/// Kernel set every backend provides.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    // Allocation

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Buffer holding `data`, each value rounded into `dtype`.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Samples of U[0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Samples of N(0, 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise kernels

    /// `lhs_layout` and `rhs_layout` describe the same (broadcast) shape.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// `input * mul + add`
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Saturate into `[min, max]`; NaN bounds or `min > max` are errors.
    fn clamp(input: &Self::Storage, layout: &Layout, min: f64, max: f64) -> Result<Self::Storage>;

    /// Reduce over `dims`, or over everything when `dims` is empty.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    /// `[.., m, k] @ [.., k, n]` with broadcast batch dims.
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    // Data movement

    /// Materialize a view into a fresh row-major buffer.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Read a view out in row-major order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Join views along `dim`; `out_shape` has already been checked.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Convert to another dtype. Defaults to a round trip through the host.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        Self::from_f64_slice(&Self::to_f64_vec(input, layout)?, dtype, device)
    }
}
