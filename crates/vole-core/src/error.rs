use crate::dtype::DType;
use crate::shape::Shape;

// Error — the one error type of the workspace
//
// Tensor failures (shapes, dtypes, indices) and quantization failures (bad
// configs, metadata that cannot be combined) share an enum so that a
// QuantTensor op can `?` straight through the tensor calls it makes.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Tensor runtime
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("expected a tensor of rank {expected}, got rank {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("dim {dim} out of range for a rank {rank} tensor")]
    DimOutOfRange { dim: usize, rank: usize },

    #[error("cannot narrow dim {dim} of size {dim_size} to {start}..{start}+{len}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    #[error("tensor of shape {shape} is not a scalar")]
    NotAScalar { shape: Shape },

    /// Data handed to a constructor does not fill the requested shape.
    #[error("shape {shape} holds {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("matmul of [{m}x{k1}] by [{k2}x{n}]: inner dims differ")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("cannot view {src} elements as {dst_shape} ({dst} elements)")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    // Quantization
    /// Malformed config, or one that does not fit its input (per-channel
    /// shape rank, channel count, permutation).
    #[error("invalid quantization config: {0}")]
    InvalidConfig(String),

    /// Scales of two quantized operands differ and cannot be averaged.
    #[error("scaling factors are different: {lhs} vs {rhs}")]
    ScaleMismatch { lhs: String, rhs: String },

    #[error("{op}: zero points of quantized operands are non-zero, not supported")]
    NonZeroZeroPoint { op: &'static str },

    /// Metadata does not fit the value it describes.
    #[error("invalid quant tensor: {0}")]
    InvalidQuantTensor(String),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn config(s: impl Into<String>) -> Self {
        Error::InvalidConfig(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::config("bit width 0 out of range");
        assert_eq!(
            err.to_string(),
            "invalid quantization config: bit width 0 out of range"
        );
    }

    #[test]
    fn test_tensor_error_display() {
        let err = Error::ReshapeElementMismatch {
            src: 6,
            dst: 8,
            dst_shape: Shape::from((2, 4)),
        };
        assert_eq!(err.to_string(), "cannot view 6 elements as [2, 4] (8 elements)");
        let err = Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::BF16,
        };
        assert_eq!(err.to_string(), "dtype mismatch: expected f32, got bf16");
    }
}
