//! # vole-quant
//!
//! Quantized tensors for vole.
//!
//! - [`QuantConfig`] — bit width, signedness, symmetric/asymmetric, per-tensor
//!   or per-channel scaling; serde (de)serializable
//! - [`Quantizer`] — the quantizing constructor: float tensor → [`QuantTensor`]
//! - [`QuantTensor`] — dequantized value plus scale, zero point, bit width and
//!   signedness, with arithmetic and shape transforms that keep the metadata
//!   consistent
//! - [`ops`] — generic dispatch over [`Operand`]s, the only entry point for
//!   quantized matmul

pub mod config;
pub mod ops;
pub mod quant_tensor;
pub mod quantizer;
pub mod scaling;

pub use config::{max_int, min_int, QuantConfig, QuantGranularity, QuantMode, ScalingStats};
pub use ops::Operand;
pub use quant_tensor::{QuantTensor, BFLOAT16_IS_VALID_ATOL, IS_VALID_ATOL};
pub use quantizer::Quantizer;
pub use scaling::RangeStat;
