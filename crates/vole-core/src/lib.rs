//! # vole-core
//!
//! Core tensor primitives, types and backend traits for vole.
//!
//! This crate provides:
//! - [`Tensor`] — immutable n-dimensional array, generic over a backend
//! - [`Shape`] / [`Layout`] — shape, strides, offset and broadcasting
//! - [`DType`] — floating data types (F16, BF16, F32, F64)
//! - [`Backend`] trait — abstraction over compute devices
//! - [`Error`] / [`Result`] — the error type shared by every vole crate
//!
//! There is no autograd here: quantized tensors are produced and combined
//! as plain values.

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::Tensor;
