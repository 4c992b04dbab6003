//! # Vole
//!
//! Quantized tensors on a small CPU tensor runtime.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//!
//! # fn main() -> vole::Result<()> {
//! let x = CpuTensor::rand((4, 4), DType::F32, &CpuDevice)?;
//! let qt = Quantizer::new(QuantConfig::int8())?.quantize(&x)?;
//! assert!(qt.is_valid());
//! let y = (&qt + &qt)?;
//! assert_eq!(y.bit_width(), 9);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, Shape, DType, Layout, Backend trait, Error |
//! | `vole-cpu` | CPU backend with rayon matmul |
//! | `vole-quant` | QuantConfig, Quantizer, QuantTensor, generic op dispatch |
//! | `vole-nn` | Module trait, QuantIdentity, QuantReLU |

/// Re-export core types.
pub use vole_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    DType, Error, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export CPU backend.
pub use vole_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Quantized tensors, quantizers and generic dispatch.
pub mod quant {
    pub use vole_quant::*;
}

/// Re-export quantizing modules.
pub mod nn {
    pub use vole_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{Module, QuantIdentity, QuantModule, QuantReLU};
    pub use crate::quant::ops;
    pub use crate::quant::{
        Operand, QuantConfig, QuantGranularity, QuantMode, QuantTensor, Quantizer, RangeStat,
        ScalingStats,
    };
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, Error, Result, Shape, Tensor};
}
