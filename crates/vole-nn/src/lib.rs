//! # vole-nn
//!
//! Quantizing front-end modules for vole.
//!
//! Provides layers following the [`Module`] trait pattern (similar to
//! PyTorch's `nn.Module`):
//!
//! 1. **Module trait**: every layer implements `forward()`
//! 2. **QuantModule trait**: layers that can hand back their [`QuantTensor`](vole_quant::QuantTensor)
//! 3. **QuantIdentity**: quantize the input, calibrating running statistics in training mode
//! 4. **QuantReLU**: ReLU followed by an unsigned quantizer
//!
//! Modules are generic over `Backend` (like `Tensor<B>`).

pub mod module;
pub mod quant_identity;
pub mod quant_relu;

pub use module::{Module, QuantModule};
pub use quant_identity::QuantIdentity;
pub use quant_relu::QuantReLU;
