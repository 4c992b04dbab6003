// Module trait — The interface every quantizing layer implements
//
// A module maps a float tensor to a float tensor through forward(). Layers
// that quantize also implement QuantModule, whose quant_forward() returns
// the QuantTensor itself instead of dropping its metadata.
//
// GENERIC OVER BACKEND:
//
// Modules are generic over B: Backend, like Tensor<B>; the tensors they
// produce live on whatever backend B is.
//
// TRAIN / EVAL:
//
// Modules that calibrate (collect running statistics) behave differently
// in training and evaluation. The mode lives in a Cell so `&self` suffices.

use vole_core::backend::Backend;
use vole_core::error::Result;
use vole_core::tensor::Tensor;
use vole_quant::QuantTensor;

/// The fundamental trait for all layers.
///
/// # Example
/// ```ignore
/// let quant = QuantIdentity::<CpuBackend>::new(QuantConfig::int8())?;
/// let y = quant.forward(&x)?; // dequantized float tensor
/// ```
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// Set training or evaluation mode.
    ///
    /// Override in modules that behave differently in train vs eval.
    /// Default is a no-op.
    fn set_training(&self, _training: bool) {}

    /// Whether the module is in training mode (default: true).
    fn is_training(&self) -> bool {
        true
    }

    /// Convenience: set training mode.
    fn train(&self) {
        self.set_training(true);
    }

    /// Convenience: set evaluation mode.
    fn eval(&self) {
        self.set_training(false);
    }
}

/// A module whose output is quantized.
///
/// `forward()` of such a module returns `quant_forward()?.value()`.
pub trait QuantModule<B: Backend>: Module<B> {
    /// Compute the quantized output, metadata included.
    fn quant_forward(&self, x: &Tensor<B>) -> Result<QuantTensor<B>>;
}
