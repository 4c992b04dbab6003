// QuantReLU — ReLU followed by unsigned quantization
//
// The output of a ReLU is non-negative, so the quantizer behind it must be
// unsigned; a signed config would waste the sign bit and is rejected.

use vole_core::backend::Backend;
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;
use vole_quant::{QuantConfig, QuantTensor};

use crate::module::{Module, QuantModule};
use crate::quant_identity::QuantIdentity;

/// ReLU activation with a quantized output.
pub struct QuantReLU<B: Backend> {
    quant: QuantIdentity<B>,
}

impl<B: Backend> QuantReLU<B> {
    /// Create a QuantReLU; `config` must be unsigned.
    pub fn new(config: QuantConfig) -> Result<Self> {
        if config.signed {
            return Err(Error::config(
                "QuantReLU requires an unsigned quantization config",
            ));
        }
        Ok(QuantReLU {
            quant: QuantIdentity::new(config)?,
        })
    }

    /// 8-bit unsigned per-tensor output.
    pub fn uint8() -> Result<Self> {
        Self::new(QuantConfig::uint8())
    }

    /// The quantizer applied after the activation.
    pub fn output_quant(&self) -> &QuantIdentity<B> {
        &self.quant
    }
}

impl<B: Backend> QuantModule<B> for QuantReLU<B> {
    fn quant_forward(&self, x: &Tensor<B>) -> Result<QuantTensor<B>> {
        self.quant.quant_forward(&x.relu()?)
    }
}

impl<B: Backend> Module<B> for QuantReLU<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        Ok(self.quant_forward(x)?.detach_metadata())
    }

    fn set_training(&self, training: bool) {
        self.quant.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.quant.is_training()
    }
}
