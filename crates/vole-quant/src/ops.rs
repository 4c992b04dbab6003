// Generic op dispatch over raw and quantized operands
//
// Callers that hold "either a float tensor or a quantized one" wrap it in an
// Operand and go through the functions here. When both operands are
// quantized the quantized-aware path runs and the result keeps metadata;
// as soon as either side is raw, both are unpacked to their float values
// and the plain tensor op runs, giving a raw result.
//
// This is also the only way to multiply two quantized tensors as matrices:
// the metadata rules of an inner-product reduction differ from the
// element-wise ones, so QuantTensor does not expose matmul as a method.

use vole_core::{Backend, DType, Result, Shape, Tensor};

use crate::quant_tensor::QuantTensor;

/// A float tensor or a quantized one.
#[derive(Debug, Clone)]
pub enum Operand<B: Backend> {
    Raw(Tensor<B>),
    Quant(QuantTensor<B>),
}

impl<B: Backend> Operand<B> {
    /// The float value, dequantized for quantized operands.
    pub fn value(&self) -> &Tensor<B> {
        match self {
            Operand::Raw(t) => t,
            Operand::Quant(q) => q.value(),
        }
    }

    pub fn is_quant(&self) -> bool {
        matches!(self, Operand::Quant(_))
    }

    pub fn shape(&self) -> &Shape {
        self.value().shape()
    }

    pub fn dtype(&self) -> DType {
        self.value().dtype()
    }

    /// The quantized tensor, if this operand is one.
    pub fn as_quant(&self) -> Option<&QuantTensor<B>> {
        match self {
            Operand::Quant(q) => Some(q),
            Operand::Raw(_) => None,
        }
    }

    /// Consume the operand and return its float value.
    pub fn into_value(self) -> Tensor<B> {
        match self {
            Operand::Raw(t) => t,
            Operand::Quant(q) => q.detach_metadata(),
        }
    }
}

impl<B: Backend> From<Tensor<B>> for Operand<B> {
    fn from(t: Tensor<B>) -> Self {
        Operand::Raw(t)
    }
}

impl<B: Backend> From<QuantTensor<B>> for Operand<B> {
    fn from(q: QuantTensor<B>) -> Self {
        Operand::Quant(q)
    }
}

fn dispatch<B: Backend>(
    name: &str,
    lhs: &Operand<B>,
    rhs: &Operand<B>,
    quant: impl FnOnce(&QuantTensor<B>, &QuantTensor<B>) -> Result<QuantTensor<B>>,
    raw: impl FnOnce(&Tensor<B>, &Tensor<B>) -> Result<Tensor<B>>,
) -> Result<Operand<B>> {
    match (lhs, rhs) {
        (Operand::Quant(a), Operand::Quant(b)) => Ok(Operand::Quant(quant(a, b)?)),
        _ => {
            log::trace!(
                "{name}: raw operand present, computing on float values {} and {}",
                lhs.shape(),
                rhs.shape()
            );
            Ok(Operand::Raw(raw(lhs.value(), rhs.value())?))
        }
    }
}

/// `lhs + rhs`
pub fn add<B: Backend>(lhs: &Operand<B>, rhs: &Operand<B>) -> Result<Operand<B>> {
    dispatch("add", lhs, rhs, QuantTensor::add, Tensor::add)
}

/// `lhs - rhs`
pub fn sub<B: Backend>(lhs: &Operand<B>, rhs: &Operand<B>) -> Result<Operand<B>> {
    dispatch("sub", lhs, rhs, QuantTensor::sub, Tensor::sub)
}

/// `lhs * rhs`, element-wise.
pub fn mul<B: Backend>(lhs: &Operand<B>, rhs: &Operand<B>) -> Result<Operand<B>> {
    dispatch("mul", lhs, rhs, QuantTensor::mul, Tensor::mul)
}

/// `lhs / rhs`, element-wise. Zero divisors give infinities.
pub fn div<B: Backend>(lhs: &Operand<B>, rhs: &Operand<B>) -> Result<Operand<B>> {
    dispatch("div", lhs, rhs, QuantTensor::div, Tensor::div)
}

/// Matrix product `lhs @ rhs`.
pub fn matmul<B: Backend>(lhs: &Operand<B>, rhs: &Operand<B>) -> Result<Operand<B>> {
    dispatch("matmul", lhs, rhs, QuantTensor::matmul, Tensor::matmul)
}
