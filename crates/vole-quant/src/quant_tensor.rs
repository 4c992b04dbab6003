// QuantTensor — a float tensor carrying its quantization metadata
//
// The value is stored dequantized ("fake quantization"): the integer codes
// only exist implicitly as
//
//   code  = value / scale + zero_point        (integral when valid)
//   value = (code - zero_point) * scale
//
// METADATA SHAPES:
//
//   scale and zero_point are either rank 0 (per-tensor) or have the rank of
//   the value and broadcast against it (per-channel, e.g. [C, 1, 1] for a
//   [C, H, W] value). Keeping the rank equal is what lets shape transforms
//   be replayed on the metadata: transposing a [C, 1] scale together with
//   its [C, K] value keeps them aligned.
//
// ARITHMETIC:
//
//   Every operation computes the value as the plain float op on the operand
//   values and derives new metadata from the operands' metadata. Nothing is
//   requantized, so the result matches the float computation exactly and
//   the derived metadata is what makes it a valid quantized tensor again.

use std::fmt;

use vole_core::{Backend, DType, Error, Result, Shape, Tensor};

use crate::config::{max_int, min_int};

/// Tolerance when checking that `value / scale + zero_point` is integral.
pub const IS_VALID_ATOL: f64 = 2e-1;
/// Looser tolerance for bf16 values, whose 8-bit mantissa cannot hold the
/// codes of wider quantizers exactly.
pub const BFLOAT16_IS_VALID_ATOL: f64 = 0.5;

const ALLCLOSE_RTOL: f64 = 1e-5;
const ALLCLOSE_ATOL: f64 = 1e-8;

/// A dequantized tensor together with the scale, zero point, bit width and
/// signedness of the integer grid it lies on.
#[derive(Debug, Clone)]
pub struct QuantTensor<B: Backend> {
    value: Tensor<B>,
    scale: Tensor<B>,
    zero_point: Tensor<B>,
    bit_width: u32,
    signed: bool,
    training: bool,
}

impl<B: Backend> QuantTensor<B> {
    /// Assemble a quantized tensor from its parts.
    ///
    /// `scale` and `zero_point` must be rank 0 or have the rank of `value`
    /// and broadcast to it, in the dtype of `value`. The value is not
    /// required to lie on the grid; see [`QuantTensor::is_valid`].
    pub fn new(
        value: Tensor<B>,
        scale: Tensor<B>,
        zero_point: Tensor<B>,
        bit_width: u32,
        signed: bool,
        training: bool,
    ) -> Result<Self> {
        if bit_width == 0 {
            return Err(Error::InvalidQuantTensor("bit width must be positive".into()));
        }
        for (name, meta) in [("scale", &scale), ("zero_point", &zero_point)] {
            if meta.dtype() != value.dtype() {
                return Err(Error::InvalidQuantTensor(format!(
                    "{name} dtype {} differs from value dtype {}",
                    meta.dtype(),
                    value.dtype()
                )));
            }
            if meta.rank() != 0 && meta.rank() != value.rank() {
                return Err(Error::InvalidQuantTensor(format!(
                    "{name} of shape {} must be rank 0 or match value rank {}",
                    meta.shape(),
                    value.rank()
                )));
            }
            if !meta.shape().is_broadcastable_to(value.shape()) {
                return Err(Error::InvalidQuantTensor(format!(
                    "{name} of shape {} does not broadcast to value shape {}",
                    meta.shape(),
                    value.shape()
                )));
            }
        }
        Ok(Self {
            value,
            scale,
            zero_point,
            bit_width,
            signed,
            training,
        })
    }

    // Accessors

    /// The dequantized value.
    pub fn value(&self) -> &Tensor<B> {
        &self.value
    }

    pub fn scale(&self) -> &Tensor<B> {
        &self.scale
    }

    pub fn zero_point(&self) -> &Tensor<B> {
        &self.zero_point
    }

    pub fn bit_width(&self) -> u32 {
        self.bit_width
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn shape(&self) -> &Shape {
        self.value.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.value.dims()
    }

    pub fn rank(&self) -> usize {
        self.value.rank()
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn device(&self) -> &B::Device {
        self.value.device()
    }

    /// Drop the metadata and return the plain float value.
    pub fn detach_metadata(&self) -> Tensor<B> {
        self.value.clone()
    }

    /// Whether scale or zero point vary across elements.
    pub fn is_per_channel(&self) -> bool {
        self.scale.elem_count() > 1 || self.zero_point.elem_count() > 1
    }

    pub fn is_zero_zero_point(&self) -> Result<bool> {
        Ok(self
            .zero_point
            .to_f64_vec()?
            .iter()
            .all(|&z| z == 0.0))
    }

    /// Smallest integer code of this tensor's grid.
    pub fn min_int(&self) -> f64 {
        min_int(self.signed, false, self.bit_width)
    }

    /// Largest integer code of this tensor's grid.
    pub fn max_int(&self) -> f64 {
        max_int(self.signed, false, self.bit_width)
    }

    /// The integer codes `round(value / scale + zero_point)`, as floats.
    pub fn int(&self) -> Result<Tensor<B>> {
        self.value.div(&self.scale)?.add(&self.zero_point)?.round()
    }

    /// Whether the metadata is consistent with the value: every
    /// `value / scale + zero_point` is integral within tolerance and the
    /// resulting codes fit the bit width.
    pub fn is_valid(&self) -> bool {
        self.check_valid().unwrap_or(false)
    }

    fn check_valid(&self) -> Result<bool> {
        let atol = if self.dtype() == DType::BF16 {
            BFLOAT16_IS_VALID_ATOL
        } else {
            IS_VALID_ATOL
        };
        let (lo, hi) = (self.min_int(), self.max_int());
        let codes = self
            .value
            .div(&self.scale)?
            .add(&self.zero_point)?
            .to_f64_vec()?;
        Ok(codes.iter().all(|&c| {
            let rounded = c.round_ties_even();
            c.is_finite() && (c - rounded).abs() <= atol && rounded >= lo && rounded <= hi
        }))
    }

    /// Convert value and metadata to another dtype.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            value: self.value.to_dtype(dtype)?,
            scale: self.scale.to_dtype(dtype)?,
            zero_point: self.zero_point.to_dtype(dtype)?,
            ..self.clone()
        })
    }

    // Metadata checks

    fn check_scaling_factors_same(&self, other: &Self) -> Result<()> {
        if self.training || other.training {
            return Ok(());
        }
        if self
            .scale
            .allclose(&other.scale, ALLCLOSE_RTOL, ALLCLOSE_ATOL)?
        {
            Ok(())
        } else {
            Err(Error::ScaleMismatch {
                lhs: describe(&self.scale),
                rhs: describe(&other.scale),
            })
        }
    }

    fn check_zero_zero_points(&self, other: &Self, op: &'static str) -> Result<()> {
        if self.is_zero_zero_point()? && other.is_zero_zero_point()? {
            Ok(())
        } else {
            Err(Error::NonZeroZeroPoint { op })
        }
    }

    // Arithmetic

    /// Quantized addition. Scales must agree unless either operand is in
    /// training mode, in which case they are averaged.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_scaling_factors_same(other)?;
        let max_val = self.max_int() + other.max_int();
        let min_val = self.min_int() + other.min_int();
        Ok(Self {
            value: self.value.add(&other.value)?,
            scale: self.scale.add(&other.scale)?.mul_scalar(0.5)?,
            zero_point: self.zero_point.add(&other.zero_point)?,
            bit_width: range_bit_width(max_val - min_val),
            signed: self.signed || other.signed,
            training: self.training || other.training,
        })
    }

    /// Quantized subtraction; the result is always signed.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.check_scaling_factors_same(other)?;
        let max_val = self.max_int() - other.min_int();
        let min_val = self.min_int() - other.max_int();
        Ok(Self {
            value: self.value.sub(&other.value)?,
            scale: self.scale.add(&other.scale)?.mul_scalar(0.5)?,
            zero_point: self.zero_point.sub(&other.zero_point)?,
            bit_width: range_bit_width(max_val - min_val),
            signed: true,
            training: self.training || other.training,
        })
    }

    /// Quantized multiplication. Both zero points must be zero.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.check_zero_zero_points(other, "mul")?;
        let scale = self.scale.mul(&other.scale)?;
        Ok(Self {
            value: self.value.mul(&other.value)?,
            zero_point: Tensor::zeros_like(&scale)?,
            scale,
            bit_width: self.bit_width.saturating_add(other.bit_width),
            signed: self.signed || other.signed,
            training: self.training || other.training,
        })
    }

    /// Quantized division. Both zero points must be zero.
    ///
    /// Dividing by a zero value gives IEEE infinities, not an error. The
    /// quotient generally does not lie on the derived grid, so the result
    /// need not satisfy [`QuantTensor::is_valid`].
    pub fn div(&self, other: &Self) -> Result<Self> {
        self.check_zero_zero_points(other, "div")?;
        let scale = self.scale.div(&other.scale)?;
        Ok(Self {
            value: self.value.div(&other.value)?,
            zero_point: Tensor::zeros_like(&scale)?,
            scale,
            bit_width: self.bit_width.saturating_add(other.bit_width),
            signed: self.signed || other.signed,
            training: self.training || other.training,
        })
    }

    /// Matrix product of two quantized tensors.
    ///
    /// Zero points must be zero and each scale constant along the reduced
    /// dim (last for `self`, second to last for `other`). Only reachable
    /// through [`crate::ops::matmul`].
    pub(crate) fn matmul(&self, other: &Self) -> Result<Self> {
        // Vectors go through the matrix path with their metadata, as for
        // the float matmul.
        match (self.rank(), other.rank()) {
            (0, _) | (_, 0) => {
                return Err(Error::RankMismatch {
                    expected: 1,
                    got: 0,
                })
            }
            (1, r) => {
                let out = self.unsqueeze(0)?.matmul(other)?;
                let dim = if r == 1 { out.rank() - 1 } else { out.rank() - 2 };
                return out.squeeze_dim(dim);
            }
            (_, 1) => {
                let out = self.matmul(&other.unsqueeze(1)?)?;
                return out.squeeze_dim(out.rank() - 1);
            }
            _ => {}
        }
        self.check_zero_zero_points(other, "matmul")?;
        for (name, meta) in [("lhs scale", &self.scale), ("lhs zero point", &self.zero_point)] {
            if meta.rank() > 0 && meta.dims()[meta.rank() - 1] != 1 {
                return Err(Error::msg(format!(
                    "matmul: {name} of shape {} varies along the reduced dim",
                    meta.shape()
                )));
            }
        }
        for (name, meta) in [("rhs scale", &other.scale), ("rhs zero point", &other.zero_point)] {
            if meta.rank() > 1 && meta.dims()[meta.rank() - 2] != 1 {
                return Err(Error::msg(format!(
                    "matmul: {name} of shape {} varies along the reduced dim",
                    meta.shape()
                )));
            }
        }

        let value = self.value.matmul(&other.value)?;
        let k = self.dims()[self.rank() - 1];
        let scale = align_rank(&self.scale.mul(&other.scale)?, value.rank())?;
        Ok(Self {
            zero_point: Tensor::zeros_like(&scale)?,
            scale,
            value,
            bit_width: self
                .bit_width
                .saturating_add(other.bit_width)
                .saturating_add(ceil_log2(k)),
            signed: self.signed || other.signed,
            training: self.training || other.training,
        })
    }

    /// Negation: the grid is mirrored, so the result is signed.
    pub fn neg(&self) -> Result<Self> {
        Ok(Self {
            value: self.value.neg()?,
            zero_point: self.zero_point.neg()?,
            bit_width: if self.signed {
                self.bit_width
            } else {
                self.bit_width.saturating_add(1)
            },
            signed: true,
            ..self.clone()
        })
    }

    /// Absolute value. Signed inputs need a zero zero point and give an
    /// unsigned result one bit narrower.
    pub fn abs(&self) -> Result<Self> {
        if !self.signed {
            return Ok(self.clone());
        }
        if !self.is_zero_zero_point()? {
            return Err(Error::NonZeroZeroPoint { op: "abs" });
        }
        Ok(Self {
            value: self.value.abs()?,
            bit_width: self.bit_width.saturating_sub(1).max(1),
            signed: false,
            ..self.clone()
        })
    }

    // Shape transforms

    /// Apply a shape transform to the value and replay it on per-channel
    /// metadata; rank-0 metadata is left alone.
    fn map_shape(
        &self,
        value: Tensor<B>,
        f: impl Fn(&Tensor<B>) -> Result<Tensor<B>>,
    ) -> Result<Self> {
        let remap = |meta: &Tensor<B>| -> Result<Tensor<B>> {
            if meta.rank() == 0 {
                Ok(meta.clone())
            } else {
                f(meta)
            }
        };
        Ok(Self {
            scale: remap(&self.scale)?,
            zero_point: remap(&self.zero_point)?,
            value,
            ..self.clone()
        })
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let value = self.value.transpose(dim0, dim1)?;
        self.map_shape(value, |m| m.transpose(dim0, dim1))
    }

    /// Reorder all dimensions.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let value = self.value.permute(dims)?;
        self.map_shape(value, |m| m.permute(dims))
    }

    /// Remove every size-1 dimension.
    ///
    /// Per-channel metadata loses exactly the dims the value loses, so a
    /// [4, 1, 1, 1] scale on a [4, 1, 4, 1] value becomes [4, 1].
    pub fn squeeze(&self) -> Result<Self> {
        let dims = self.value.unit_dims();
        let value = self.value.squeeze_dims(&dims)?;
        self.map_shape(value, |m| m.squeeze_dims(&dims))
    }

    /// Remove one size-1 dimension.
    pub fn squeeze_dim(&self, dim: usize) -> Result<Self> {
        let value = self.value.squeeze(dim)?;
        self.map_shape(value, |m| m.squeeze(dim))
    }

    /// Insert a size-1 dimension.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let value = self.value.unsqueeze(dim)?;
        self.map_shape(value, |m| m.unsqueeze(dim))
    }

    /// Reshape, inferring at most one `-1` dimension.
    ///
    /// Per-tensor metadata passes through. Per-channel metadata has no
    /// general mapping through a reshape, so it is expanded to one entry per
    /// element and reshaped with the value.
    pub fn view(&self, shape: &[isize]) -> Result<Self> {
        let value = self.value.view(shape)?;
        self.with_reshaped_value(value)
    }

    /// Alias of [`QuantTensor::view`].
    pub fn reshape(&self, shape: &[isize]) -> Result<Self> {
        self.view(shape)
    }

    /// Merge dims `start..=end` into one.
    pub fn flatten(&self, start: usize, end: usize) -> Result<Self> {
        let value = self.value.flatten(start, end)?;
        self.with_reshaped_value(value)
    }

    fn with_reshaped_value(&self, value: Tensor<B>) -> Result<Self> {
        let reshape = |meta: &Tensor<B>| -> Result<Tensor<B>> {
            if meta.elem_count() == 1 {
                return meta.reshape(());
            }
            log::debug!(
                "expanding per-channel metadata {} to element-wise {} for reshape to {}",
                meta.shape(),
                self.shape(),
                value.shape()
            );
            meta.broadcast_as(self.shape())?.reshape(value.shape())
        };
        Ok(Self {
            scale: reshape(&self.scale)?,
            zero_point: reshape(&self.zero_point)?,
            value,
            ..self.clone()
        })
    }

    /// Concatenate along `dim`.
    ///
    /// Operands must share scale, zero point, bit width and signedness
    /// (scales may differ in training mode). Per-channel metadata that
    /// varies along `dim` is concatenated with the values.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: empty quant tensor list"))?;
        let training = tensors.iter().any(|t| t.training);
        for other in &tensors[1..] {
            if !training {
                first.check_scaling_factors_same(other)?;
            }
            if !first
                .zero_point
                .allclose(&other.zero_point, ALLCLOSE_RTOL, ALLCLOSE_ATOL)?
            {
                return Err(Error::msg("cat: zero points are different"));
            }
            if other.bit_width != first.bit_width || other.signed != first.signed {
                return Err(Error::msg(format!(
                    "cat: cannot mix {}-bit {} and {}-bit {} operands",
                    first.bit_width,
                    signedness(first.signed),
                    other.bit_width,
                    signedness(other.signed)
                )));
            }
        }

        let values: Vec<Tensor<B>> = tensors.iter().map(|t| t.value.clone()).collect();
        let value = Tensor::cat(&values, dim)?;

        let cat_meta = |pick: fn(&Self) -> &Tensor<B>| -> Result<Tensor<B>> {
            let meta = pick(first);
            if meta.rank() > 0 && meta.dims()[dim] != 1 {
                let parts: Vec<Tensor<B>> = tensors.iter().map(|t| pick(t).clone()).collect();
                Tensor::cat(&parts, dim)
            } else {
                Ok(meta.clone())
            }
        };
        Ok(Self {
            scale: cat_meta(|t| &t.scale)?,
            zero_point: cat_meta(|t| &t.zero_point)?,
            value,
            bit_width: first.bit_width,
            signed: first.signed,
            training,
        })
    }
}

/// Bits needed for an integer range of the given width.
fn range_bit_width(range: f64) -> u32 {
    range.log2().ceil().max(1.0) as u32
}

fn ceil_log2(k: usize) -> u32 {
    if k <= 1 {
        0
    } else {
        usize::BITS - (k - 1).leading_zeros()
    }
}

/// Prepend size-1 dims until `t` has `rank` dims; rank-0 tensors stay scalar.
fn align_rank<B: Backend>(t: &Tensor<B>, rank: usize) -> Result<Tensor<B>> {
    if t.rank() == 0 || t.rank() >= rank {
        return Ok(t.clone());
    }
    let mut dims = vec![1; rank - t.rank()];
    dims.extend_from_slice(t.dims());
    t.reshape(dims)
}

fn signedness(signed: bool) -> &'static str {
    if signed {
        "signed"
    } else {
        "unsigned"
    }
}

fn describe<B: Backend>(t: &Tensor<B>) -> String {
    match t.to_f64_vec() {
        Ok(v) if v.len() == 1 => format!("{:e}", v[0]),
        Ok(v) => format!("{:?} (shape {})", v, t.shape()),
        Err(_) => format!("{:?}", t),
    }
}

impl<B: Backend> fmt::Display for QuantTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuantTensor(shape={}, dtype={}, scale={}, zero_point={}, bit_width={}, signed={}, training={})",
            self.shape(),
            self.dtype(),
            describe(&self.scale),
            describe(&self.zero_point),
            self.bit_width,
            self.signed,
            self.training
        )
    }
}

// Operator overloads (by reference, fallible)

impl<B: Backend> std::ops::Add for &QuantTensor<B> {
    type Output = Result<QuantTensor<B>>;
    fn add(self, rhs: Self) -> Self::Output {
        QuantTensor::add(self, rhs)
    }
}

impl<B: Backend> std::ops::Sub for &QuantTensor<B> {
    type Output = Result<QuantTensor<B>>;
    fn sub(self, rhs: Self) -> Self::Output {
        QuantTensor::sub(self, rhs)
    }
}

impl<B: Backend> std::ops::Mul for &QuantTensor<B> {
    type Output = Result<QuantTensor<B>>;
    fn mul(self, rhs: Self) -> Self::Output {
        QuantTensor::mul(self, rhs)
    }
}

impl<B: Backend> std::ops::Div for &QuantTensor<B> {
    type Output = Result<QuantTensor<B>>;
    fn div(self, rhs: Self) -> Self::Output {
        QuantTensor::div(self, rhs)
    }
}

impl<B: Backend> std::ops::Neg for &QuantTensor<B> {
    type Output = Result<QuantTensor<B>>;
    fn neg(self) -> Self::Output {
        QuantTensor::neg(self)
    }
}
