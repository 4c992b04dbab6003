// Quantizer — the quantizing constructor
//
// Turns a float tensor into a QuantTensor:
//
//   1. statistic:   max|x| (per tensor or per channel), a percentile, or min/max
//   2. scale:       stat / max_int  (or range / (max_int - min_int))
//   3. zero point:  0, or round(min_int - min / scale) for asymmetric
//   4. fake-quant:  q = clamp(round(x / scale + zp), min_int, max_int)
//                   value = (q - zp) * scale
//
// The statistic step is exposed separately so that calibrating modules can
// keep running statistics and quantize with those instead of the batch's.

use vole_core::{Backend, Error, Result, Tensor};

use crate::config::QuantConfig;
use crate::quant_tensor::QuantTensor;
use crate::scaling::{self, RangeStat};

/// A validated quantization config, ready to quantize tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantizer {
    config: QuantConfig,
}

impl Quantizer {
    /// Validate `config` and build a quantizer from it.
    pub fn new(config: QuantConfig) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "quantizer: {}-bit {} {:?} {:?} with {:?} statistics",
            config.bit_width,
            if config.signed { "signed" } else { "unsigned" },
            config.mode,
            config.granularity,
            config.stats
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// Compute the scaling statistic of `x`.
    pub fn collect<B: Backend>(&self, x: &Tensor<B>) -> Result<RangeStat<B>> {
        scaling::collect_stats(&self.config, x)
    }

    /// Quantize `x` using its own statistics.
    pub fn quantize<B: Backend>(&self, x: &Tensor<B>) -> Result<QuantTensor<B>> {
        let stat = self.collect(x)?;
        self.quantize_with(x, &stat)
    }

    /// Quantize `x` using a previously collected statistic.
    ///
    /// The statistic must have the shape the config gives scales for `x`
    /// (rank 0 per tensor, the broadcastable shape per channel).
    pub fn quantize_with<B: Backend>(
        &self,
        x: &Tensor<B>,
        stat: &RangeStat<B>,
    ) -> Result<QuantTensor<B>> {
        let stat_shape = stat.shape();
        if (stat_shape.rank() != 0 && stat_shape.rank() != x.rank())
            || !stat_shape.is_broadcastable_to(x.shape())
        {
            return Err(Error::config(format!(
                "statistic of shape {} does not fit input of shape {}",
                stat_shape,
                x.shape()
            )));
        }

        let (scale, zero_point) = scaling::scale_and_zero_point(&self.config, stat)?;
        let (scale, zero_point) = if scale.dtype() != x.dtype() {
            (scale.to_dtype(x.dtype())?, zero_point.to_dtype(x.dtype())?)
        } else {
            (scale, zero_point)
        };

        let value = self.fake_quantize(x, &scale, &zero_point)?;
        QuantTensor::new(
            value,
            scale,
            zero_point,
            self.config.bit_width,
            self.config.signed,
            false,
        )
    }

    /// Round `x` onto the grid given by `scale` and `zero_point` and map it back.
    pub fn fake_quantize<B: Backend>(
        &self,
        x: &Tensor<B>,
        scale: &Tensor<B>,
        zero_point: &Tensor<B>,
    ) -> Result<Tensor<B>> {
        let codes = x
            .div(scale)?
            .add(zero_point)?
            .round()?
            .clamp(self.config.min_int(), self.config.max_int())?;
        codes.sub(zero_point)?.mul(scale)
    }
}
