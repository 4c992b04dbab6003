// Scaling — statistics and the scale / zero-point derived from them
//
// Per-tensor statistics reduce over every element. Per-channel statistics
// permute the channel dim to the front, view the input as [C, -1] and reduce
// each row; the C results are then viewed with the configured broadcastable
// shape (e.g. [C, 1, 1, 1]) so they line up with the input again.
//
// Statistics are kept as tensors already shaped like the scale, so the
// running averages kept by the front-end modules are plain tensor lerps.

use vole_core::{Backend, DType, Error, Result, Tensor};

use crate::config::{QuantConfig, QuantGranularity, QuantMode, ScalingStats};

/// The statistic a scale is computed from, shaped like the scale.
#[derive(Debug, Clone)]
pub enum RangeStat<B: Backend> {
    /// Largest (or percentile) magnitude.
    AbsMax(Tensor<B>),
    /// Observed range, widened to include 0.
    MinMax { min: Tensor<B>, max: Tensor<B> },
}

impl<B: Backend> RangeStat<B> {
    /// `self * (1 - weight) + batch * weight`, component-wise.
    pub fn lerp(&self, batch: &Self, weight: f64) -> Result<Self> {
        let mix = |running: &Tensor<B>, new: &Tensor<B>| -> Result<Tensor<B>> {
            running
                .mul_scalar(1.0 - weight)?
                .add(&new.mul_scalar(weight)?)
        };
        match (self, batch) {
            (RangeStat::AbsMax(r), RangeStat::AbsMax(b)) => Ok(RangeStat::AbsMax(mix(r, b)?)),
            (RangeStat::MinMax { min: rmin, max: rmax }, RangeStat::MinMax { min, max }) => {
                Ok(RangeStat::MinMax {
                    min: mix(rmin, min)?,
                    max: mix(rmax, max)?,
                })
            }
            _ => Err(Error::msg("cannot average statistics of different kinds")),
        }
    }

    /// Shape of the statistic (and of the scale derived from it).
    pub fn shape(&self) -> &vole_core::Shape {
        match self {
            RangeStat::AbsMax(t) => t.shape(),
            RangeStat::MinMax { max, .. } => max.shape(),
        }
    }
}

/// Where per-channel statistics come from and how they are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelLayout {
    /// Permutation bringing the channel dim first.
    pub permute: Vec<usize>,
    /// Shape the per-channel results are viewed as.
    pub broadcast_shape: Vec<usize>,
}

/// Resolve the per-channel layout of `config` against an input shape.
///
/// Missing pieces are derived: without permute dims the channel is the
/// non-singleton dim of the broadcastable shape (dim 0 if there is none);
/// without a broadcastable shape the channel dim keeps its size and every
/// other dim becomes 1.
pub(crate) fn channel_layout(config: &QuantConfig, dims: &[usize]) -> Result<ChannelLayout> {
    let rank = dims.len();
    if rank == 0 {
        return Err(Error::config("per-channel scaling needs an input of rank >= 1"));
    }

    let channel_dim = match (
        &config.scaling_stats_permute_dims,
        &config.per_channel_broadcastable_shape,
    ) {
        (Some(perm), _) => perm.first().copied().unwrap_or(0),
        (None, Some(shape)) => shape.iter().position(|&d| d != 1).unwrap_or(0),
        (None, None) => 0,
    };
    if channel_dim >= rank {
        return Err(Error::config(format!(
            "channel dim {channel_dim} out of range for input of rank {rank}"
        )));
    }

    let permute = match &config.scaling_stats_permute_dims {
        Some(perm) => perm.clone(),
        None => std::iter::once(channel_dim)
            .chain((0..rank).filter(|&d| d != channel_dim))
            .collect(),
    };
    if permute.len() != rank {
        return Err(Error::config(format!(
            "scaling_stats_permute_dims {:?} does not match input rank {}",
            permute, rank
        )));
    }

    let channels = dims[channel_dim];
    let broadcast_shape = match &config.per_channel_broadcastable_shape {
        Some(shape) => shape.clone(),
        None => (0..rank)
            .map(|d| if d == channel_dim { channels } else { 1 })
            .collect(),
    };
    if broadcast_shape.len() != rank {
        return Err(Error::config(format!(
            "per_channel_broadcastable_shape {:?} must have the input rank {}",
            broadcast_shape, rank
        )));
    }
    let expected: Vec<usize> = (0..rank)
        .map(|d| if d == channel_dim { channels } else { 1 })
        .collect();
    if broadcast_shape != expected {
        return Err(Error::config(format!(
            "per_channel_broadcastable_shape {:?} does not fit input {:?} with channel dim {} (expected {:?})",
            broadcast_shape, dims, channel_dim, expected
        )));
    }

    Ok(ChannelLayout {
        permute,
        broadcast_shape,
    })
}

/// Compute the configured statistic of `x`.
pub fn collect_stats<B: Backend>(config: &QuantConfig, x: &Tensor<B>) -> Result<RangeStat<B>> {
    if x.elem_count() == 0 {
        return Err(Error::msg(format!(
            "cannot collect scaling statistics of empty tensor {}",
            x.shape()
        )));
    }
    match config.granularity {
        QuantGranularity::PerTensor => per_tensor_stats(config.stats, x),
        QuantGranularity::PerChannel => {
            let layout = channel_layout(config, x.dims())?;
            per_channel_stats(config.stats, x, &layout)
        }
    }
}

fn per_tensor_stats<B: Backend>(stats: ScalingStats, x: &Tensor<B>) -> Result<RangeStat<B>> {
    match stats {
        ScalingStats::AbsMax => Ok(RangeStat::AbsMax(x.abs()?.max_all()?)),
        ScalingStats::AbsPercentile(q) => {
            let mut values: Vec<f64> = x.abs()?.to_f64_vec()?;
            let p = percentile(&mut values, q);
            Ok(RangeStat::AbsMax(Tensor::scalar(p, x.dtype(), x.device())?))
        }
        ScalingStats::MinMax => {
            let zero = Tensor::scalar(0.0, x.dtype(), x.device())?;
            Ok(RangeStat::MinMax {
                min: x.min_all()?.minimum(&zero)?,
                max: x.max_all()?.maximum(&zero)?,
            })
        }
    }
}

fn per_channel_stats<B: Backend>(
    stats: ScalingStats,
    x: &Tensor<B>,
    layout: &ChannelLayout,
) -> Result<RangeStat<B>> {
    let permuted = x.permute(&layout.permute)?;
    let channels = permuted.dims()[0];
    let rows = permuted.reshape((channels, x.elem_count() / channels))?;
    let shape = layout.broadcast_shape.clone();

    match stats {
        ScalingStats::AbsMax => Ok(RangeStat::AbsMax(
            rows.abs()?.max(1, false)?.reshape(shape)?,
        )),
        ScalingStats::AbsPercentile(q) => {
            let abs = rows.abs()?.to_f64_vec()?;
            let per_row = abs.len() / channels;
            let values: Vec<f64> = abs
                .chunks(per_row)
                .map(|row| percentile(&mut row.to_vec(), q))
                .collect();
            Ok(RangeStat::AbsMax(Tensor::from_f64_slice(
                &values,
                shape,
                x.dtype(),
                x.device(),
            )?))
        }
        ScalingStats::MinMax => {
            let zero = Tensor::scalar(0.0, x.dtype(), x.device())?;
            Ok(RangeStat::MinMax {
                min: rows.min(1, false)?.minimum(&zero)?.reshape(shape.clone())?,
                max: rows.max(1, false)?.maximum(&zero)?.reshape(shape)?,
            })
        }
    }
}

/// q-th percentile (q in (0, 100]) with linear interpolation between ranks.
pub fn percentile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let pos = (q / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    values[lo] + (values[hi] - values[lo]) * frac
}

/// Derive `(scale, zero_point)` from a statistic.
///
/// Both come out shaped like the statistic and in its dtype. Scales are
/// clamped below by `scaling_min_val` (or by the smallest normal of the
/// dtype when that is larger).
pub fn scale_and_zero_point<B: Backend>(
    config: &QuantConfig,
    stat: &RangeStat<B>,
) -> Result<(Tensor<B>, Tensor<B>)> {
    let max_int = config.max_int();
    let min_int = config.min_int();

    let raw_scale = match (config.mode, stat) {
        (QuantMode::Symmetric, RangeStat::AbsMax(absmax)) => absmax.affine(1.0 / max_int, 0.0)?,
        (QuantMode::Symmetric, RangeStat::MinMax { min, max }) => {
            min.abs()?.maximum(max)?.affine(1.0 / max_int, 0.0)?
        }
        (QuantMode::Asymmetric, RangeStat::MinMax { min, max }) => {
            max.sub(min)?.affine(1.0 / (max_int - min_int), 0.0)?
        }
        (QuantMode::Asymmetric, RangeStat::AbsMax(_)) => {
            return Err(Error::config(
                "asymmetric quantization needs MinMax statistics",
            ));
        }
    };

    let floor = clamp_floor(config.scaling_min_val, raw_scale.dtype());
    let smallest = raw_scale.min_all()?.to_scalar_f64()?;
    if smallest < floor {
        log::warn!(
            "scale {:e} clamped to scaling_min_val {:e}",
            smallest,
            floor
        );
    }
    let scale = raw_scale.clamp(floor, f64::INFINITY)?;

    let zero_point = match (config.mode, stat) {
        (QuantMode::Asymmetric, RangeStat::MinMax { min, .. }) => min
            .div(&scale)?
            .neg()?
            .add_scalar(min_int)?
            .round()?
            .clamp(min_int, max_int)?,
        _ => Tensor::zeros_like(&scale)?,
    };

    log::trace!(
        "computed scale of shape {} (min {:e}) for {}-bit {:?} quantization",
        scale.shape(),
        smallest.max(floor),
        config.bit_width,
        config.mode
    );
    Ok((scale, zero_point))
}

fn clamp_floor(scaling_min_val: f64, dtype: DType) -> f64 {
    scaling_min_val.max(dtype.min_positive())
}
