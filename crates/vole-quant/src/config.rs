// Quantization configuration
//
// A QuantConfig says how a float tensor becomes a QuantTensor:
//
//   - bit width and signedness of the integer codes
//   - symmetric (zero_point = 0) or asymmetric (min/max with an integer zero point)
//   - per-tensor or per-channel scales; per-channel needs the shape the scale
//     is broadcast with and the permutation that brings the channel dim first
//     for statistics collection
//   - which statistic drives the scale, and calibration knobs for the
//     running-statistics modules
//
// Configs are plain data: serde (de)serializable and immutable once bound
// to a quantizer.

use serde::{Deserialize, Serialize};
use vole_core::{Error, Result};

/// Largest supported bit width.
pub const MAX_BIT_WIDTH: u32 = 16;
/// Smallest supported bit width.
pub const MIN_BIT_WIDTH: u32 = 2;

/// Largest integer code for a bit width.
pub fn max_int(signed: bool, narrow_range: bool, bit_width: u32) -> f64 {
    if signed {
        2f64.powi(exponent(bit_width) - 1) - 1.0
    } else if narrow_range {
        2f64.powi(exponent(bit_width)) - 2.0
    } else {
        2f64.powi(exponent(bit_width)) - 1.0
    }
}

// Widths past i32::MAX only come from accumulated arithmetic metadata and
// give infinite bounds either way.
fn exponent(bit_width: u32) -> i32 {
    i32::try_from(bit_width).unwrap_or(i32::MAX)
}

/// Smallest integer code for a bit width.
pub fn min_int(signed: bool, narrow_range: bool, bit_width: u32) -> f64 {
    match (signed, narrow_range) {
        (true, true) => -(2f64.powi(exponent(bit_width) - 1)) + 1.0,
        (true, false) => -(2f64.powi(exponent(bit_width) - 1)),
        (false, _) => 0.0,
    }
}

/// Quantization mode (symmetric vs. asymmetric).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantMode {
    /// Symmetric: zero_point = 0, range is [-max, +max].
    Symmetric,
    /// Asymmetric: zero_point can be non-zero, range is [min, max].
    Asymmetric,
}

/// Granularity of quantization parameters (scale / zero_point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantGranularity {
    /// One scale/zero_point for the entire tensor.
    PerTensor,
    /// One scale/zero_point per channel.
    PerChannel,
}

/// The statistic a scale is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalingStats {
    /// max(|x|)
    AbsMax,
    /// q-th percentile of |x|, q in (0, 100].
    AbsPercentile(f64),
    /// (min(x, 0), max(x, 0))
    MinMax,
}

/// Full quantization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Bit width of the integer codes.
    pub bit_width: u32,
    pub signed: bool,
    /// Drop the most negative code (signed) or the top code (unsigned).
    #[serde(default)]
    pub narrow_range: bool,
    pub mode: QuantMode,
    pub granularity: QuantGranularity,
    /// Shape the per-channel scale is viewed as, e.g. `[C, 1, 1, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_channel_broadcastable_shape: Option<Vec<usize>>,
    /// Permutation bringing the channel dim first before statistics are taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_stats_permute_dims: Option<Vec<usize>>,
    pub stats: ScalingStats,
    /// Lower bound applied to every computed scale.
    pub scaling_min_val: f64,
    /// Exponential moving average factor for running statistics.
    pub momentum: f64,
    /// Number of calibration steps averaged cumulatively before switching
    /// to the moving average.
    pub collect_stats_steps: usize,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            bit_width: 8,
            signed: true,
            narrow_range: false,
            mode: QuantMode::Symmetric,
            granularity: QuantGranularity::PerTensor,
            per_channel_broadcastable_shape: None,
            scaling_stats_permute_dims: None,
            stats: ScalingStats::AbsMax,
            scaling_min_val: 1e-10,
            momentum: 0.1,
            collect_stats_steps: 30,
        }
    }
}

impl QuantConfig {
    /// INT8 symmetric per-tensor config (most common).
    pub fn int8() -> Self {
        Self::default()
    }

    /// INT8 symmetric per-channel config.
    ///
    /// `broadcastable_shape` has the rank of the input with the channel dim
    /// kept and every other dim 1; `permute_dims` brings the channel dim
    /// first for statistics.
    pub fn int8_per_channel(broadcastable_shape: Vec<usize>, permute_dims: Vec<usize>) -> Self {
        Self {
            granularity: QuantGranularity::PerChannel,
            per_channel_broadcastable_shape: Some(broadcastable_shape),
            scaling_stats_permute_dims: Some(permute_dims),
            ..Self::default()
        }
    }

    /// INT4 symmetric per-tensor config.
    pub fn int4() -> Self {
        Self::default().with_bit_width(4)
    }

    /// UINT8 symmetric per-tensor config, for non-negative activations.
    pub fn uint8() -> Self {
        Self::default().unsigned()
    }

    /// Switch to asymmetric min/max quantization.
    pub fn asymmetric(mut self) -> Self {
        self.mode = QuantMode::Asymmetric;
        self.stats = ScalingStats::MinMax;
        self
    }

    pub fn with_bit_width(mut self, bit_width: u32) -> Self {
        self.bit_width = bit_width;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.signed = false;
        self
    }

    pub fn narrow(mut self) -> Self {
        self.narrow_range = true;
        self
    }

    pub fn with_stats(mut self, stats: ScalingStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_scaling_min_val(mut self, min_val: f64) -> Self {
        self.scaling_min_val = min_val;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_collect_stats_steps(mut self, steps: usize) -> Self {
        self.collect_stats_steps = steps;
        self
    }

    /// Largest integer code of this config.
    pub fn max_int(&self) -> f64 {
        max_int(self.signed, self.narrow_range, self.bit_width)
    }

    /// Smallest integer code of this config.
    pub fn min_int(&self) -> f64 {
        min_int(self.signed, self.narrow_range, self.bit_width)
    }

    /// Check everything that can be checked without seeing an input.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BIT_WIDTH..=MAX_BIT_WIDTH).contains(&self.bit_width) {
            return Err(Error::config(format!(
                "bit width {} outside {}..={}",
                self.bit_width, MIN_BIT_WIDTH, MAX_BIT_WIDTH
            )));
        }
        if !(self.scaling_min_val > 0.0 && self.scaling_min_val.is_finite()) {
            return Err(Error::config(format!(
                "scaling_min_val must be positive and finite, got {}",
                self.scaling_min_val
            )));
        }
        if !(self.momentum > 0.0 && self.momentum <= 1.0) {
            return Err(Error::config(format!(
                "momentum must be in (0, 1], got {}",
                self.momentum
            )));
        }
        match self.stats {
            ScalingStats::AbsPercentile(q) if !(q > 0.0 && q <= 100.0) => {
                return Err(Error::config(format!(
                    "percentile must be in (0, 100], got {q}"
                )));
            }
            ScalingStats::AbsMax | ScalingStats::AbsPercentile(_)
                if self.mode == QuantMode::Asymmetric =>
            {
                return Err(Error::config(
                    "asymmetric quantization needs MinMax statistics",
                ));
            }
            _ => {}
        }

        if let Some(perm) = &self.scaling_stats_permute_dims {
            let mut seen = vec![false; perm.len()];
            for &d in perm {
                if d >= perm.len() || seen[d] {
                    return Err(Error::config(format!(
                        "scaling_stats_permute_dims {:?} is not a permutation",
                        perm
                    )));
                }
                seen[d] = true;
            }
        }
        if let Some(shape) = &self.per_channel_broadcastable_shape {
            let channels = shape.iter().filter(|&&d| d != 1).count();
            if channels > 1 {
                return Err(Error::config(format!(
                    "per_channel_broadcastable_shape {:?} has more than one non-singleton dim",
                    shape
                )));
            }
            if let Some(perm) = &self.scaling_stats_permute_dims {
                if perm.len() != shape.len() {
                    return Err(Error::config(format!(
                        "per_channel_broadcastable_shape {:?} and scaling_stats_permute_dims {:?} differ in rank",
                        shape, perm
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse and validate a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: QuantConfig = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize this config to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::msg(format!("config serialization: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ranges() {
        assert_eq!(max_int(true, false, 8), 127.0);
        assert_eq!(min_int(true, false, 8), -128.0);
        assert_eq!(min_int(true, true, 8), -127.0);
        assert_eq!(max_int(false, false, 8), 255.0);
        assert_eq!(max_int(false, true, 8), 254.0);
        assert_eq!(min_int(false, false, 4), 0.0);
        assert_eq!(max_int(true, false, 4), 7.0);
    }

    #[test]
    fn test_presets() {
        let c = QuantConfig::int8();
        assert_eq!(c.bit_width, 8);
        assert!(c.signed);
        assert_eq!(c.mode, QuantMode::Symmetric);
        assert_eq!(c.granularity, QuantGranularity::PerTensor);
        assert_eq!(c.scaling_min_val, 1e-10);

        assert_eq!(QuantConfig::int4().max_int(), 7.0);
        assert_eq!(QuantConfig::uint8().max_int(), 255.0);

        let a = QuantConfig::uint8().asymmetric();
        assert_eq!(a.stats, ScalingStats::MinMax);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_validate_bit_width() {
        assert!(QuantConfig::int8().with_bit_width(1).validate().is_err());
        assert!(QuantConfig::int8().with_bit_width(17).validate().is_err());
        assert!(QuantConfig::int8().with_bit_width(16).validate().is_ok());
    }

    #[test]
    fn test_validate_per_channel() {
        let ok = QuantConfig::int8_per_channel(vec![4, 1, 1], vec![0, 1, 2]);
        assert!(ok.validate().is_ok());

        let two_channels = QuantConfig::int8_per_channel(vec![4, 4, 1], vec![0, 1, 2]);
        assert!(matches!(two_channels.validate(), Err(Error::InvalidConfig(_))));

        let bad_perm = QuantConfig::int8_per_channel(vec![4, 1, 1], vec![0, 0, 2]);
        assert!(bad_perm.validate().is_err());

        let rank = QuantConfig::int8_per_channel(vec![4, 1, 1], vec![0, 1]);
        assert!(rank.validate().is_err());
    }

    #[test]
    fn test_validate_stats() {
        let c = QuantConfig::int8().with_stats(ScalingStats::AbsPercentile(0.0));
        assert!(c.validate().is_err());
        let c = QuantConfig::int8().with_stats(ScalingStats::AbsPercentile(99.9));
        assert!(c.validate().is_ok());

        let mut c = QuantConfig::int8();
        c.mode = QuantMode::Asymmetric;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let c = QuantConfig::int8_per_channel(vec![8, 1], vec![0, 1]).with_momentum(0.2);
        let json = c.to_json().unwrap();
        let back = QuantConfig::from_json(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_from_json_defaults_and_errors() {
        let json = r#"{
            "bit_width": 4, "signed": true, "mode": "Symmetric",
            "granularity": "PerTensor", "stats": {"AbsPercentile": 99.0},
            "scaling_min_val": 1e-8, "momentum": 0.1, "collect_stats_steps": 10
        }"#;
        let c = QuantConfig::from_json(json).unwrap();
        assert_eq!(c.bit_width, 4);
        assert!(!c.narrow_range);
        assert_eq!(c.per_channel_broadcastable_shape, None);

        assert!(QuantConfig::from_json("{").is_err());
        let bad = json.replace("\"bit_width\": 4", "\"bit_width\": 40");
        assert!(matches!(QuantConfig::from_json(&bad), Err(Error::InvalidConfig(_))));
    }
}
