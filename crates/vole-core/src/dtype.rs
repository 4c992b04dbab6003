use half::{bf16, f16};
use std::fmt;

// DType — element types a tensor can hold
//
// Quantized values are carried in floating point: the integer codes only
// exist implicitly as value / scale + zero_point, so every dtype here is a
// float. Half precision matters because rounding a scale into f16 or bf16
// moves it, and the validity check has to tolerate that.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

    /// Nearest value of this dtype to `v`, widened back to f64.
    pub fn round_trip(&self, v: f64) -> f64 {
        match self {
            DType::F16 => f16::from_f64(v).to_f64(),
            DType::BF16 => bf16::from_f64(v).to_f64(),
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
        }
    }

    /// Smallest positive normal value; quantization scales never go below it.
    pub fn min_positive(&self) -> f64 {
        match self {
            DType::F16 => f16::MIN_POSITIVE.to_f64(),
            DType::BF16 => bf16::MIN_POSITIVE.to_f64(),
            DType::F32 => f32::MIN_POSITIVE as f64,
            DType::F64 => f64::MIN_POSITIVE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust element types that back a [`DType`]. Backends store buffers of these
/// and do their arithmetic in f64.
pub trait WithDType: Copy + Send + Sync + fmt::Debug + num_traits::NumCast + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    /// Round `v` into this type.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype {
    ($ty:ty, $dtype:ident, $from:expr, $to:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                ($to)(self)
            }

            fn from_f64(v: f64) -> Self {
                ($from)(v)
            }
        }
    };
}

with_dtype!(f16, F16, f16::from_f64, f16::to_f64);
with_dtype!(bf16, BF16, bf16::from_f64, bf16::to_f64);
with_dtype!(f32, F32, |v: f64| v as f32, |x: f32| x as f64);
with_dtype!(f64, F64, |v: f64| v, |x: f64| x);
