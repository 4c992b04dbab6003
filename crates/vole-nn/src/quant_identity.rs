// QuantIdentity — quantize the input and pass it on
//
// The quantizing front end of a quantized network: whatever comes in leaves
// as a QuantTensor (quant_forward) or as its dequantized value (forward).
//
// RUNNING STATISTICS:
//
//   In training mode the scale comes from the current batch, and the batch
//   statistic is folded into a running statistic:
//
//     step < collect_stats_steps:  running += (batch - running) / (step + 1)
//     afterwards:                  running = (1 - momentum) * running + momentum * batch
//
//   i.e. a plain cumulative average while calibrating, then an exponential
//   moving average. In eval mode the running statistic is used, so the
//   quantization grid no longer depends on the batch. Before any statistic
//   has been collected eval falls back to the batch.

use std::cell::{Cell, RefCell};

use vole_core::backend::Backend;
use vole_core::error::Result;
use vole_core::tensor::Tensor;
use vole_quant::{QuantConfig, QuantTensor, Quantizer, RangeStat};

use crate::module::{Module, QuantModule};

/// Quantizing identity layer.
///
/// # Examples
/// ```ignore
/// let quant = QuantIdentity::<CpuBackend>::new(QuantConfig::int8())?;
/// let qt = quant.quant_forward(&x)?;
/// assert!(qt.is_valid());
/// ```
pub struct QuantIdentity<B: Backend> {
    quantizer: Quantizer,
    /// Running statistic (not trainable), shaped like the scale.
    running: RefCell<Option<RangeStat<B>>>,
    /// Number of training steps folded into `running`.
    steps: Cell<usize>,
    training: Cell<bool>,
}

impl<B: Backend> QuantIdentity<B> {
    /// Create a new layer; the config is validated here.
    pub fn new(config: QuantConfig) -> Result<Self> {
        Ok(Self::from_quantizer(Quantizer::new(config)?))
    }

    pub fn from_quantizer(quantizer: Quantizer) -> Self {
        QuantIdentity {
            quantizer,
            running: RefCell::new(None),
            steps: Cell::new(0),
            training: Cell::new(true),
        }
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    pub fn config(&self) -> &QuantConfig {
        self.quantizer.config()
    }

    /// The running statistic collected so far.
    pub fn running_stat(&self) -> Option<RangeStat<B>> {
        self.running.borrow().clone()
    }

    /// Number of training steps seen.
    pub fn steps(&self) -> usize {
        self.steps.get()
    }

    /// Forget the collected statistics.
    pub fn reset_running_stats(&self) {
        self.running.replace(None);
        self.steps.set(0);
    }

    fn update_running(&self, batch: &RangeStat<B>) -> Result<()> {
        let config = self.quantizer.config();
        let step = self.steps.get();
        let updated = match self.running.borrow().as_ref() {
            None => batch.clone(),
            Some(running) => {
                let weight = if step < config.collect_stats_steps {
                    1.0 / (step as f64 + 1.0)
                } else {
                    config.momentum
                };
                running.lerp(batch, weight)?
            }
        };
        self.running.replace(Some(updated));
        self.steps.set(step + 1);
        if step + 1 == config.collect_stats_steps {
            log::debug!(
                "QuantIdentity: collected {} calibration steps, switching to moving average (momentum {})",
                step + 1,
                config.momentum
            );
        }
        Ok(())
    }
}

impl<B: Backend> QuantModule<B> for QuantIdentity<B> {
    fn quant_forward(&self, x: &Tensor<B>) -> Result<QuantTensor<B>> {
        if self.training.get() {
            let batch = self.quantizer.collect(x)?;
            let mut qt = self.quantizer.quantize_with(x, &batch)?;
            // Only a batch that quantized cleanly counts as a step.
            self.update_running(&batch)?;
            qt.set_training(true);
            Ok(qt)
        } else {
            let running = self.running.borrow().clone();
            match running {
                Some(stat) => self.quantizer.quantize_with(x, &stat),
                None => self.quantizer.quantize(x),
            }
        }
    }
}

impl<B: Backend> Module<B> for QuantIdentity<B> {
    /// Forward pass: quantize, then drop the metadata.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        Ok(self.quant_forward(x)?.detach_metadata())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::DType;
    use vole_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    const DEV: CpuDevice = CpuDevice;

    fn absmax(stat: &RangeStat<CpuBackend>) -> f64 {
        match stat {
            RangeStat::AbsMax(t) => t.to_scalar_f64().unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_defaults_to_training() {
        let q = QuantIdentity::<CpuBackend>::new(QuantConfig::int8()).unwrap();
        assert!(q.is_training());
        q.eval();
        assert!(!q.is_training());
        assert!(QuantIdentity::<CpuBackend>::new(QuantConfig::int8().with_bit_width(40)).is_err());
    }

    #[test]
    fn test_training_output_is_marked() {
        let q = QuantIdentity::<CpuBackend>::new(QuantConfig::int8()).unwrap();
        let x = T::randn((4, 4), DType::F32, &DEV).unwrap();
        let qt = q.quant_forward(&x).unwrap();
        assert!(qt.training());
        assert!(qt.is_valid());
        assert_eq!(q.steps(), 1);

        let y = q.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 4]);
    }

    #[test]
    fn test_cumulative_then_moving_average() {
        let config = QuantConfig::int8()
            .with_collect_stats_steps(2)
            .with_momentum(0.5);
        let q = QuantIdentity::<CpuBackend>::new(config).unwrap();
        for v in [1.0, 3.0, 6.0] {
            let x = T::full((2, 2), v, DType::F64, &DEV).unwrap();
            q.quant_forward(&x).unwrap();
        }
        // cumulative: (1 + 3) / 2 = 2, then EMA: 0.5 * 2 + 0.5 * 6 = 4
        assert_eq!(absmax(&q.running_stat().unwrap()), 4.0);
        assert_eq!(q.steps(), 3);

        q.reset_running_stats();
        assert!(q.running_stat().is_none());
        assert_eq!(q.steps(), 0);
    }

    #[test]
    fn test_failed_forward_keeps_running_stats() {
        let q = QuantIdentity::<CpuBackend>::new(QuantConfig::int8()).unwrap();
        let x = T::full((2, 2), 2.0, DType::F64, &DEV).unwrap();
        q.quant_forward(&x).unwrap();

        let empty = T::zeros((0, 2), DType::F64, &DEV).unwrap();
        assert!(q.quant_forward(&empty).is_err());
        assert_eq!(q.steps(), 1);
        assert_eq!(absmax(&q.running_stat().unwrap()), 2.0);
    }

    #[test]
    fn test_eval_uses_running_stats() {
        let q = QuantIdentity::<CpuBackend>::new(QuantConfig::int8()).unwrap();
        let calib = T::from_f64_slice(&[-1.27, 1.27], 2, DType::F64, &DEV).unwrap();
        q.quant_forward(&calib).unwrap();

        q.eval();
        let x = T::from_f64_slice(&[0.5, 5.0], 2, DType::F64, &DEV).unwrap();
        let qt = q.quant_forward(&x).unwrap();
        assert!(!qt.training());
        assert!((qt.scale().to_scalar_f64().unwrap() - 0.01).abs() < 1e-12);
        // 5.0 is outside the calibrated range and saturates
        let v = qt.value().to_f64_vec().unwrap();
        assert!((v[1] - 1.27).abs() < 1e-9);
        // no statistics update in eval
        assert_eq!(q.steps(), 1);
    }

    #[test]
    fn test_eval_without_stats_uses_batch() {
        let q = QuantIdentity::<CpuBackend>::new(QuantConfig::int8()).unwrap();
        q.eval();
        let x = T::from_f64_slice(&[-2.54, 1.0], 2, DType::F64, &DEV).unwrap();
        let qt = q.quant_forward(&x).unwrap();
        assert!((qt.scale().to_scalar_f64().unwrap() - 0.02).abs() < 1e-12);
    }
}
