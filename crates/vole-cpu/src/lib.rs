// CPU Backend — Reference compute backend for vole tensors
//
// ARCHITECTURE:
// - CpuDevice is a unit struct: there is exactly one host
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Kernels read their inputs through the layout's strided indices, so
//   transposed, permuted and broadcast (zero-stride) views never need a copy
//   before an op; results are always written contiguously
// - Arithmetic is carried out in f64 and rounded once into the output dtype
// - Matmul rows are computed in parallel with rayon
//
// USAGE:
//   let device = CpuDevice;
//   let tensor = Tensor::<CpuBackend>::zeros((2, 3), DType::F32, &device)?;

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use vole_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use vole_core::dtype::{DType, WithDType};
use vole_core::error::{Error, Result};
use vole_core::layout::Layout;
use vole_core::shape::Shape;

// CpuDevice

/// The host CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage — one flat host buffer per dtype

/// Flat host buffer holding tensor elements.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Build storage of `dtype` from f64 values, rounding each once.
    pub fn from_f64_vec(data: Vec<f64>, dtype: DType) -> Self {
        match dtype {
            DType::F16 => CpuStorage::F16(encode(data)),
            DType::BF16 => CpuStorage::BF16(encode(data)),
            DType::F32 => CpuStorage::F32(encode(data)),
            DType::F64 => CpuStorage::F64(data),
        }
    }

    /// Read the elements addressed by `layout`, in logical order, as f64.
    pub fn read_f64(&self, layout: &Layout) -> Result<Vec<f64>> {
        let len = self.len();
        if layout.elem_count() > 0 {
            let last = last_index(layout);
            if last >= len {
                return Err(Error::msg(format!(
                    "layout {:?} addresses index {} but storage holds {} elements",
                    layout.dims(),
                    last,
                    len
                )));
            }
        }
        Ok(match self {
            CpuStorage::F16(v) => gather(v, layout),
            CpuStorage::BF16(v) => gather(v, layout),
            CpuStorage::F32(v) => gather(v, layout),
            CpuStorage::F64(v) => gather(v, layout),
        })
    }
}

fn encode<T: WithDType>(data: Vec<f64>) -> Vec<T> {
    data.into_iter().map(T::from_f64).collect()
}

fn gather<T: WithDType>(buf: &[T], layout: &Layout) -> Vec<f64> {
    layout.strided_indices().map(|i| buf[i].to_f64()).collect()
}

/// Highest storage index a layout can touch.
fn last_index(layout: &Layout) -> usize {
    layout
        .dims()
        .iter()
        .zip(layout.strides())
        .fold(layout.offset(), |acc, (&d, &s)| acc + d.saturating_sub(1) * s)
}

fn check_same_dtype(lhs: &CpuStorage, rhs: &CpuStorage) -> Result<()> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    Ok(())
}

fn map_unary(input: &CpuStorage, layout: &Layout, f: impl Fn(f64) -> f64) -> Result<CpuStorage> {
    let data = input.read_f64(layout)?;
    Ok(CpuStorage::from_f64_vec(
        data.into_iter().map(f).collect(),
        input.dtype(),
    ))
}

// CpuBackend

/// The CPU implementation of [`Backend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// A tensor living in host memory.
pub type CpuTensor = vole_core::Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(data.to_vec(), dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        check_same_dtype(lhs, rhs)?;
        if lhs_layout.dims() != rhs_layout.dims() {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        let a = lhs.read_f64(lhs_layout)?;
        let b = rhs.read_f64(rhs_layout)?;
        let out = a.iter().zip(b.iter()).map(|(&x, &y)| op.apply(x, y)).collect();
        Ok(CpuStorage::from_f64_vec(out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        map_unary(input, layout, |v| op.apply(v))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        map_unary(input, layout, |v| v * mul + add)
    }

    fn clamp(input: &CpuStorage, layout: &Layout, min: f64, max: f64) -> Result<CpuStorage> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(Error::msg(format!("clamp: min {min} is greater than max {max}")));
        }
        map_unary(input, layout, |v| v.clamp(min, max))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let data = input.read_f64(layout)?;
        let in_dims = layout.dims();

        // Output shape with the reduced dims kept as size 1; dropping them
        // afterwards does not change the element order.
        let out_dims: Vec<usize> = if dims.is_empty() {
            vec![1; in_dims.len()]
        } else {
            in_dims
                .iter()
                .enumerate()
                .map(|(i, &d)| if dims.contains(&i) { 1 } else { d })
                .collect()
        };
        let out_shape = Shape::new(out_dims.clone());
        let out_strides = out_shape.stride_contiguous();
        let mut acc = vec![op.identity(); out_shape.elem_count()];

        let mut index = vec![0usize; in_dims.len()];
        for &v in &data {
            let out_idx: usize = index
                .iter()
                .zip(out_dims.iter().zip(&out_strides))
                .map(|(&i, (&d, &s))| if d == 1 { 0 } else { i * s })
                .sum();
            acc[out_idx] = op.combine(acc[out_idx], v);
            for d in (0..in_dims.len()).rev() {
                index[d] += 1;
                if index[d] < in_dims[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        Ok(CpuStorage::from_f64_vec(acc, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        check_same_dtype(lhs, rhs)?;
        let ld = lhs_layout.dims();
        let rd = rhs_layout.dims();
        if ld.len() < 2 || rd.len() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: ld.len().min(rd.len()),
            });
        }
        let (m, k) = (ld[ld.len() - 2], ld[ld.len() - 1]);
        let (k2, n) = (rd[rd.len() - 2], rd[rd.len() - 1]);
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }

        let batch = Shape::broadcast_shape(
            &Shape::from(&ld[..ld.len() - 2]),
            &Shape::from(&rd[..rd.len() - 2]),
        )?;
        let batch_count = batch.elem_count();

        let mut lhs_target = batch.dims().to_vec();
        lhs_target.extend_from_slice(&[m, k]);
        let mut rhs_target = batch.dims().to_vec();
        rhs_target.extend_from_slice(&[k, n]);
        let a = lhs.read_f64(&lhs_layout.broadcast_to(&Shape::new(lhs_target))?)?;
        let b = rhs.read_f64(&rhs_layout.broadcast_to(&Shape::new(rhs_target))?)?;

        let mut out = vec![0.0f64; batch_count * m * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(row, dst)| {
                let (bi, i) = (row / m, row % m);
                let a_row = &a[bi * m * k + i * k..bi * m * k + (i + 1) * k];
                let b_mat = &b[bi * k * n..(bi + 1) * k * n];
                // No skipping of zero entries: 0 * inf must still give NaN.
                for (p, &av) in a_row.iter().enumerate() {
                    let b_row = &b_mat[p * n..(p + 1) * n];
                    for (o, &bv) in dst.iter_mut().zip(b_row) {
                        *o += av * bv;
                    }
                }
            });
        }
        Ok(CpuStorage::from_f64_vec(out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = input.read_f64(layout)?;
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        input.read_f64(layout)
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        let (first, _) = inputs
            .first()
            .ok_or_else(|| Error::msg("cat: empty input list"))?;
        let dtype = first.dtype();
        let outer: usize = out_shape.dims()[..dim].iter().product();
        let inner: usize = out_shape.dims()[dim + 1..].iter().product();

        let parts = inputs
            .iter()
            .map(|(s, l)| {
                if s.dtype() != dtype {
                    return Err(Error::DTypeMismatch {
                        expected: dtype,
                        got: s.dtype(),
                    });
                }
                Ok((s.read_f64(l)?, l.dims()[dim] * inner))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for (data, chunk) in &parts {
                out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(CpuStorage::from_f64_vec(out, dtype))
    }

    fn cast(input: &CpuStorage, layout: &Layout, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(input.read_f64(layout)?, dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_dtype_and_len() {
        let s = CpuStorage::from_f64_vec(vec![1.0, 2.0, 3.0], DType::BF16);
        assert_eq!(s.dtype(), DType::BF16);
        assert_eq!(s.len(), 3);
        assert!(!s.is_empty());
    }

    #[test]
    fn test_read_rejects_out_of_bounds_layout() {
        let s = CpuStorage::from_f64_vec(vec![1.0, 2.0], DType::F32);
        let layout = Layout::contiguous(Shape::from((2, 2)));
        assert!(s.read_f64(&layout).is_err());
    }

    #[test]
    fn test_last_index_broadcast() {
        let layout = Layout::contiguous(Shape::from((3, 1)))
            .broadcast_to(&Shape::from((3, 4)))
            .unwrap();
        assert_eq!(last_index(&layout), 2);
    }

    #[test]
    fn test_device_name() {
        assert_eq!(CpuDevice.name(), "cpu");
    }
}
