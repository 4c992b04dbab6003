// Integration tests for vole-quant and vole-nn
//
// These tests build quantized tensors the way a network front end does
// (through QuantIdentity, in its default training mode) and check that the
// arithmetic and shape transforms agree with the same operations on the
// dequantized float values.

use vole::prelude::*;

const DEV: CpuDevice = CpuDevice;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn to_quant_tensor(x: &CpuTensor) -> vole::Result<QuantTensor<CpuBackend>> {
    QuantIdentity::<CpuBackend>::new(QuantConfig::int8())?.quant_forward(x)
}

/// Per-channel int8 quantization along dim 0.
fn to_quant_tensor_per_channel(x: &CpuTensor) -> vole::Result<QuantTensor<CpuBackend>> {
    let mut shape = vec![1; x.rank()];
    shape[0] = x.dims()[0];
    let permute = (0..x.rank()).collect();
    QuantIdentity::<CpuBackend>::new(QuantConfig::int8_per_channel(shape, permute))?
        .quant_forward(x)
}

/// Quantize `x` onto the grid of `q` and map it back.
fn qdq(x: &CpuTensor, q: &QuantTensor<CpuBackend>) -> vole::Result<CpuTensor> {
    x.div(q.scale())?
        .add(q.zero_point())?
        .round()?
        .sub(q.zero_point())?
        .mul(q.scale())
}

fn tril_ones(n: usize) -> vole::Result<CpuTensor> {
    let data: Vec<f64> = (0..n * n)
        .map(|i| if i % n <= i / n { 1.0 } else { 0.0 })
        .collect();
    CpuTensor::from_f64_slice(&data, (n, n), DType::F32, &DEV)
}

// Construction

#[test]
fn test_quant_tensor_init() -> vole::Result<()> {
    let x = CpuTensor::randn((4, 4), DType::F32, &DEV)?;
    let q = to_quant_tensor(&x)?;
    assert!(q.is_valid());
    assert!(qdq(&x, &q)?.allclose(q.value(), 0.01, 1e-8)?);
    Ok(())
}

#[test]
fn test_quant_tensor_init_per_channel() -> vole::Result<()> {
    let x = CpuTensor::randn((3, 5), DType::F32, &DEV)?;
    let q = to_quant_tensor_per_channel(&x)?;
    assert!(q.is_valid());
    assert_eq!(q.scale().dims(), &[3, 1]);
    assert!(qdq(&x, &q)?.allclose(q.value(), 0.01, 1e-8)?);
    Ok(())
}

// Arithmetic

/// Operands in [1, 2) to stay clear of zero.
fn operands() -> vole::Result<(QuantTensor<CpuBackend>, QuantTensor<CpuBackend>)> {
    let x = CpuTensor::rand((4, 4), DType::F32, &DEV)?.add_scalar(1.0)?;
    Ok((to_quant_tensor(&x)?, to_quant_tensor(&x)?))
}

#[test]
fn test_quant_tensor_add() -> vole::Result<()> {
    let (qa, qb) = operands()?;
    let quant = (&qa + &qb)?;
    let normal = qa.value().add(qb.value())?;
    assert!(normal.allclose(quant.value(), 1e-5, 1e-8)?);
    assert_eq!(quant.bit_width(), 9);
    Ok(())
}

#[test]
fn test_quant_tensor_sub() -> vole::Result<()> {
    let (qa, qb) = operands()?;
    let quant = (&qa - &qb)?;
    let normal = qa.value().sub(qb.value())?;
    assert!(normal.allclose(quant.value(), 1e-5, 1e-8)?);
    assert!(quant.signed());
    Ok(())
}

#[test]
fn test_quant_tensor_mul() -> vole::Result<()> {
    let (qa, qb) = operands()?;
    let quant = (&qa * &qb)?;
    let normal = qa.value().mul(qb.value())?;
    assert!(normal.allclose(quant.value(), 1e-5, 1e-8)?);
    assert_eq!(quant.bit_width(), 16);
    Ok(())
}

#[test]
fn test_quant_tensor_div() -> vole::Result<()> {
    let (qa, qb) = operands()?;
    let quant = (&qa / &qb)?;
    let normal = qa.value().div(qb.value())?;
    assert!(normal.allclose(quant.value(), 1e-5, 1e-8)?);
    Ok(())
}

#[test]
fn test_quant_tensor_matmul() -> vole::Result<()> {
    let (qa, qb) = operands()?;
    let quant = ops::matmul(&qa.clone().into(), &qb.clone().into())?;
    let normal = qa.value().matmul(qb.value())?;
    assert!(quant.is_quant());
    assert!(normal.allclose(quant.value(), 1e-5, 1e-8)?);
    // 8 + 8 bits, plus 2 for a 4-term accumulation
    assert_eq!(quant.as_quant().map(|q| q.bit_width()), Some(18));
    Ok(())
}

#[test]
fn test_quant_tensor_matmul_vectors() -> vole::Result<()> {
    let x = CpuTensor::from_f64_slice(&[0.5, -1.0, 0.25], 3, DType::F32, &DEV)?;
    let w = CpuTensor::from_f64_slice(&[1.0, 0.5, -0.5, 2.0, 0.75, -1.0], (3, 2), DType::F32, &DEV)?;
    let (qx, qw) = (to_quant_tensor(&x)?, to_quant_tensor(&w)?);

    let out = ops::matmul(&qx.clone().into(), &qw.clone().into())?;
    let q = out.as_quant().expect("quantized result");
    assert_eq!(q.dims(), &[2]);
    assert!(q.value().allclose(&qx.value().matmul(qw.value())?, 1e-5, 1e-8)?);

    let dot = ops::matmul(&qx.clone().into(), &qx.clone().into())?;
    let q = dot.as_quant().expect("quantized result");
    assert_eq!(q.rank(), 0);
    assert_eq!(q.bit_width(), 18);
    Ok(())
}

#[test]
fn test_quant_tensor_matmul_zero_times_inf() -> vole::Result<()> {
    let zeros = to_quant_tensor(&CpuTensor::zeros((2, 2), DType::F32, &DEV)?)?;
    let ones = to_quant_tensor(&CpuTensor::ones((2, 2), DType::F32, &DEV)?)?;
    let inf = (&ones / &zeros)?;
    let out = ops::matmul(&zeros.into(), &inf.into())?;
    assert!(out.is_quant());
    assert!(out.value().to_f64_vec()?.iter().all(|v| v.is_nan()));
    Ok(())
}

#[test]
fn test_mixed_operands_give_raw() -> vole::Result<()> {
    let (qa, _) = operands()?;
    let raw = CpuTensor::full((4, 4), 2.0, DType::F32, &DEV)?;
    let out = ops::mul(&Operand::from(qa.clone()), &Operand::from(raw.clone()))?;
    assert!(!out.is_quant());
    assert!(out.value().allclose(&qa.value().mul(&raw)?, 1e-6, 1e-8)?);

    let out = ops::matmul(&Operand::from(raw), &Operand::from(qa))?;
    assert!(out.as_quant().is_none());
    assert_eq!(out.shape().dims(), &[4, 4]);
    Ok(())
}

#[test]
fn test_quant_tensor_div_by_zero() -> vole::Result<()> {
    let a = to_quant_tensor(&CpuTensor::ones((4, 4), DType::F32, &DEV)?)?;
    let b = to_quant_tensor(&CpuTensor::zeros((4, 4), DType::F32, &DEV)?)?;
    let c = (&a / &b)?;
    assert!(c.value().to_f64_vec()?.iter().all(|v| v.is_infinite()));
    Ok(())
}

#[test]
fn test_quant_tensor_div_by_fraction() -> vole::Result<()> {
    let a = to_quant_tensor(&CpuTensor::ones((4, 4), DType::F32, &DEV)?)?;
    let b = to_quant_tensor(&CpuTensor::full((4, 4), 0.5, DType::F32, &DEV)?)?;
    let c = (&a / &b)?;
    assert_vec_approx(&c.value().to_f64_vec()?, &[2.0; 16], 0.1);
    Ok(())
}

#[test]
fn test_eval_mode_scale_mismatch() -> vole::Result<()> {
    let quant = QuantIdentity::<CpuBackend>::new(QuantConfig::int8())?;
    quant.eval();
    let a = quant.quant_forward(&CpuTensor::ones((2, 2), DType::F32, &DEV)?)?;
    let b = quant.quant_forward(&CpuTensor::full((2, 2), 3.0, DType::F32, &DEV)?)?;
    assert!(matches!(&a + &b, Err(Error::ScaleMismatch { .. })));
    // element-wise products have no such restriction
    assert!((&a * &b).is_ok());
    Ok(())
}

#[test]
fn test_asymmetric_mul_rejected() -> vole::Result<()> {
    let x = CpuTensor::from_f64_slice(&[-0.5, 1.0, 2.0, 3.0], (2, 2), DType::F32, &DEV)?;
    let q = Quantizer::new(QuantConfig::uint8().asymmetric())?.quantize(&x)?;
    assert!(!q.is_zero_zero_point()?);
    assert!(matches!(&q * &q, Err(Error::NonZeroZeroPoint { op: "mul" })));
    assert!(ops::matmul(&q.clone().into(), &q.into()).is_err());
    Ok(())
}

// Shape transforms

#[test]
fn test_quant_tensor_transpose() -> vole::Result<()> {
    let x = tril_ones(4)?;
    let a_transposed = x.transpose(0, 1)?;

    let b_transposed = to_quant_tensor(&x)?.transpose(0, 1)?;
    assert!(b_transposed.is_valid());
    assert!(a_transposed.allclose(b_transposed.value(), 1e-5, 0.01)?);

    let c_transposed = to_quant_tensor_per_channel(&x)?.transpose(0, 1)?;
    assert!(c_transposed.is_valid());
    assert_eq!(c_transposed.scale().dims(), &[1, 4]);
    assert!(a_transposed.allclose(c_transposed.value(), 1e-5, 0.01)?);
    Ok(())
}

#[test]
fn test_quant_tensor_permute() -> vole::Result<()> {
    let x = CpuTensor::rand((4, 4, 4), DType::F32, &DEV)?;
    let a_permuted = x.permute(&[1, 0, 2])?;

    let b_permuted = to_quant_tensor(&x)?.permute(&[1, 0, 2])?;
    assert!(b_permuted.is_valid());
    assert!(a_permuted.allclose(b_permuted.value(), 1e-5, 0.01)?);

    let c_permuted = to_quant_tensor_per_channel(&x)?.permute(&[1, 0, 2])?;
    assert!(c_permuted.is_valid());
    assert_eq!(c_permuted.scale().dims(), &[1, 4, 1]);
    assert!(a_permuted.allclose(c_permuted.value(), 1e-5, 0.01)?);
    Ok(())
}

#[test]
fn test_quant_tensor_squeeze() -> vole::Result<()> {
    let x = CpuTensor::rand((4, 1, 4, 1), DType::F32, &DEV)?;
    let a_squeezed = x.squeeze_all();

    let b_squeezed = to_quant_tensor(&x)?.squeeze()?;
    assert!(b_squeezed.is_valid());
    assert_eq!(b_squeezed.dims(), &[4, 4]);
    assert!(a_squeezed.allclose(b_squeezed.value(), 1e-5, 0.01)?);

    let c_squeezed = to_quant_tensor_per_channel(&x)?.squeeze()?;
    assert!(c_squeezed.is_valid());
    assert_eq!(c_squeezed.scale().dims(), &[4, 1]);
    assert!(a_squeezed.allclose(c_squeezed.value(), 1e-5, 0.01)?);
    Ok(())
}

#[test]
fn test_quant_tensor_unsqueeze() -> vole::Result<()> {
    let x = CpuTensor::rand((4, 4), DType::F32, &DEV)?;
    let a_unsqueezed = x.unsqueeze(1)?;

    let b_unsqueezed = to_quant_tensor(&x)?.unsqueeze(1)?;
    assert!(b_unsqueezed.is_valid());
    assert_eq!(b_unsqueezed.dims(), &[4, 1, 4]);
    assert!(a_unsqueezed.allclose(b_unsqueezed.value(), 1e-5, 0.01)?);

    let c_unsqueezed = to_quant_tensor_per_channel(&x)?.unsqueeze(1)?;
    assert!(c_unsqueezed.is_valid());
    assert_eq!(c_unsqueezed.scale().dims(), &[4, 1, 1]);
    assert!(a_unsqueezed.allclose(c_unsqueezed.value(), 1e-5, 0.01)?);
    Ok(())
}

#[test]
fn test_quant_tensor_view() -> vole::Result<()> {
    let x = CpuTensor::ones((4, 4), DType::F32, &DEV)?;
    let a = to_quant_tensor(&x)?;

    let shapes: [&[isize]; 4] = [&[-1], &[2, -1], &[16, -1], &[8, 2]];
    for shape in shapes {
        let qv = a.view(shape)?;
        let bv = x.view(shape)?;
        assert_eq!(qv.dims(), bv.dims());
        assert!(bv.allclose(qv.value(), 1e-5, 0.01)?);
        assert!(qv.is_valid());
    }
    assert!(a.view(&[5, -1]).is_err());
    Ok(())
}

#[test]
fn test_quant_tensor_view_per_channel() -> vole::Result<()> {
    let x = CpuTensor::rand((4, 4), DType::F32, &DEV)?;
    let c = to_quant_tensor_per_channel(&x)?;
    let cv = c.view(&[2, 8])?;
    // metadata is expanded element-wise, so the grid is still exact
    assert_eq!(cv.scale().dims(), &[2, 8]);
    assert!(cv.is_valid());
    assert!(x.view(&[2, 8])?.allclose(cv.value(), 1e-5, 0.01)?);
    Ok(())
}

#[test]
fn test_quant_tensor_cat() -> vole::Result<()> {
    let x = CpuTensor::rand((2, 3), DType::F32, &DEV)?;
    let q = to_quant_tensor(&x)?;
    let c = QuantTensor::cat(&[q.clone(), q.clone()], 0)?;
    assert_eq!(c.dims(), &[4, 3]);
    assert!(c.is_valid());
    assert_vec_approx(
        &c.value().narrow(0, 2, 2)?.to_f64_vec()?,
        &q.value().to_f64_vec()?,
        1e-12,
    );
    Ok(())
}

// Modules

#[test]
fn test_quant_relu_then_add() -> vole::Result<()> {
    let relu = QuantReLU::<CpuBackend>::uint8()?;
    let x = CpuTensor::randn((3, 3), DType::F32, &DEV)?;
    let q = relu.quant_forward(&x)?;
    assert!(!q.signed());
    assert!(q.value().min_all()?.to_scalar_f64()? >= 0.0);

    let sum = (&q + &q)?;
    assert_eq!(sum.bit_width(), 9);
    assert!(!sum.signed());
    let neg = (-&q)?;
    assert!(neg.signed());
    assert_eq!(neg.bit_width(), 9);
    Ok(())
}

#[test]
fn test_forward_returns_dequantized_value() -> vole::Result<()> {
    let quant = QuantIdentity::<CpuBackend>::new(QuantConfig::int4())?;
    let x = CpuTensor::from_f64_slice(&[-0.7, 0.33, 0.7], 3, DType::F64, &DEV)?;
    let y = quant.forward(&x)?;
    // 4-bit signed: scale 0.1, codes -7, 3, 7
    assert_vec_approx(&y.to_f64_vec()?, &[-0.7, 0.3, 0.7], 1e-9);
    Ok(())
}

#[test]
fn test_config_json_round_trip() -> vole::Result<()> {
    let config = QuantConfig::int8_per_channel(vec![8, 1, 1, 1], vec![0, 1, 2, 3])
        .with_stats(ScalingStats::AbsPercentile(99.9));
    let json = config.to_json()?;
    let back = QuantConfig::from_json(&json)?;
    assert_eq!(back, config);
    assert!(QuantConfig::from_json(r#"{"bit_width": 40}"#).is_err());
    Ok(())
}
