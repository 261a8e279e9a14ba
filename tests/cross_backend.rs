//! Cross-backend agreement: the bytecode VM (and optionally WebGPU) must
//! match the reference interpreter within documented tolerances.

use approx::relative_eq;
use microjax::{Array, DType, Device};

fn assert_close(a: &[f32], b: &[f32], rtol: f32, atol: f32, what: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", what);
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        if x.is_nan() && y.is_nan() {
            continue;
        }
        assert!(
            relative_eq!(x, y, epsilon = atol, max_relative = rtol),
            "{} at {}: cpu={} other={} (rtol {}, atol {})",
            what,
            i,
            x,
            y,
            rtol,
            atol
        );
    }
}

fn on_wasm(x: &Array) -> Array {
    x.to_device(Device::Wasm).unwrap()
}

#[test]
fn test_wasm_elementwise_matches_cpu() {
    let x = Array::from_vec(vec![0.5, 1.0, 1.5, -2.0, 3.25, -0.125], &[6]);
    let cpu = x.add(&x).mul(&x).sub_scalar(1.0).to_vec();
    let xw = on_wasm(&x);
    let wasm = xw.add(&xw).mul(&xw).sub_scalar(1.0).to_vec();
    assert_close(&cpu, &wasm, 0.0, 0.0, "fused arithmetic");
}

#[test]
fn test_wasm_transcendentals_within_bounds() {
    let x = Array::from_vec(vec![0.1, 0.7, 1.3, 2.9, -1.1, -0.4], &[6]);
    let xw = on_wasm(&x);

    assert_close(&x.exp().to_vec(), &xw.exp().to_vec(), 3e-7, 1e-7, "exp");
    assert_close(&x.sin().to_vec(), &xw.sin().to_vec(), 0.0, 5e-7, "sin");
    assert_close(&x.cos().to_vec(), &xw.cos().to_vec(), 0.0, 5e-7, "cos");
    assert_close(&x.atan().to_vec(), &xw.atan().to_vec(), 2e-6, 1e-7, "atan");
    assert_close(&x.erf().to_vec(), &xw.erf().to_vec(), 2e-6, 2e-6, "erf");

    let pos = Array::from_vec(vec![0.1, 0.7, 1.3, 2.9, 11.0, 123.0], &[6]);
    assert_close(
        &pos.log().to_vec(),
        &on_wasm(&pos).log().to_vec(),
        5e-7,
        1e-7,
        "log",
    );
}

#[test]
fn test_wasm_reductions_match_cpu() {
    let x = Array::from_vec((1..=24).map(|v| v as f32).collect(), &[4, 6]);
    let xw = on_wasm(&x);
    assert_eq!(x.sum(Some(1), false).to_vec(), xw.sum(Some(1), false).to_vec());
    assert_eq!(x.max(Some(0), false).to_vec(), xw.max(Some(0), false).to_vec());
    assert_eq!(x.mean(None, false).to_vec(), xw.mean(None, false).to_vec());
}

#[test]
fn test_wasm_matmul_matches_cpu() {
    let a = Array::from_vec((0..12).map(|v| v as f32 * 0.5).collect(), &[3, 4]);
    let b = Array::from_vec((0..12).map(|v| v as f32 - 6.0).collect(), &[4, 3]);
    let cpu = a.matmul(&b).to_vec();
    let wasm = on_wasm(&a).matmul(&on_wasm(&b)).to_vec();
    assert_close(&cpu, &wasm, 1e-6, 1e-6, "matmul");
}

#[test]
fn test_wasm_movement_and_int_ops() {
    let x = Array::from_vec_i32(vec![5, 3, 8, 1, 9, 2], &[2, 3]);
    let xw = x.to_device(Device::Wasm).unwrap();
    assert_eq!(
        x.transpose(None).reshape(&[6]).to_vec_i32(),
        xw.transpose(None).reshape(&[6]).to_vec_i32()
    );
    assert_eq!(x.argmax(Some(1), false).to_vec_i32(), xw.argmax(Some(1), false).to_vec_i32());
}

#[test]
fn test_threefry_bit_exact_across_backends() {
    // The PRNG routine runs the same host code everywhere.
    let k_cpu = microjax::random::key(42);
    let bits_cpu = microjax::random::random_bits(&k_cpu, 16).to_vec_u32();

    let k_wasm = k_cpu.to_device(Device::Wasm).unwrap();
    let bits_wasm = microjax::random::random_bits(&k_wasm, 16).to_vec_u32();
    assert_eq!(bits_cpu, bits_wasm);
}

#[test]
fn test_wasm_routines_bit_equal() {
    let x = Array::from_vec(vec![3.5, -1.0, 2.25, 0.0, 7.5, -3.25], &[6]);
    let cpu = x.sort(-1).to_vec();
    let wasm = on_wasm(&x).sort(-1).to_vec();
    assert_eq!(cpu, wasm);
}

#[cfg(feature = "webgpu")]
mod webgpu {
    use super::*;

    fn gpu_available() -> bool {
        !microjax::init(&[Device::WebGpu]).is_empty()
    }

    fn on_gpu(x: &Array) -> Array {
        x.to_device(Device::WebGpu).unwrap()
    }

    #[test]
    fn test_gpu_elementwise_matches_cpu() {
        if !gpu_available() {
            return;
        }
        let x = Array::from_vec(vec![1.0, -2.0, 3.0, -4.0], &[4]);
        let cpu = x.add(&x).mul(&x).to_vec();
        let xg = on_gpu(&x);
        let gpu = xg.add(&xg).mul(&xg).to_vec();
        assert_close(&cpu, &gpu, 1e-6, 1e-6, "gpu arithmetic");
    }

    #[test]
    fn test_gpu_tuned_matmul_matches_null_tuner() {
        if !gpu_available() {
            return;
        }
        // 64x64 triggers the upcast/unroll path on the GPU; the CPU runs
        // the null plan. Element-wise equality within float tolerance is
        // the tuner's semantic contract.
        let n = 64;
        let a = Array::from_vec((0..n * n).map(|v| (v % 7) as f32 * 0.25).collect(), &[n, n]);
        let b = Array::from_vec((0..n * n).map(|v| (v % 5) as f32 - 2.0).collect(), &[n, n]);
        let cpu = a.matmul(&b).to_vec();
        let gpu = on_gpu(&a).matmul(&on_gpu(&b)).to_vec();
        assert_close(&cpu, &gpu, 1e-5, 1e-4, "tuned matmul");
    }

    #[test]
    fn test_gpu_grouped_reduction_matches_cpu() {
        if !gpu_available() {
            return;
        }
        let x = Array::from_vec((0..4096).map(|v| (v as f32).sin()).collect(), &[4096]);
        let cpu = x.sum(None, false).to_vec();
        let gpu = on_gpu(&x).sum(None, false).to_vec();
        assert_close(&cpu, &gpu, 1e-5, 1e-3, "grouped sum");
    }
}
