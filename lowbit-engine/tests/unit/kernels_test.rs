use super::*;
use lowbit_quant::{PackParams, ScaleDtype, encode, pack_weight};

fn matrix(rows: usize, cols: usize, seed: f32) -> Vec<f32> {
    (0..rows * cols).map(|i| (i as f32 * 0.37 + seed).sin() * 2.0).collect()
}

fn reference(w: &[f32], x: &[f32], n: usize, m: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0; m * n];
    for r in 0..m {
        for c in 0..n {
            out[r * n + c] = (0..k).map(|kk| x[r * k + kk] * w[c * k + kk]).sum();
        }
    }
    out
}

fn run_full(kernel: &Microkernel, w: &WeightRef<'_>, a: &Activation<'_>, m: usize) -> Vec<f32> {
    let n = w.n();
    let mut out = vec![0.0; m * n];
    kernel.run(w, a, Tile { row: 0, col: 0, rows: m, cols: n }, &mut out, n);
    out
}

fn run_tiled(kernel: &Microkernel, w: &WeightRef<'_>, a: &Activation<'_>, m: usize, mr: usize, nr: usize) -> Vec<f32> {
    let n = w.n();
    let mut out = vec![0.0; m * n];
    for row in (0..m).step_by(mr) {
        for col in (0..n).step_by(nr) {
            let tile = Tile { row, col, rows: mr.min(m - row), cols: nr.min(n - col) };
            kernel.run(w, a, tile, &mut out[row * n + col..], n);
        }
    }
    out
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "element {i}: {x} vs {y}");
    }
}

fn packed(bits: u32, compute_type: ComputeType, w: &[f32], n: usize, k: usize) -> PackedWeight {
    let params = PackParams { bits, block_size: 32, scale_dtype: ScaleDtype::Fp32, compute_type };
    pack_weight(w, n, k, &params).unwrap()
}

#[test]
fn test_generic_cpu_has_no_int8_or_bf16_kernels() {
    let registry = KernelRegistry::with_features(CpuFeatures::default());

    assert!(registry.select(KernelFamily::PackedInt8, 4).is_err());
    assert!(registry.select(KernelFamily::PackedBf16, 4).is_err());

    let fp32 = registry.select(KernelFamily::PackedFp32, 8).unwrap();
    assert_eq!((fp32.tier, fp32.mr, fp32.nr), (KernelTier::Generic, 4, 48));
    assert!(registry.select(KernelFamily::Blocks, 5).is_ok());
    assert!(!registry.has_blas());
}

#[test]
fn test_tier_preference() {
    let vnni = CpuFeatures { avx512f: true, avx512_vnni: true, ..CpuFeatures::default() };
    let registry = KernelRegistry::with_features(vnni);
    let int8 = registry.select(KernelFamily::PackedInt8, 8).unwrap();
    assert_eq!((int8.tier, int8.mr, int8.nr), (KernelTier::Vnni, 3, 48));
    assert_eq!(registry.select(KernelFamily::PackedFp32, 4).unwrap().tier, KernelTier::Avx512);

    let amx = CpuFeatures { amx_tile: true, amx_int8: true, amx_bf16: true, ..vnni };
    let registry = KernelRegistry::with_features(amx);
    let int8 = registry.select(KernelFamily::PackedInt8, 4).unwrap();
    assert_eq!((int8.tier, int8.mr, int8.nr), (KernelTier::Amx, 16, 48));
    let bf16 = registry.select(KernelFamily::PackedBf16, 4).unwrap();
    assert_eq!((bf16.tier, bf16.mr, bf16.nr), (KernelTier::Amx, 16, 64));

    // bf16 kernels only exist for 4-bit weights
    assert!(registry.select(KernelFamily::PackedBf16, 8).is_err());
}

#[test]
fn test_avx512_bf16_without_amx() {
    let features = CpuFeatures { avx512f: true, avx512_bf16: true, ..CpuFeatures::default() };
    let registry = KernelRegistry::with_features(features);

    let bf16 = registry.select(KernelFamily::PackedBf16, 4).unwrap();
    assert_eq!((bf16.tier, bf16.mr, bf16.nr), (KernelTier::Avx512, 8, 64));
}

#[test]
fn test_quantize_row_per_block() {
    let row: Vec<f32> = (0..64).map(|i| if i < 32 { i as f32 } else { -0.5 }).collect();

    let q = QuantizedRow::quantize(&row, 32);

    assert_eq!(q.scales.len(), 2);
    assert!((q.scales[0] - 31.0 / 127.0).abs() < 1e-7);
    assert_eq!(q.codes[31], 127);
    assert_eq!(q.codes[32], -127);

    let zeros = QuantizedRow::quantize(&[0.0; 32], 32);
    assert_eq!(zeros.scales, vec![0.0]);
    assert!(zeros.codes.iter().all(|&c| c == 0));
}

#[test]
fn test_dense_kernel_matches_reference() {
    let (n, m, k) = (20, 5, 24);
    let w = matrix(n, k, 0.1);
    let x = matrix(m, k, 0.7);
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::F32 { data: &w, n, k };
    let act = Activation::F32 { data: &x, k };

    let out = run_full(registry.select_for(&weight).unwrap(), &weight, &act, m);

    assert_close(&out, &reference(&w, &x, n, m, k), 1e-4);
}

#[test]
fn test_f16_kernel_rounds_weights() {
    let (n, m, k) = (3, 2, 8);
    let w = matrix(n, k, 0.3);
    let w16: Vec<half::f16> = w.iter().map(|&v| half::f16::from_f32(v)).collect();
    let rounded: Vec<f32> = w16.iter().map(|v| v.to_f32()).collect();
    let x = matrix(m, k, 0.9);
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::F16 { data: &w16, n, k };

    let out = run_full(registry.select_for(&weight).unwrap(), &weight, &Activation::F32 { data: &x, k }, m);

    assert_close(&out, &reference(&rounded, &x, n, m, k), 1e-5);
}

#[test]
fn test_block_kernel_matches_decoded_reference() {
    let (n, m, k) = (6, 3, 64);
    let w = matrix(n, k, 1.3);
    let x = matrix(m, k, 0.2);
    let encoded = encode(&w, 32, BlockFormat::Q5_1).unwrap();
    let decoded = lowbit_quant::codec::decode_to_vec(&encoded.data, BlockFormat::Q5_1, n * k).unwrap();
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::Blocks { format: BlockFormat::Q5_1, data: &encoded.data, n, k };

    let out = run_full(registry.select_for(&weight).unwrap(), &weight, &Activation::F32 { data: &x, k }, m);

    assert_close(&out, &reference(&decoded, &x, n, m, k), 1e-4);
}

#[test]
fn test_packed_fp32_kernel_matches_dequantized_reference() {
    let (n, m, k) = (50, 4, 64);
    let w = matrix(n, k, 0.5);
    let x = matrix(m, k, 1.1);
    let pw = packed(4, ComputeType::Fp32, &w, n, k);
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::Packed(&pw);
    assert_eq!(weight.family(), KernelFamily::PackedFp32);

    let out = run_full(registry.select_for(&weight).unwrap(), &weight, &Activation::F32 { data: &x, k }, m);

    assert_close(&out, &reference(&pw.dequantize(), &x, n, m, k), 1e-3);
}

#[test]
fn test_packed_int8_kernel_is_close_to_float_result() {
    let (n, m, k) = (10, 3, 64);
    let w = matrix(n, k, 0.4);
    let x = matrix(m, k, 2.1);
    let pw = packed(8, ComputeType::Int8, &w, n, k);
    let rows: Vec<QuantizedRow> = x.chunks(k).map(|row| QuantizedRow::quantize(row, 32)).collect();
    let row_refs: Vec<&QuantizedRow> = rows.iter().collect();
    let features = CpuFeatures { avx512f: true, avx512_vnni: true, ..CpuFeatures::default() };
    let registry = KernelRegistry::with_features(features);
    let weight = WeightRef::Packed(&pw);

    let out = run_full(registry.select_for(&weight).unwrap(), &weight, &Activation::Int8 { rows: &row_refs }, m);

    // two quantization steps, each within half a code of 1/127 of the block maximum
    assert_close(&out, &reference(&w, &x, n, m, k), 0.5);
}

#[test]
fn test_results_do_not_depend_on_tiling() {
    let (n, m, k) = (50, 7, 96);
    let w = matrix(n, k, 0.6);
    let x = matrix(m, k, 0.8);
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let act = Activation::F32 { data: &x, k };

    let pw = packed(4, ComputeType::Fp32, &w, n, k);
    let weight = WeightRef::Packed(&pw);
    let kernel = registry.select_for(&weight).unwrap();
    assert_eq!(run_full(kernel, &weight, &act, m), run_tiled(kernel, &weight, &act, m, 3, 7));

    let dense = WeightRef::F32 { data: &w, n, k };
    let kernel = registry.select_for(&dense).unwrap();
    assert_eq!(run_full(kernel, &dense, &act, m), run_tiled(kernel, &dense, &act, m, 2, 16));
}

#[test]
fn test_epilogue() {
    let mut dst = vec![1.0, 2.0];

    Epilogue::Accumulate.apply(&mut dst, &[0.5, 0.5]);
    assert_eq!(dst, vec![1.5, 2.5]);

    Epilogue::Write.apply(&mut dst, &[3.0, 4.0]);
    assert_eq!(dst, vec![3.0, 4.0]);
}
