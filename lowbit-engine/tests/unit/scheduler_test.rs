use super::*;
use crate::kernels::{CpuFeatures, KernelRegistry};
use lowbit_quant::{ComputeType, PackParams, ScaleDtype, pack_weight};

fn coverage(m: usize, n: usize, regions: &[Tile]) -> Vec<u32> {
    let mut hits = vec![0u32; m * n];
    for region in regions {
        for r in region.row..region.row + region.rows {
            for c in region.col..region.col + region.cols {
                hits[r * n + c] += 1;
            }
        }
    }
    hits
}

fn matrix(rows: usize, cols: usize, seed: f32) -> Vec<f32> {
    (0..rows * cols).map(|i| (i as f32 * 0.61 + seed).cos()).collect()
}

#[test]
fn test_partition_covers_output_exactly_once() {
    for &(m, n, threads, mr, nr) in
        &[(1, 100, 4, 4, 16), (7, 300, 8, 3, 48), (64, 64, 3, 16, 48), (5, 5, 16, 4, 16), (33, 1000, 6, 8, 48)]
    {
        let regions = partition(m, n, threads, mr, nr);

        assert!(!regions.is_empty() && regions.len() <= threads);
        assert!(coverage(m, n, &regions).iter().all(|&h| h == 1), "m={m} n={n} threads={threads}");
        for region in &regions {
            assert_eq!(region.row % mr, 0);
            assert_eq!(region.col % nr, 0);
            assert!(region.rows > 0 && region.cols > 0);
        }
    }
}

#[test]
fn test_partition_is_deterministic() {
    assert_eq!(partition(37, 517, 6, 4, 48), partition(37, 517, 6, 4, 48));
}

#[test]
fn test_partition_splits_columns_for_single_row() {
    let regions = partition(1, 480, 4, 4, 48);

    assert_eq!(regions.len(), 4);
    assert!(regions.iter().all(|r| r.row == 0 && r.rows == 1));
}

#[test]
fn test_partition_uses_rows_when_columns_run_out() {
    // one column tile, so rows carry the parallelism
    let regions = partition(64, 40, 4, 16, 48);

    assert_eq!(regions.len(), 4);
    assert!(regions.iter().all(|r| r.cols == 40 && r.rows == 16));
}

#[test]
fn test_partition_empty_problem() {
    assert!(partition(0, 10, 4, 4, 16).is_empty());
    assert!(partition(3, 0, 4, 4, 16).is_empty());
}

#[test]
fn test_parse_cache_size() {
    assert_eq!(parse_cache_size("2048K\n"), Some(2 * 1024 * 1024));
    assert_eq!(parse_cache_size("1M"), Some(1024 * 1024));
    assert_eq!(parse_cache_size("512"), Some(512));
    assert_eq!(parse_cache_size(""), None);
    assert_eq!(parse_cache_size("abcK"), None);
}

#[test]
fn test_column_step_is_a_multiple_of_the_tile_width() {
    let scheduler = Scheduler::with_l2_size(1, 64 * 1024).unwrap();
    let w = vec![0.0f32; 8 * 1024];
    let weight = WeightRef::F32 { data: &w, n: 8, k: 1024 };

    // 32 KiB of 4 KiB columns is 8 columns, raised to one tile of 16
    assert_eq!(scheduler.column_step(&weight, 16), 16);
    assert_eq!(scheduler.column_step(&weight, 4), 8);
}

#[test]
fn test_matmul_is_independent_of_thread_count() {
    let (n, m, k) = (100, 9, 64);
    let w = matrix(n, k, 0.2);
    let x = matrix(m, k, 1.4);
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::F32 { data: &w, n, k };
    let kernel = registry.select_for(&weight).unwrap();
    let scheduler = Scheduler::with_l2_size(4, 4096).unwrap();

    let mut single = vec![0.0; m * n];
    scheduler.matmul(kernel, &weight, &x, m, &mut single, Epilogue::Write, 1).unwrap();
    let mut parallel = vec![0.0; m * n];
    scheduler.matmul(kernel, &weight, &x, m, &mut parallel, Epilogue::Write, 4).unwrap();

    assert_eq!(single, parallel);
    let expected: f32 = (0..k).map(|kk| x[kk] * w[kk]).sum();
    assert!((single[0] - expected).abs() < 1e-4);
}

#[test]
fn test_dynamic_path_matches_direct_kernel_call() {
    let (n, m, k) = (100, 5, 64);
    let w = matrix(n, k, 0.9);
    let x = matrix(m, k, 0.1);
    let params = PackParams { bits: 4, block_size: 32, scale_dtype: ScaleDtype::Fp16, compute_type: ComputeType::Int8 };
    let packed = pack_weight(&w, n, k, &params).unwrap();
    let features = CpuFeatures { amx_tile: true, amx_int8: true, ..CpuFeatures::default() };
    let registry = KernelRegistry::with_features(features);
    let weight = WeightRef::Packed(&packed);
    let kernel = registry.select_for(&weight).unwrap();
    assert!(kernel.family.is_dynamic());

    let rows: Vec<QuantizedRow> = x.chunks(k).map(|row| QuantizedRow::quantize(row, 32)).collect();
    let row_refs: Vec<&QuantizedRow> = rows.iter().collect();
    let mut expected = vec![0.0; m * n];
    kernel.run(&weight, &Activation::Int8 { rows: &row_refs }, Tile { row: 0, col: 0, rows: m, cols: n }, &mut expected, n);

    let scheduler = Scheduler::with_l2_size(3, DEFAULT_L2_BYTES).unwrap();
    for threads in [1, 2, 3] {
        let mut out = vec![0.0; m * n];
        scheduler.matmul(kernel, &weight, &x, m, &mut out, Epilogue::Write, threads).unwrap();
        assert_eq!(out, expected, "threads={threads}");
    }
}

#[test]
fn test_bf16_path_rounds_activations() {
    let (n, m, k) = (64, 2, 32);
    let w = matrix(n, k, 0.3);
    let x = matrix(m, k, 0.5);
    let params = PackParams { bits: 4, block_size: 32, scale_dtype: ScaleDtype::Bf16, compute_type: ComputeType::Bf16 };
    let packed = pack_weight(&w, n, k, &params).unwrap();
    let registry = KernelRegistry::with_features(CpuFeatures { avx512f: true, avx512_bf16: true, ..CpuFeatures::default() });
    let weight = WeightRef::Packed(&packed);
    let kernel = registry.select_for(&weight).unwrap();

    let rounded: Vec<f32> = x.iter().map(|&v| bf16::from_f32(v).to_f32()).collect();
    let mut expected = vec![0.0; m * n];
    kernel.run(&weight, &Activation::F32 { data: &rounded, k }, Tile { row: 0, col: 0, rows: m, cols: n }, &mut expected, n);

    let scheduler = Scheduler::with_l2_size(2, DEFAULT_L2_BYTES).unwrap();
    let mut out = vec![0.0; m * n];
    scheduler.matmul(kernel, &weight, &x, m, &mut out, Epilogue::Write, 2).unwrap();

    assert_eq!(out, expected);
}

#[test]
fn test_accumulate_epilogue_adds_residual() {
    let (n, m, k) = (4, 1, 2);
    let w = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0];
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::F32 { data: &w, n, k };
    let kernel = registry.select_for(&weight).unwrap();
    let scheduler = Scheduler::with_l2_size(2, DEFAULT_L2_BYTES).unwrap();

    let mut out = vec![10.0; 4];
    scheduler.matmul(kernel, &weight, &[2.0, 3.0], m, &mut out, Epilogue::Accumulate, 2).unwrap();

    assert_eq!(out, vec![12.0, 13.0, 15.0, 10.0]);
}

#[test]
fn test_matmul_rejects_mismatched_shapes() {
    let w = vec![0.0; 8];
    let registry = KernelRegistry::with_features(CpuFeatures::default());
    let weight = WeightRef::F32 { data: &w, n: 2, k: 4 };
    let kernel = registry.select_for(&weight).unwrap();
    let scheduler = Scheduler::with_l2_size(1, DEFAULT_L2_BYTES).unwrap();

    let mut out = vec![0.0; 2];
    assert!(scheduler.matmul(kernel, &weight, &[0.0; 3], 1, &mut out, Epilogue::Write, 1).is_err());

    let f16_kernel = registry.select(KernelFamily::DenseF16, 16).unwrap();
    assert!(scheduler.matmul(f16_kernel, &weight, &[0.0; 4], 1, &mut out, Epilogue::Write, 1).is_err());
}
