use super::*;

fn params(bits: u32, compute_type: ComputeType, scale_dtype: ScaleDtype) -> PackParams {
    PackParams { bits, block_size: 32, scale_dtype, compute_type }
}

fn weight(n: usize, k: usize) -> Vec<f32> {
    (0..n * k).map(|i| ((i * 37 % 101) as f32 - 50.0) / 25.0).collect()
}

#[test]
fn test_pack_rejects_invalid_parameters() {
    let src = weight(4, 64);

    assert!(pack_weight(&src, 4, 64, &params(5, ComputeType::Int8, ScaleDtype::Fp32)).is_none());
    assert!(pack_weight(&src, 4, 64, &params(4, ComputeType::Native, ScaleDtype::Fp32)).is_none());
    assert!(pack_weight(&src, 4, 64, &PackParams { block_size: 0, ..params(4, ComputeType::Int8, ScaleDtype::Fp32) })
        .is_none());
    assert!(pack_weight(&src, 4, 64, &PackParams { block_size: 48, ..params(4, ComputeType::Int8, ScaleDtype::Fp32) })
        .is_none());
    assert!(pack_weight(&src[..10], 4, 64, &params(4, ComputeType::Int8, ScaleDtype::Fp32)).is_none());
}

#[test]
fn test_pack_int4_error_within_half_step() {
    let (n, k) = (50, 64);
    let src = weight(n, k);

    let packed = pack_weight(&src, n, k, &params(4, ComputeType::Int8, ScaleDtype::Fp32)).unwrap();

    assert_eq!(packed.kind(), PackedKind::S4);
    assert_eq!(packed.n_tile(), 48);
    assert_eq!(packed.k_blocks(), 2);

    let restored = packed.dequantize();
    for col in 0..n {
        for kk in 0..k {
            let scale = packed.scale(col, kk / 32);
            let (v, d) = (src[col * k + kk], restored[col * k + kk]);
            assert!((v - d).abs() <= scale * 0.5 + 1e-6, "col {col} k {kk}: {v} vs {d}");
        }
    }
}

#[test]
fn test_pack_int8_codes_are_symmetric() {
    let (n, k) = (2, 32);
    let mut src = vec![0.0; n * k];
    src[0] = 1.27;
    src[1] = -1.27;
    src[32] = 0.5;

    let packed = pack_weight(&src, n, k, &params(8, ComputeType::Fp32, ScaleDtype::Fp32)).unwrap();

    assert_eq!(packed.code(0, 0), 127);
    assert_eq!(packed.code(0, 1), -127);
    assert_eq!(packed.code(1, 0), 127);
    assert!((packed.scale(0, 0) - 0.01).abs() < 1e-7);
}

#[test]
fn test_column_block_matches_code() {
    let (n, k) = (3, 64);
    let src = weight(n, k);
    let packed = pack_weight(&src, n, k, &params(4, ComputeType::Bf16, ScaleDtype::Bf16)).unwrap();

    let mut out = vec![0i8; 32];
    packed.column_block(2, 1, &mut out);

    assert_eq!(packed.n_tile(), 64);
    for (j, &q) in out.iter().enumerate() {
        assert_eq!(q, packed.code(2, 32 + j));
        assert!((-8..=7).contains(&q));
    }
}

#[test]
fn test_scales_rounded_through_scale_dtype() {
    let (n, k) = (1, 32);
    let src: Vec<f32> = (0..k).map(|i| i as f32 * 0.0123).collect();

    let packed = pack_weight(&src, n, k, &params(4, ComputeType::Int8, ScaleDtype::Fp16)).unwrap();

    let scale = packed.scale(0, 0);
    assert_eq!(scale, half::f16::from_f32(scale).to_f32());
}

#[test]
fn test_serialization_preserves_weight() {
    let (n, k) = (70, 64);
    let src = weight(n, k);

    for scale_dtype in [ScaleDtype::Fp16, ScaleDtype::Fp32, ScaleDtype::Bf16] {
        let packed = pack_weight(&src, n, k, &params(4, ComputeType::Int8, scale_dtype)).unwrap();
        let mut bytes = packed.to_bytes().unwrap();
        assert_eq!(bytes.len(), packed.serialized_size());

        // trailing bytes belong to the next record
        bytes.extend_from_slice(&[0xAB; 5]);
        let (restored, consumed) = PackedWeight::from_bytes(&bytes).unwrap();

        assert_eq!(consumed, packed.serialized_size());
        assert_eq!(restored, packed);
    }
}

#[test]
fn test_read_packed_payload_from_stream() {
    let (n, k) = (5, 32);
    let packed = pack_weight(&weight(n, k), n, k, &params(8, ComputeType::Int8, ScaleDtype::Fp32)).unwrap();
    let bytes = packed.to_bytes().unwrap();

    let mut data = bytes.clone();
    data.extend_from_slice(&[1, 2, 3]);
    let mut stream = std::io::Cursor::new(data);
    let payload = read_packed_payload(&mut stream).unwrap();

    assert_eq!(payload, bytes);
    assert_eq!(stream.position() as usize, bytes.len());
}

#[test]
fn test_layout_rejects_mismatched_tile() {
    let (n, k) = (5, 32);
    let packed = pack_weight(&weight(n, k), n, k, &params(4, ComputeType::Int8, ScaleDtype::Fp32)).unwrap();
    let mut bytes = packed.to_bytes().unwrap();

    // claim bf16 compute while keeping the int8 tile width
    bytes[8..12].copy_from_slice(&ComputeType::Bf16.code().to_le_bytes());

    let err = PackedLayout::parse(&bytes).unwrap_err();
    assert!(err.to_string().contains("tile width"));
}

#[test]
fn test_histogram_counts_real_columns_only() {
    let (n, k) = (5, 32);
    let packed = pack_weight(&weight(n, k), n, k, &params(4, ComputeType::Int8, ScaleDtype::Fp32)).unwrap();

    assert_eq!(packed.histogram().total(), (n * k) as u64);
}
