use super::*;
use crate::config::{ComputeType, QuantAlgorithm};
use crate::format::BlockFormat;
use crate::record::TensorRecord;
use std::io::Cursor;

fn values(n: usize, seed: usize) -> Vec<f32> {
    (0..n).map(|i| (((i + seed) * 31 % 97) as f32 - 48.0) / 40.0).collect()
}

fn source_records() -> Vec<TensorRecord> {
    vec![
        TensorRecord::from_f32("token_embd.weight", &[64, 4], &values(256, 1)).unwrap(),
        TensorRecord::from_f32("blk.0.attn_norm.weight", &[64], &values(64, 2)).unwrap(),
        TensorRecord::from_f16("blk.0.attn_q.weight", &[64, 3], &values(192, 3)).unwrap(),
        TensorRecord::from_f32("blk.0.attn_q.bias", &[64, 1], &values(64, 4)).unwrap(),
        TensorRecord::from_f32("output.weight", &[32, 5], &values(160, 5)).unwrap(),
    ]
}

fn stream(records: &[TensorRecord]) -> Vec<u8> {
    let mut bytes = Vec::new();
    records.iter().for_each(|r| r.write_to(&mut bytes).unwrap());
    bytes
}

fn read_all(bytes: Vec<u8>) -> Vec<TensorRecord> {
    let mut cursor = Cursor::new(bytes);
    let mut records = Vec::new();
    while let Some(record) = TensorRecord::read_from(&mut cursor).unwrap() {
        records.push(record);
    }
    records
}

fn config(bits: u32, compute_type: ComputeType) -> QuantConfig {
    QuantConfig { bits, compute_type, nthread: 2, ..QuantConfig::default() }
}

#[test]
fn test_filter_patterns_are_anchored() {
    let filter = TensorFilter::new(&["blk\\..*\\.weight"], &["blk\\.0\\..*"]).unwrap();

    assert!(filter.selects("blk.1.attn_q.weight"));
    assert!(!filter.selects("blk.0.attn_q.weight"));
    assert!(!filter.selects("blk.1.attn_q.weight.extra"));
    assert!(!filter.selects("xblk.1.attn_q.weight"));
}

#[test]
fn test_filter_rejects_invalid_pattern() {
    assert!(TensorFilter::new(&["("], &[]).is_err());
}

#[test]
fn test_transcode_fidelity() {
    let source = source_records();
    let filter = TensorFilter::new(&[DEFAULT_INCLUDE], &["output\\.weight"]).unwrap();

    let mut out = Vec::new();
    let report = recode_file(&mut Cursor::new(stream(&source)), &mut out, &filter, &config(4, ComputeType::Native))
        .unwrap();

    let records = read_all(out);
    assert_eq!(records.len(), source.len());
    assert_eq!(report.n_tensors, 5);
    assert_eq!(report.n_quantized, 2);

    // token_embd and attn_q are selected and 2-D; the norm is 1-D, the bias does not match
    // and output.weight is excluded
    for (i, (src, dst)) in source.iter().zip(&records).enumerate() {
        assert_eq!(dst.header.name, src.header.name);
        assert_eq!(dst.header.ne, src.header.ne);
        if i == 0 || i == 2 {
            assert_eq!(dst.header.element_type, ElementType::Q4_0);
            assert_eq!(dst.payload.len(), src.header.n_elements() / 32 * 18);
        } else {
            assert_eq!(dst, src);
        }
    }

    assert_eq!(report.histogram.total(), (256 + 192) as u64);
}

#[test]
fn test_transcode_quantized_values_decode_close() {
    let source = vec![TensorRecord::from_f32("w.weight", &[32, 2], &values(64, 7)).unwrap()];
    let filter = TensorFilter::new(&[".*"], &[]).unwrap();
    let config = QuantConfig { alg: QuantAlgorithm::Asym, ..config(5, ComputeType::Native) };

    let mut out = Vec::new();
    recode_file(&mut Cursor::new(stream(&source)), &mut out, &filter, &config).unwrap();

    let record = &read_all(out)[0];
    assert_eq!(record.header.element_type, ElementType::Q5_1);
    let decoded = codec::decode_to_vec(&record.payload, BlockFormat::Q5_1, 64).unwrap();
    for (a, b) in values(64, 7).iter().zip(&decoded) {
        assert!((a - b).abs() < 0.05, "{a} vs {b}");
    }
}

#[test]
fn test_transcode_to_packed() {
    let source = source_records();
    let filter = TensorFilter::new(&["blk\\.0\\.attn_q\\.weight"], &[]).unwrap();

    let mut out = Vec::new();
    recode_file(&mut Cursor::new(stream(&source)), &mut out, &filter, &config(8, ComputeType::Int8)).unwrap();

    let records = read_all(out);
    assert_eq!(records[2].header.element_type, ElementType::Packed);
    let (packed, consumed) = crate::packed::PackedWeight::from_bytes(&records[2].payload).unwrap();
    assert_eq!(consumed, records[2].payload.len());
    assert_eq!((packed.n(), packed.k()), (3, 64));
    assert_eq!(records[3], source[3]);
}

#[test]
fn test_unsupported_type_is_fatal() {
    let mut bytes = Vec::new();
    let header = RecordHeader::new("blk.0.ffn_up.weight", ElementType::I8, &[32, 2]);
    header.write_to(&mut bytes).unwrap();
    bytes.extend_from_slice(&[0u8; 64]);

    let filter = TensorFilter::new(&[DEFAULT_INCLUDE], &[]).unwrap();
    let err = recode_file(&mut Cursor::new(bytes), &mut Vec::new(), &filter, &config(4, ComputeType::Native))
        .unwrap_err();

    assert!(err.to_string().contains("blk.0.ffn_up.weight"));
}

#[test]
fn test_row_length_must_fit_blocks() {
    let source = vec![TensorRecord::from_f32("w.weight", &[48, 2], &values(96, 0)).unwrap()];
    let filter = TensorFilter::new(&[DEFAULT_INCLUDE], &[]).unwrap();

    let result = recode_file(&mut Cursor::new(stream(&source)), &mut Vec::new(), &filter, &config(8, ComputeType::Native));

    assert!(result.is_err());
}

#[test]
fn test_invalid_config_fails_before_reading() {
    let filter = TensorFilter::new(&[DEFAULT_INCLUDE], &[]).unwrap();
    let invalid = config(8, ComputeType::Bf16);

    // the stream is garbage; validation must fail first
    let err = recode_file(&mut Cursor::new(vec![0xFFu8; 3]), &mut Vec::new(), &filter, &invalid).unwrap_err();

    assert!(err.downcast_ref::<crate::config::ConfigError>().is_some());
}
