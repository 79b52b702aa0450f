use super::*;
use std::io::Write;

fn config(bits: u32, alg: QuantAlgorithm, compute_type: ComputeType) -> QuantConfig {
    QuantConfig { bits, alg, compute_type, nthread: 2, ..QuantConfig::default() }
}

#[test]
fn test_default_config_is_native_q4_0() {
    let config = QuantConfig::default();

    assert_eq!(config.validate(), Ok(()));
    assert_eq!(config.block_size, 32);
    assert_eq!(config.scale_dtype, ScaleDtype::Fp16);
    assert_eq!(config.target_type(), ElementType::Q4_0);
}

#[test]
fn test_native_target_types() {
    use QuantAlgorithm::*;

    assert_eq!(config(4, Sym, ComputeType::Native).target_type(), ElementType::Q4_0);
    assert_eq!(config(4, Asym, ComputeType::Native).target_type(), ElementType::Q4_1);
    assert_eq!(config(5, Sym, ComputeType::Native).target_type(), ElementType::Q5_0);
    assert_eq!(config(5, Asym, ComputeType::Native).target_type(), ElementType::Q5_1);
    assert_eq!(config(8, Sym, ComputeType::Native).target_type(), ElementType::Q8_0);
}

#[test]
fn test_packed_target_type() {
    for compute in [ComputeType::Int8, ComputeType::Fp32, ComputeType::Bf16] {
        assert_eq!(config(4, QuantAlgorithm::Sym, compute).target_type(), ElementType::Packed);
    }
}

#[test]
fn test_invalid_combinations() {
    use QuantAlgorithm::*;

    assert_eq!(config(3, Sym, ComputeType::Native).validate(), Err(ConfigError::InvalidBits(3)));
    assert!(matches!(
        config(8, Sym, ComputeType::Bf16).validate(),
        Err(ConfigError::UnsupportedCombination { bits: 8, .. })
    ));
    assert!(config(5, Sym, ComputeType::Int8).validate().is_err());
    assert!(config(4, Asym, ComputeType::Fp32).validate().is_err());
    assert!(config(8, Asym, ComputeType::Native).validate().is_err());

    let zero_block = QuantConfig { block_size: 0, ..config(4, Sym, ComputeType::Int8) };
    assert_eq!(zero_block.validate(), Err(ConfigError::ZeroBlockSize));

    let native_block = QuantConfig { block_size: 128, ..config(4, Sym, ComputeType::Native) };
    assert_eq!(native_block.validate(), Err(ConfigError::NativeBlockSize(128)));

    let packed_block = QuantConfig { block_size: 128, ..config(4, Sym, ComputeType::Int8) };
    assert_eq!(packed_block.validate(), Ok(()));
}

#[test]
fn test_parse_names() {
    assert_eq!("ggml".parse::<ComputeType>(), Ok(ComputeType::Native));
    assert_eq!("int8".parse::<ComputeType>(), Ok(ComputeType::Int8));
    assert_eq!("asymmetric".parse::<QuantAlgorithm>(), Ok(QuantAlgorithm::Asym));
    assert_eq!("bf16".parse::<ScaleDtype>(), Ok(ScaleDtype::Bf16));

    let err = "int4".parse::<ComputeType>().unwrap_err();
    assert_eq!(err.to_string(), "Unknown compute type 'int4'");
    assert_eq!(ComputeType::Fp32.to_string(), "fp32");
}

#[test]
fn test_builder_overrides_base() {
    let base = config(8, QuantAlgorithm::Sym, ComputeType::Native);

    let built = QuantConfig::builder()
        .base(Some(base))
        .bits(Some(4))
        .compute_type(Some(ComputeType::Int8))
        .block_size(Some(64))
        .build()
        .unwrap();

    assert_eq!(built.bits, 4);
    assert_eq!(built.block_size, 64);
    assert_eq!(built.nthread, 2);
    assert_eq!(built.compute_type, ComputeType::Int8);
}

#[test]
fn test_builder_rejects_invalid() {
    let result = QuantConfig::builder().bits(Some(8)).compute_type(Some(ComputeType::Bf16)).build();
    assert!(result.is_err());
}

#[test]
fn test_scale_dtype_rounding() {
    assert_eq!(ScaleDtype::Fp32.round(0.1), 0.1);
    assert_eq!(ScaleDtype::Fp16.round(0.1), half::f16::from_f32(0.1).to_f32());
    assert_eq!(ScaleDtype::Bf16.round(0.1), half::bf16::from_f32(0.1).to_f32());
    assert_ne!(ScaleDtype::Bf16.round(0.1), 0.1);
}

#[test]
fn test_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"bits": 8, "alg": "sym", "compute_type": "fp32", "scale_dtype": "fp32", "thread_count": 3}}"#)
        .unwrap();

    let config = QuantConfig::from_json_file(file.path()).unwrap();

    assert_eq!(config.bits, 8);
    assert_eq!(config.compute_type, ComputeType::Fp32);
    assert_eq!(config.scale_dtype, ScaleDtype::Fp32);
    assert_eq!(config.nthread, 3);
    assert_eq!(config.block_size, 32);
}

#[test]
fn test_from_json_file_validates() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"bits": 8, "compute_type": "bf16"}}"#).unwrap();

    assert!(QuantConfig::from_json_file(file.path()).is_err());
}
