#[cfg(test)]
#[path = "../tests/unit/config_test.rs"]
mod config_test;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::format::{BlockFormat, ElementType, QK};
use crate::packed::PackParams;

/// Quantization configuration errors, reported before any file is touched.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Unsupported bit width {0}: expected 4, 5 or 8")]
    InvalidBits(u32),
    #[error("Block size must be positive")]
    ZeroBlockSize,
    #[error("Native block formats use a fixed block size of {QK}, got {0}")]
    NativeBlockSize(usize),
    #[error("Thread count must be positive")]
    ZeroThreads,
    #[error("{bits}-bit {alg} quantization is not supported with {compute} compute")]
    UnsupportedCombination { bits: u32, alg: QuantAlgorithm, compute: ComputeType },
    #[error("Unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantAlgorithm {
    #[serde(alias = "symmetric")]
    Sym,
    #[serde(alias = "asymmetric")]
    Asym,
}

/// Storage precision of per-block scales in packed weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDtype {
    Fp16,
    Fp32,
    Bf16,
}

/// Precision the matrix multiply runs in.
///
/// `Native` keeps the legacy block formats; the others produce packed weights for
/// the matching kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    #[serde(alias = "ggml")]
    Native,
    Int8,
    Fp32,
    Bf16,
}

macro_rules! impl_names {
    ($ty:ty, $field:literal, [$(($variant:path, $name:literal $(, $alias:literal)*)),+]) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name $(| $alias)* => Ok($variant),)+
                    other => Err(ConfigError::UnknownValue { field: $field, value: other.to_string() }),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

impl_names!(QuantAlgorithm, "algorithm", [(QuantAlgorithm::Sym, "sym", "symmetric"), (QuantAlgorithm::Asym, "asym", "asymmetric")]);
impl_names!(ScaleDtype, "scale dtype", [(ScaleDtype::Fp16, "fp16"), (ScaleDtype::Fp32, "fp32"), (ScaleDtype::Bf16, "bf16")]);
impl_names!(
    ComputeType,
    "compute type",
    [(ComputeType::Native, "native", "ggml"), (ComputeType::Int8, "int8"), (ComputeType::Fp32, "fp32"), (ComputeType::Bf16, "bf16")]
);

impl ScaleDtype {
    pub fn code(self) -> u32 {
        match self {
            Self::Fp16 => 0,
            Self::Fp32 => 1,
            Self::Bf16 => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Fp16),
            1 => Some(Self::Fp32),
            2 => Some(Self::Bf16),
            _ => None,
        }
    }

    /// Bytes per serialized scale.
    pub fn size(self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 | Self::Bf16 => 2,
        }
    }

    /// Rounds `value` to the precision it will be stored with.
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::Fp32 => value,
            Self::Fp16 => half::f16::from_f32(value).to_f32(),
            Self::Bf16 => half::bf16::from_f32(value).to_f32(),
        }
    }
}

impl ComputeType {
    pub fn code(self) -> u32 {
        match self {
            Self::Native => 0,
            Self::Int8 => 1,
            Self::Fp32 => 2,
            Self::Bf16 => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Native),
            1 => Some(Self::Int8),
            2 => Some(Self::Fp32),
            3 => Some(Self::Bf16),
            _ => None,
        }
    }
}

/// Quantization parameters for a transcode run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    pub bits: u32,
    #[serde(alias = "algorithm")]
    pub alg: QuantAlgorithm,
    pub block_size: usize,
    pub scale_dtype: ScaleDtype,
    pub compute_type: ComputeType,
    #[serde(alias = "thread_count")]
    pub nthread: usize,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            alg: QuantAlgorithm::Sym,
            block_size: QK,
            scale_dtype: ScaleDtype::Fp16,
            compute_type: ComputeType::Native,
            nthread: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

impl QuantConfig {
    pub fn builder() -> QuantConfigBuilder {
        QuantConfigBuilder::default()
    }

    /// Loads a configuration from a JSON object; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read quantization config: {}", path.display()))?;
        let config: QuantConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse quantization config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.bits, 4 | 5 | 8) {
            return Err(ConfigError::InvalidBits(self.bits));
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.nthread == 0 {
            return Err(ConfigError::ZeroThreads);
        }

        let unsupported =
            || ConfigError::UnsupportedCombination { bits: self.bits, alg: self.alg, compute: self.compute_type };

        match (self.compute_type, self.bits, self.alg) {
            (ComputeType::Native, _, _) if self.block_size != QK => Err(ConfigError::NativeBlockSize(self.block_size)),
            (ComputeType::Native, 8, QuantAlgorithm::Asym) => Err(unsupported()),
            (ComputeType::Native, _, _) => Ok(()),
            (_, _, QuantAlgorithm::Asym) => Err(unsupported()),
            (ComputeType::Int8 | ComputeType::Fp32, 4 | 8, _) => Ok(()),
            (ComputeType::Bf16, 4, _) => Ok(()),
            _ => Err(unsupported()),
        }
    }

    /// Block format produced by a native configuration.
    pub fn block_format(&self) -> Option<BlockFormat> {
        if self.compute_type != ComputeType::Native {
            return None;
        }
        match (self.bits, self.alg) {
            (4, QuantAlgorithm::Sym) => Some(BlockFormat::Q4_0),
            (4, QuantAlgorithm::Asym) => Some(BlockFormat::Q4_1),
            (5, QuantAlgorithm::Sym) => Some(BlockFormat::Q5_0),
            (5, QuantAlgorithm::Asym) => Some(BlockFormat::Q5_1),
            (8, QuantAlgorithm::Sym) => Some(BlockFormat::Q8_0),
            _ => None,
        }
    }

    /// Element type written for tensors selected for quantization.
    pub fn target_type(&self) -> ElementType {
        match self.block_format() {
            Some(format) => format.element_type(),
            None if self.compute_type != ComputeType::Native => ElementType::Packed,
            None => ElementType::F32,
        }
    }

    pub fn pack_params(&self) -> PackParams {
        PackParams {
            bits: self.bits,
            block_size: self.block_size,
            scale_dtype: self.scale_dtype,
            compute_type: self.compute_type,
        }
    }
}

/// Builder for [`QuantConfig`]; unset fields keep the values of the base configuration.
#[derive(Debug, Default)]
pub struct QuantConfigBuilder {
    base: Option<QuantConfig>,
    bits: Option<u32>,
    alg: Option<QuantAlgorithm>,
    block_size: Option<usize>,
    scale_dtype: Option<ScaleDtype>,
    compute_type: Option<ComputeType>,
    nthread: Option<usize>,
}

impl QuantConfigBuilder {
    pub fn base(mut self, config: Option<QuantConfig>) -> Self {
        self.base = config;
        self
    }
    pub fn bits(mut self, bits: Option<u32>) -> Self {
        self.bits = bits;
        self
    }
    pub fn alg(mut self, alg: Option<QuantAlgorithm>) -> Self {
        self.alg = alg;
        self
    }
    pub fn block_size(mut self, block_size: Option<usize>) -> Self {
        self.block_size = block_size;
        self
    }
    pub fn scale_dtype(mut self, scale_dtype: Option<ScaleDtype>) -> Self {
        self.scale_dtype = scale_dtype;
        self
    }
    pub fn compute_type(mut self, compute_type: Option<ComputeType>) -> Self {
        self.compute_type = compute_type;
        self
    }
    pub fn nthread(mut self, nthread: Option<usize>) -> Self {
        self.nthread = nthread;
        self
    }
    pub fn build(self) -> Result<QuantConfig, ConfigError> {
        let base = self.base.unwrap_or_default();
        let config = QuantConfig {
            bits: self.bits.unwrap_or(base.bits),
            alg: self.alg.unwrap_or(base.alg),
            block_size: self.block_size.unwrap_or(base.block_size),
            scale_dtype: self.scale_dtype.unwrap_or(base.scale_dtype),
            compute_type: self.compute_type.unwrap_or(base.compute_type),
            nthread: self.nthread.unwrap_or(base.nthread),
        };
        config.validate()?;
        Ok(config)
    }
}
