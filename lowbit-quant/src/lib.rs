//! # lowbit-quant
//!
//! Block quantization for transformer weights: the legacy block formats
//! (`q4_0`, `q4_1`, `q5_0`, `q5_1`, `q8_0`), column-tiled packed weights for the
//! int8/fp32/bf16 kernels, and the streaming tensor format both are stored in.
//!
//! ## Examples
//!
//! ### Quantizing a model file
//!
//! ```rust,no_run
//! use lowbit_quant::{QuantConfig, TensorFilter, quantize_model};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = QuantConfig::builder().bits(Some(4)).build()?;
//! let filter = TensorFilter::new(&[".*weight"], &["token_embd\\.weight"])?;
//!
//! quantize_model(Path::new("model-f32.bin"), Path::new("model-q4_0.bin"), &filter, &config)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod format;
pub mod model_file;
pub mod packed;
pub mod record;
pub mod transcoder;

pub use codec::{Encoded, Histogram, decode, encode};
pub use config::{ComputeType, ConfigError, QuantAlgorithm, QuantConfig, QuantConfigBuilder, ScaleDtype};
pub use format::{BlockFormat, ElementType, QK};
pub use model_file::{ModelHeader, read_vocab, write_vocab};
pub use packed::{PackParams, PackedKind, PackedWeight, pack_weight};
pub use record::{RecordHeader, TensorRecord};
pub use transcoder::{DEFAULT_INCLUDE, TensorFilter, TranscodeReport, recode_file};

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Converts a whole model file: header, vocabulary, then every tensor record.
///
/// The header is copied with `ftype` set to the configured target type and the
/// vocabulary is copied verbatim. The configuration is validated before any file is
/// opened, and a failed conversion removes the partial output.
pub fn quantize_model(input: &Path, output: &Path, filter: &TensorFilter, config: &QuantConfig) -> Result<TranscodeReport> {
    config.validate()?;

    info!("Quantizing {} -> {}", input.display(), output.display());
    info!(
        "bits = {}, alg = {}, block size = {}, scale dtype = {}, compute type = {}, threads = {}",
        config.bits, config.alg, config.block_size, config.scale_dtype, config.compute_type, config.nthread
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.nthread)
        .build()
        .context("Failed to create quantization thread pool")?;

    let file = File::open(input).with_context(|| format!("Failed to open model file: {}", input.display()))?;
    let mut reader = BufReader::new(file);
    let header = ModelHeader::read_from(&mut reader)
        .with_context(|| format!("Failed to read model header: {}", input.display()))?;
    let vocab = read_vocab(&mut reader, header.n_vocab as usize)?;

    let file = File::create(output).with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let start = Instant::now();
    let result = pool.install(|| -> Result<TranscodeReport> {
        ModelHeader { ftype: config.target_type().code(), ..header }.write_to(&mut writer)?;
        write_vocab(&mut writer, &vocab)?;
        let report = recode_file(&mut reader, &mut writer, filter, config)?;
        writer.flush()?;
        Ok(report)
    });
    drop(writer);

    match result {
        Ok(report) => {
            info!("Quantization took {:.2} s", start.elapsed().as_secs_f64());
            Ok(report)
        }
        Err(e) => {
            if let Err(remove_err) = std::fs::remove_file(output) {
                warn!("Failed to remove partial output {}: {remove_err}", output.display());
            }
            Err(e.context(format!("Failed to quantize {}", input.display())))
        }
    }
}
