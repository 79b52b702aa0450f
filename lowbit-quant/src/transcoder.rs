#[cfg(test)]
#[path = "../tests/unit/transcoder_test.rs"]
mod transcoder_test;

use anyhow::{Context, Result};
use log::{debug, info};
use regex::Regex;
use std::io::{Read, Write};

use crate::codec::{self, Histogram};
use crate::config::QuantConfig;
use crate::format::ElementType;
use crate::packed::pack_weight;
use crate::record::{RecordHeader, read_float_payload};

/// Decides which tensors get quantized, by name.
///
/// Patterns are anchored: a pattern must match the whole tensor name. A name is
/// selected when it matches any include pattern and no exclude pattern.
#[derive(Debug, Clone)]
pub struct TensorFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TensorFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        let compile = |patterns: &[S]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    let p = p.as_ref();
                    Regex::new(&format!("^(?:{p})$")).with_context(|| format!("Invalid tensor name pattern '{p}'"))
                })
                .collect()
        };

        Ok(Self { include: compile(include)?, exclude: compile(exclude)? })
    }

    pub fn selects(&self, name: &str) -> bool {
        self.include.iter().any(|re| re.is_match(name)) && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

/// Include pattern used when none is given: every tensor whose name ends in `weight`.
pub const DEFAULT_INCLUDE: &str = ".*weight";

/// Summary of a transcode run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeReport {
    pub n_tensors: usize,
    pub n_quantized: usize,
    /// Payload bytes read.
    pub size_org: usize,
    /// Payload bytes written.
    pub size_new: usize,
    pub histogram: Histogram,
}

const MB: f64 = 1024.0 * 1024.0;

/// Streams tensor records from `reader` to `writer`, quantizing the selected ones.
///
/// A tensor is quantized when `filter` selects its name and it is two-dimensional;
/// such a tensor must be f32 or f16, anything else aborts the run. Every other record
/// is copied unchanged. On error the output is incomplete and must be discarded.
pub fn recode_file<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    filter: &TensorFilter,
    config: &QuantConfig,
) -> Result<TranscodeReport> {
    config.validate()?;

    let target = config.target_type();
    let mut report = TranscodeReport::default();

    while let Some(header) = RecordHeader::read_from(reader)? {
        let quantize = header.ne.len() == 2 && filter.selects(&header.name);
        report.n_tensors += 1;

        if !quantize {
            let payload = header.read_payload(reader)?;
            header.write_to(writer)?;
            writer.write_all(&payload)?;

            debug!("{:>48} - {:?}, type = {:>6}, copied", header.name, header.ne, header.element_type);
            report.size_org += payload.len();
            report.size_new += payload.len();
            continue;
        }

        if !matches!(header.element_type, ElementType::F32 | ElementType::F16) {
            anyhow::bail!("Unsupported element type {} for quantized tensor '{}'", header.element_type, header.name);
        }

        let size_org = header.payload_size(&[])?;
        let values = read_float_payload(reader, &header)
            .with_context(|| format!("Failed to read data of tensor '{}'", header.name))?;

        let (payload, histogram) = quantize_tensor(&header, &values, config)?;

        RecordHeader { element_type: target, ..header.clone() }.write_to(writer)?;
        writer.write_all(&payload)?;

        info!(
            "{:>48} - [{:5}, {:5}], type = {:>6} size = {:8.3} MB -> {:8.3} MB | hist: {histogram}",
            header.name,
            header.ne[0],
            header.ne[1],
            header.element_type.name(),
            size_org as f64 / MB,
            payload.len() as f64 / MB,
        );

        report.n_quantized += 1;
        report.size_org += size_org;
        report.size_new += payload.len();
        report.histogram.merge(&histogram);
    }

    writer.flush()?;

    info!("model size  = {:8.2} MB", report.size_org as f64 / MB);
    info!("quant size  = {:8.2} MB", report.size_new as f64 / MB);
    info!("quantized {} of {} tensors to {target}", report.n_quantized, report.n_tensors);
    info!("hist: {}", report.histogram);

    Ok(report)
}

fn quantize_tensor(header: &RecordHeader, values: &[f32], config: &QuantConfig) -> Result<(Vec<u8>, Histogram)> {
    let (k, n) = (header.ne[0], header.ne[1]);
    if k % config.block_size != 0 {
        anyhow::bail!(
            "Tensor '{}' row length {k} is not a multiple of block size {}",
            header.name,
            config.block_size
        );
    }

    if let Some(format) = config.block_format() {
        let encoded = codec::encode(values, config.block_size, format)
            .with_context(|| format!("Failed to quantize tensor '{}'", header.name))?;
        return Ok((encoded.data, encoded.histogram));
    }

    let packed = pack_weight(values, n, k, &config.pack_params()).ok_or_else(|| {
        anyhow::anyhow!("Unsupported packed quantization parameters for tensor '{}'", header.name)
    })?;

    Ok((packed.to_bytes()?, packed.histogram()))
}
