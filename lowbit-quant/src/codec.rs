#[cfg(test)]
#[path = "../tests/unit/codec_test.rs"]
mod codec_test;

use anyhow::Result;
use half::f16;
use rayon::prelude::*;

use crate::format::{BlockFormat, QK};

/// Number of bins used to summarize code distributions.
pub const HISTOGRAM_BINS: usize = 16;

/// Distribution of quantized codes, collected while encoding.
///
/// Purely observational: decoding never consults it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Histogram {
    bins: [u64; HISTOGRAM_BINS],
}

impl Histogram {
    pub fn record(&mut self, bin: usize) {
        self.bins[bin] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        self.bins.iter_mut().zip(other.bins.iter()).for_each(|(a, b)| *a += b);
    }

    pub fn merged(mut self, other: Histogram) -> Histogram {
        self.merge(&other);
        self
    }

    pub fn bins(&self) -> &[u64; HISTOGRAM_BINS] {
        &self.bins
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    /// Share of codes per bin; all zeros for an empty histogram.
    pub fn fractions(&self) -> [f32; HISTOGRAM_BINS] {
        let total = self.total();
        let mut out = [0.0; HISTOGRAM_BINS];
        if total > 0 {
            out.iter_mut().zip(self.bins.iter()).for_each(|(f, &b)| *f = b as f32 / total as f32);
        }
        out
    }
}

impl std::fmt::Display for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for fraction in self.fractions() {
            write!(f, "{fraction:5.3} ")?;
        }
        Ok(())
    }
}

/// Result of encoding a float buffer into a block format.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub histogram: Histogram,
}

/// Encodes `src` into `format`, one block of [`QK`] values at a time.
///
/// The legacy block formats only exist with `block_size == QK`; the length of `src`
/// must be a whole number of blocks. Blocks are encoded in parallel, the output is
/// identical to a sequential encode.
pub fn encode(src: &[f32], block_size: usize, format: BlockFormat) -> Result<Encoded> {
    if block_size != QK {
        anyhow::bail!("Block format {:?} uses a fixed block size of {QK}, got {block_size}", format);
    }
    if src.len() % QK != 0 {
        anyhow::bail!("Source length {} is not a multiple of block size {QK}", src.len());
    }

    let block_bytes = format.block_bytes();
    let mut data = vec![0u8; src.len() / QK * block_bytes];

    let histogram = data
        .par_chunks_mut(block_bytes)
        .zip(src.par_chunks(QK))
        .map(|(dst, block)| {
            let mut hist = Histogram::default();
            encode_block(format, block, dst, &mut hist);
            hist
        })
        .reduce(Histogram::default, Histogram::merged);

    Ok(Encoded { data, histogram })
}

/// Decodes `data` (a whole number of `format` blocks) into `out`.
pub fn decode(data: &[u8], format: BlockFormat, out: &mut [f32]) -> Result<()> {
    let block_bytes = format.block_bytes();
    if out.len() % QK != 0 || data.len() != out.len() / QK * block_bytes {
        anyhow::bail!(
            "Invalid {:?} buffer: {} bytes cannot hold {} values (block of {QK} is {block_bytes} bytes)",
            format,
            data.len(),
            out.len()
        );
    }

    data.chunks_exact(block_bytes)
        .zip(out.chunks_exact_mut(QK))
        .for_each(|(block, dst)| decode_block(format, block, dst));

    Ok(())
}

/// Convenience wrapper around [`decode`] that allocates the output.
pub fn decode_to_vec(data: &[u8], format: BlockFormat, n_elements: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0; n_elements];
    decode(data, format, &mut out)?;
    Ok(out)
}

/// Reads the f16 scale stored at the start of every block.
pub fn block_scale(block: &[u8]) -> f32 {
    read_f16(block, 0)
}

/// Encodes one block of [`QK`] values into `dst` (exactly `format.block_bytes()` long).
pub fn encode_block(format: BlockFormat, src: &[f32], dst: &mut [u8], hist: &mut Histogram) {
    debug_assert_eq!(src.len(), QK);
    debug_assert_eq!(dst.len(), format.block_bytes());

    let mut codes = [0u8; QK];

    if format.is_symmetric() {
        let qmax = format.max_symmetric_code();
        let amax = src.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let d = f16::from_f32(amax / qmax as f32);
        let scale = d.to_f32();
        write_f16(dst, 0, d);

        // codes are stored shifted into the unsigned range
        let bias = qmax + 1;
        for (code, &v) in codes.iter_mut().zip(src) {
            let q = if scale != 0.0 { (v / scale).round_ties_even() as i32 } else { 0 };
            *code = (q.clamp(-bias, qmax) + bias) as u8;
        }
    } else {
        let levels = format.max_unsigned_code();
        let (min, max) = src.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let d = f16::from_f32((max - min) / levels as f32);
        let m = f16::from_f32(min);
        let (scale, offset) = (d.to_f32(), m.to_f32());
        write_f16(dst, 0, d);
        write_f16(dst, 2, m);

        for (code, &v) in codes.iter_mut().zip(src) {
            let q = if scale != 0.0 { ((v - offset) / scale).round_ties_even() as i32 } else { 0 };
            *code = q.clamp(0, levels) as u8;
        }
    }

    match format {
        BlockFormat::Q4_0 | BlockFormat::Q4_1 => {
            let start = if format == BlockFormat::Q4_0 { 2 } else { 4 };
            pack_nibbles(&codes, &mut dst[start..start + QK / 2]);
            codes.iter().for_each(|&c| hist.record(c as usize));
        }
        BlockFormat::Q5_0 | BlockFormat::Q5_1 => {
            let start = if format == BlockFormat::Q5_0 { 2 } else { 4 };
            let qh = codes.iter().enumerate().fold(0u32, |acc, (j, &c)| acc | (((c as u32 >> 4) & 1) << j));
            dst[start..start + 4].copy_from_slice(&qh.to_le_bytes());
            pack_nibbles(&codes, &mut dst[start + 4..start + 4 + QK / 2]);
            codes.iter().for_each(|&c| hist.record((c >> 1) as usize));
        }
        BlockFormat::Q8_0 => {
            for (out, &c) in dst[2..].iter_mut().zip(codes.iter()) {
                let q = c as i32 - 128;
                *out = q as i8 as u8;
                hist.record((q / 16 + 8) as usize);
            }
        }
    }
}

/// Decodes one block into `out` (exactly [`QK`] values).
pub fn decode_block(format: BlockFormat, block: &[u8], out: &mut [f32]) {
    debug_assert_eq!(block.len(), format.block_bytes());
    debug_assert_eq!(out.len(), QK);

    let d = read_f16(block, 0);

    match format {
        BlockFormat::Q4_0 => {
            let qs = &block[2..2 + QK / 2];
            for j in 0..QK / 2 {
                out[j] = ((qs[j] & 0x0F) as i32 - 8) as f32 * d;
                out[j + QK / 2] = ((qs[j] >> 4) as i32 - 8) as f32 * d;
            }
        }
        BlockFormat::Q4_1 => {
            let m = read_f16(block, 2);
            let qs = &block[4..4 + QK / 2];
            for j in 0..QK / 2 {
                out[j] = (qs[j] & 0x0F) as f32 * d + m;
                out[j + QK / 2] = (qs[j] >> 4) as f32 * d + m;
            }
        }
        BlockFormat::Q5_0 => {
            for (j, v) in out.iter_mut().enumerate() {
                *v = (five_bit_code(&block[2..], j) as i32 - 16) as f32 * d;
            }
        }
        BlockFormat::Q5_1 => {
            let m = read_f16(block, 2);
            for (j, v) in out.iter_mut().enumerate() {
                *v = five_bit_code(&block[4..], j) as f32 * d + m;
            }
        }
        BlockFormat::Q8_0 => {
            for (v, &q) in out.iter_mut().zip(block[2..].iter()) {
                *v = (q as i8) as f32 * d;
            }
        }
    }
}

/// Element `j` goes into the low nibble of byte `j`, element `j + QK/2` into its high nibble.
fn pack_nibbles(codes: &[u8; QK], dst: &mut [u8]) {
    for j in 0..QK / 2 {
        dst[j] = (codes[j] & 0x0F) | ((codes[j + QK / 2] & 0x0F) << 4);
    }
}

/// `tail` starts at the high-bit mask of a 5-bit block.
fn five_bit_code(tail: &[u8], j: usize) -> u8 {
    let qh = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let qs = &tail[4..4 + QK / 2];
    let low = if j < QK / 2 { qs[j] & 0x0F } else { qs[j - QK / 2] >> 4 };
    low | ((((qh >> j) & 1) as u8) << 4)
}

fn read_f16(bytes: &[u8], at: usize) -> f32 {
    f16::from_bits(u16::from_le_bytes([bytes[at], bytes[at + 1]])).to_f32()
}

fn write_f16(bytes: &mut [u8], at: usize, value: f16) {
    bytes[at..at + 2].copy_from_slice(&value.to_bits().to_le_bytes());
}
