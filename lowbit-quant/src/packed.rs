#[cfg(test)]
#[path = "../tests/unit/packed_test.rs"]
mod packed_test;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use std::io::{Cursor, Read, Write};

use crate::codec::Histogram;
use crate::config::{ComputeType, ScaleDtype};

/// Size of the serialized packed weight header in bytes (8 u32 fields).
pub const PACKED_HEADER_SIZE: usize = 32;

/// Code width of a packed weight. The tag is written into the serialized form and
/// checked once when the weight is loaded.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackedKind {
    S4 = 1,
    S8 = 2,
}

impl PackedKind {
    pub fn bits(self) -> u32 {
        match self {
            Self::S4 => 4,
            Self::S8 => 8,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            4 => Some(Self::S4),
            8 => Some(Self::S8),
            _ => None,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::S4),
            2 => Some(Self::S8),
            _ => None,
        }
    }

    fn max_code(self) -> i32 {
        (1 << (self.bits() - 1)) - 1
    }
}

/// Parameters used to pack a weight matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackParams {
    pub bits: u32,
    pub block_size: usize,
    pub scale_dtype: ScaleDtype,
    pub compute_type: ComputeType,
}

/// Column tile width the kernels of a compute family consume.
pub fn column_tile(compute_type: ComputeType) -> Option<usize> {
    match compute_type {
        ComputeType::Int8 | ComputeType::Fp32 => Some(48),
        ComputeType::Bf16 => Some(64),
        ComputeType::Native => None,
    }
}

/// An N×K weight matrix reordered into column tiles, with symmetric int4/int8 codes
/// per (column, K-block) and one scale per (column, K-block).
///
/// Layout: codes are `[tile][k][column in tile]`, scales are `[tile][k block][column in tile]`.
/// Columns past `n` in the last tile are zero codes with zero scales. Immutable once packed.
#[derive(Clone, PartialEq)]
pub struct PackedWeight {
    kind: PackedKind,
    compute_type: ComputeType,
    scale_dtype: ScaleDtype,
    n: usize,
    k: usize,
    block_size: usize,
    n_tile: usize,
    codes: Vec<u8>,
    scales: Vec<f32>,
}

/// Packs a row-major N×K weight (`src[col * k + kk]`).
///
/// Returns `None` when the parameters cannot describe a packed weight: bit width not
/// in {4, 8}, a native compute type, a zero block size, K not divisible by the block
/// size, or a source of the wrong length. Callers treat `None` as fatal for the tensor.
pub fn pack_weight(src: &[f32], n: usize, k: usize, params: &PackParams) -> Option<PackedWeight> {
    let kind = PackedKind::from_bits(params.bits)?;
    let n_tile = column_tile(params.compute_type)?;
    let block_size = params.block_size;
    if block_size == 0 || n == 0 || k == 0 || k % block_size != 0 || src.len() != n * k {
        return None;
    }

    let n_tiles = n.div_ceil(n_tile);
    let k_blocks = k / block_size;
    let tile_code_bytes = k * n_tile * kind.bits() as usize / 8;
    let tile_scales = k_blocks * n_tile;

    let mut codes = vec![0u8; n_tiles * tile_code_bytes];
    let mut scales = vec![0.0f32; n_tiles * tile_scales];
    let qmax = kind.max_code();

    codes.par_chunks_mut(tile_code_bytes).zip(scales.par_chunks_mut(tile_scales)).enumerate().for_each(
        |(tile, (tile_codes, tile_scales))| {
            for cc in 0..n_tile.min(n - tile * n_tile) {
                let col = tile * n_tile + cc;
                let row = &src[col * k..(col + 1) * k];

                for kb in 0..k_blocks {
                    let block = &row[kb * block_size..(kb + 1) * block_size];
                    let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
                    let scale = params.scale_dtype.round(amax / qmax as f32);
                    tile_scales[kb * n_tile + cc] = scale;

                    for (j, &v) in block.iter().enumerate() {
                        let q = if scale != 0.0 { (v / scale).round_ties_even() as i32 } else { 0 };
                        let q = q.clamp(-qmax - 1, qmax) as i8;
                        let idx = (kb * block_size + j) * n_tile + cc;
                        store_code(tile_codes, kind, idx, q);
                    }
                }
            }
        },
    );

    Some(PackedWeight {
        kind,
        compute_type: params.compute_type,
        scale_dtype: params.scale_dtype,
        n,
        k,
        block_size,
        n_tile,
        codes,
        scales,
    })
}

fn store_code(codes: &mut [u8], kind: PackedKind, idx: usize, q: i8) {
    match kind {
        PackedKind::S8 => codes[idx] = q as u8,
        PackedKind::S4 => {
            let nibble = (q as u8) & 0x0F;
            let byte = &mut codes[idx / 2];
            if idx % 2 == 0 {
                *byte = (*byte & 0xF0) | nibble;
            } else {
                *byte = (*byte & 0x0F) | (nibble << 4);
            }
        }
    }
}

impl PackedWeight {
    pub fn kind(&self) -> PackedKind {
        self.kind
    }

    pub fn bits(&self) -> u32 {
        self.kind.bits()
    }

    pub fn compute_type(&self) -> ComputeType {
        self.compute_type
    }

    pub fn scale_dtype(&self) -> ScaleDtype {
        self.scale_dtype
    }

    /// Output features (rows of the logical weight).
    pub fn n(&self) -> usize {
        self.n
    }

    /// Input features (reduction length).
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn k_blocks(&self) -> usize {
        self.k / self.block_size
    }

    pub fn n_tile(&self) -> usize {
        self.n_tile
    }

    #[inline]
    fn code_index(&self, col: usize, kk: usize) -> usize {
        let (tile, cc) = (col / self.n_tile, col % self.n_tile);
        (tile * self.k + kk) * self.n_tile + cc
    }

    #[inline]
    pub fn code(&self, col: usize, kk: usize) -> i8 {
        let idx = self.code_index(col, kk);
        match self.kind {
            PackedKind::S8 => self.codes[idx] as i8,
            PackedKind::S4 => {
                let byte = self.codes[idx / 2];
                let nibble = if idx % 2 == 0 { byte << 4 } else { byte & 0xF0 };
                (nibble as i8) >> 4
            }
        }
    }

    #[inline]
    pub fn scale(&self, col: usize, kb: usize) -> f32 {
        let (tile, cc) = (col / self.n_tile, col % self.n_tile);
        self.scales[(tile * self.k_blocks() + kb) * self.n_tile + cc]
    }

    /// Copies the codes of column `col` for K-block `kb` into `out` (`block_size` long).
    pub fn column_block(&self, col: usize, kb: usize, out: &mut [i8]) {
        debug_assert_eq!(out.len(), self.block_size);
        let start = kb * self.block_size;
        out.iter_mut().enumerate().for_each(|(j, q)| *q = self.code(col, start + j));
    }

    /// Reconstructs the row-major N×K float matrix.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.n * self.k];
        out.par_chunks_mut(self.k).enumerate().for_each(|(col, row)| {
            for (kk, v) in row.iter_mut().enumerate() {
                *v = self.code(col, kk) as f32 * self.scale(col, kk / self.block_size);
            }
        });
        out
    }

    /// Code distribution over 16 bins, matching the block codec bins for 4 and 8 bits.
    pub fn histogram(&self) -> Histogram {
        let mut hist = Histogram::default();
        for col in 0..self.n {
            for kk in 0..self.k {
                let q = self.code(col, kk) as i32;
                let bin = match self.kind {
                    PackedKind::S4 => q + 8,
                    PackedKind::S8 => q / 16 + 8,
                };
                hist.record(bin as usize);
            }
        }
        hist
    }

    pub fn serialized_size(&self) -> usize {
        PACKED_HEADER_SIZE + self.codes.len() + self.scales.len() * self.scale_dtype.size()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.kind as u32)?;
        // symmetric is the only packed algorithm
        writer.write_u32::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.compute_type.code())?;
        writer.write_u32::<LittleEndian>(self.scale_dtype.code())?;
        writer.write_u32::<LittleEndian>(self.n as u32)?;
        writer.write_u32::<LittleEndian>(self.k as u32)?;
        writer.write_u32::<LittleEndian>(self.block_size as u32)?;
        writer.write_u32::<LittleEndian>(self.n_tile as u32)?;

        writer.write_all(&self.codes)?;
        self.scales.iter().try_for_each(|&s| match self.scale_dtype {
            ScaleDtype::Fp32 => writer.write_f32::<LittleEndian>(s),
            ScaleDtype::Fp16 => writer.write_u16::<LittleEndian>(half::f16::from_f32(s).to_bits()),
            ScaleDtype::Bf16 => writer.write_u16::<LittleEndian>(half::bf16::from_f32(s).to_bits()),
        })?;

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Parses a serialized packed weight, returning it and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        let layout = PackedLayout::parse(bytes)?;
        let total = layout.serialized_size();
        if bytes.len() < total {
            anyhow::bail!("Truncated packed weight: need {total} bytes, have {}", bytes.len());
        }

        let codes_end = PACKED_HEADER_SIZE + layout.code_bytes();
        let codes = bytes[PACKED_HEADER_SIZE..codes_end].to_vec();

        let mut cursor = Cursor::new(&bytes[codes_end..total]);
        let scales = (0..layout.scale_count())
            .map(|_| -> Result<f32> {
                let scale = match layout.scale_dtype {
                    ScaleDtype::Fp32 => cursor.read_f32::<LittleEndian>()?,
                    ScaleDtype::Fp16 => half::f16::from_bits(cursor.read_u16::<LittleEndian>()?).to_f32(),
                    ScaleDtype::Bf16 => half::bf16::from_bits(cursor.read_u16::<LittleEndian>()?).to_f32(),
                };
                Ok(scale)
            })
            .collect::<Result<Vec<f32>>>()
            .context("Failed to read packed weight scales")?;

        let weight = PackedWeight {
            kind: layout.kind,
            compute_type: layout.compute_type,
            scale_dtype: layout.scale_dtype,
            n: layout.n,
            k: layout.k,
            block_size: layout.block_size,
            n_tile: layout.n_tile,
            codes,
            scales,
        };

        Ok((weight, total))
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bytes = read_packed_payload(reader)?;
        Ok(Self::from_bytes(&bytes)?.0)
    }
}

impl std::fmt::Debug for PackedWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedWeight")
            .field("kind", &self.kind)
            .field("compute_type", &self.compute_type)
            .field("scale_dtype", &self.scale_dtype)
            .field("n", &self.n)
            .field("k", &self.k)
            .field("block_size", &self.block_size)
            .field("n_tile", &self.n_tile)
            .finish()
    }
}

/// Header of a serialized packed weight; enough to size the payload without decoding it.
#[derive(Debug, Clone, Copy)]
pub struct PackedLayout {
    pub kind: PackedKind,
    pub compute_type: ComputeType,
    pub scale_dtype: ScaleDtype,
    pub n: usize,
    pub k: usize,
    pub block_size: usize,
    pub n_tile: usize,
}

impl PackedLayout {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKED_HEADER_SIZE {
            anyhow::bail!("Truncated packed weight header: {} bytes", bytes.len());
        }
        let mut cursor = Cursor::new(&bytes[..PACKED_HEADER_SIZE]);

        macro_rules! read_u32 {
            ($field:literal) => {
                cursor.read_u32::<LittleEndian>().with_context(|| format!("Failed to read {}", $field))?
            };
        }

        let kind_code = read_u32!("packed kind");
        let alg = read_u32!("packed algorithm");
        let compute_code = read_u32!("compute type");
        let scale_code = read_u32!("scale dtype");
        let n = read_u32!("n") as usize;
        let k = read_u32!("k") as usize;
        let block_size = read_u32!("block size") as usize;
        let n_tile = read_u32!("tile width") as usize;

        let kind = PackedKind::from_code(kind_code)
            .ok_or_else(|| anyhow::anyhow!("Unknown packed weight kind: {kind_code}"))?;
        if alg != 0 {
            anyhow::bail!("Unsupported packed weight algorithm: {alg}");
        }
        let compute_type = ComputeType::from_code(compute_code)
            .filter(|c| *c != ComputeType::Native)
            .ok_or_else(|| anyhow::anyhow!("Invalid packed compute type: {compute_code}"))?;
        let scale_dtype = ScaleDtype::from_code(scale_code)
            .ok_or_else(|| anyhow::anyhow!("Invalid packed scale dtype: {scale_code}"))?;

        if column_tile(compute_type) != Some(n_tile) {
            anyhow::bail!("Packed tile width {n_tile} does not match {compute_type} kernels");
        }
        if n == 0 || k == 0 || block_size == 0 || k % block_size != 0 {
            anyhow::bail!("Invalid packed weight shape: n={n}, k={k}, block_size={block_size}");
        }

        Ok(Self { kind, compute_type, scale_dtype, n, k, block_size, n_tile })
    }

    fn n_tiles(&self) -> usize {
        self.n.div_ceil(self.n_tile)
    }

    fn code_bytes(&self) -> usize {
        self.n_tiles() * self.k * self.n_tile * self.kind.bits() as usize / 8
    }

    fn scale_count(&self) -> usize {
        self.n_tiles() * (self.k / self.block_size) * self.n_tile
    }

    pub fn serialized_size(&self) -> usize {
        PACKED_HEADER_SIZE + self.code_bytes() + self.scale_count() * self.scale_dtype.size()
    }
}

/// Reads one serialized packed weight from a stream without decoding it.
pub fn read_packed_payload<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; PACKED_HEADER_SIZE];
    reader.read_exact(&mut bytes).context("Failed to read packed weight header")?;
    let size = PackedLayout::parse(&bytes)?.serialized_size();
    bytes.resize(size, 0);
    reader.read_exact(&mut bytes[PACKED_HEADER_SIZE..]).context("Failed to read packed weight body")?;
    Ok(bytes)
}
