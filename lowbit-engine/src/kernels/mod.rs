//! Matrix-multiply microkernels and their selection by CPU capability.
//!
//! Every kernel computes one output tile `out[m][n] = Σ_k a[m][k] · w[n][k]` over
//! the full reduction, one K-block at a time in order, so an output element does
//! not depend on the tile it was computed in.

#[cfg(test)]
#[path = "../../tests/unit/kernels_test.rs"]
mod kernels_test;

mod microkernels;

use anyhow::Result;
use half::f16;
use log::debug;
use lowbit_quant::{BlockFormat, ComputeType, PackedWeight};
use std::collections::HashMap;

/// Instruction-set extensions relevant to kernel selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub avx2: bool,
    pub avx512f: bool,
    pub avx512_vnni: bool,
    pub avx512_bf16: bool,
    pub amx_tile: bool,
    pub amx_int8: bool,
    pub amx_bf16: bool,
}

impl CpuFeatures {
    /// Probes the running CPU.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        use std::arch::x86_64::{__cpuid_count, __get_cpuid_max};

        let avx512f = std::arch::is_x86_feature_detected!("avx512f");
        let mut features = Self { avx2: std::arch::is_x86_feature_detected!("avx2"), avx512f, ..Self::default() };

        // SAFETY: cpuid is available on every x86_64 CPU; leaf 7 is only queried when reported.
        let max_leaf = unsafe { __get_cpuid_max(0) }.0;
        if max_leaf >= 7 {
            let leaf7 = unsafe { __cpuid_count(7, 0) };
            let leaf7_1 = unsafe { __cpuid_count(7, 1) };

            // the avx512 extensions are only usable when the OS saves zmm state,
            // which the avx512f probe already checks
            features.avx512_vnni = avx512f && (leaf7.ecx >> 11) & 1 == 1;
            features.avx512_bf16 = avx512f && (leaf7_1.eax >> 5) & 1 == 1;
            features.amx_bf16 = (leaf7.edx >> 22) & 1 == 1;
            features.amx_tile = (leaf7.edx >> 24) & 1 == 1;
            features.amx_int8 = (leaf7.edx >> 25) & 1 == 1;
        }

        features
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = [
            ("AVX2", self.avx2),
            ("AVX512F", self.avx512f),
            ("AVX512_VNNI", self.avx512_vnni),
            ("AVX512_BF16", self.avx512_bf16),
            ("AMX_TILE", self.amx_tile),
            ("AMX_INT8", self.amx_int8),
            ("AMX_BF16", self.amx_bf16),
        ];
        let parts: Vec<_> = flags.iter().map(|(name, on)| format!("{name} = {}", u8::from(*on))).collect();
        f.write_str(&parts.join(" | "))
    }
}

/// Capability tier a kernel was selected for, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelTier {
    Amx,
    Vnni,
    Avx512,
    Generic,
}

/// Operand combination a kernel consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFamily {
    /// f32 weights, f32 activations.
    DenseF32,
    /// f16 weights, f32 activations.
    DenseF16,
    /// Legacy block-format weights, f32 activations.
    Blocks,
    /// Packed weights, activations quantized to int8 per call.
    PackedInt8,
    /// Packed weights, f32 activations.
    PackedFp32,
    /// Packed weights, activations rounded to bf16.
    PackedBf16,
}

impl KernelFamily {
    pub fn for_compute_type(compute_type: ComputeType) -> Option<Self> {
        match compute_type {
            ComputeType::Int8 => Some(Self::PackedInt8),
            ComputeType::Fp32 => Some(Self::PackedFp32),
            ComputeType::Bf16 => Some(Self::PackedBf16),
            ComputeType::Native => None,
        }
    }

    /// True when activations are quantized by the threads before multiplying.
    pub fn is_dynamic(self) -> bool {
        self == Self::PackedInt8
    }
}

/// How a computed tile is written to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epilogue {
    Write,
    /// Adds to what the destination already holds (residual connections).
    Accumulate,
}

impl Epilogue {
    #[inline]
    pub fn apply(self, dst: &mut [f32], src: &[f32]) {
        match self {
            Epilogue::Write => dst.copy_from_slice(src),
            Epilogue::Accumulate => dst.iter_mut().zip(src).for_each(|(d, &s)| *d += s),
        }
    }
}

/// Weight operand of a multiply; `n` output rows of `k` values.
#[derive(Debug, Clone, Copy)]
pub enum WeightRef<'a> {
    F32 { data: &'a [f32], n: usize, k: usize },
    F16 { data: &'a [f16], n: usize, k: usize },
    Blocks { format: BlockFormat, data: &'a [u8], n: usize, k: usize },
    Packed(&'a PackedWeight),
}

impl WeightRef<'_> {
    pub fn n(&self) -> usize {
        match self {
            WeightRef::F32 { n, .. } | WeightRef::F16 { n, .. } | WeightRef::Blocks { n, .. } => *n,
            WeightRef::Packed(packed) => packed.n(),
        }
    }

    pub fn k(&self) -> usize {
        match self {
            WeightRef::F32 { k, .. } | WeightRef::F16 { k, .. } | WeightRef::Blocks { k, .. } => *k,
            WeightRef::Packed(packed) => packed.k(),
        }
    }

    pub fn family(&self) -> KernelFamily {
        match self {
            WeightRef::F32 { .. } => KernelFamily::DenseF32,
            WeightRef::F16 { .. } => KernelFamily::DenseF16,
            WeightRef::Blocks { .. } => KernelFamily::Blocks,
            WeightRef::Packed(packed) => {
                KernelFamily::for_compute_type(packed.compute_type()).unwrap_or(KernelFamily::PackedFp32)
            }
        }
    }

    /// Code width used to key the kernel table.
    pub fn bits(&self) -> u32 {
        match self {
            WeightRef::F32 { .. } => 32,
            WeightRef::F16 { .. } => 16,
            WeightRef::Blocks { format, .. } => format.bits(),
            WeightRef::Packed(packed) => packed.bits(),
        }
    }

    /// Reduction block length; the int8 activation blocks must match it.
    pub fn block_size(&self) -> usize {
        match self {
            WeightRef::F32 { .. } | WeightRef::F16 { .. } => self.k(),
            WeightRef::Blocks { .. } => lowbit_quant::QK,
            WeightRef::Packed(packed) => packed.block_size(),
        }
    }
}

/// One activation row quantized to int8 with a scale per block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantizedRow {
    pub codes: Vec<i8>,
    pub scales: Vec<f32>,
}

impl QuantizedRow {
    /// Symmetric int8 quantization of `row` in blocks of `block_size`.
    pub fn quantize(row: &[f32], block_size: usize) -> Self {
        let mut codes = vec![0i8; row.len()];
        let scales = row
            .chunks(block_size)
            .zip(codes.chunks_mut(block_size))
            .map(|(block, out)| {
                let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
                let scale = amax / 127.0;
                for (q, &v) in out.iter_mut().zip(block) {
                    *q = if scale != 0.0 { (v / scale).round_ties_even().clamp(-127.0, 127.0) as i8 } else { 0 };
                }
                scale
            })
            .collect();
        Self { codes, scales }
    }
}

/// Activation operand: `m` rows of `k` values.
#[derive(Debug, Clone, Copy)]
pub enum Activation<'a> {
    F32 { data: &'a [f32], k: usize },
    Int8 { rows: &'a [&'a QuantizedRow] },
}

/// Output tile in absolute coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Computes one tile into `out`, row stride `ld`, starting at the tile origin.
pub type KernelFn = fn(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize);

/// A selected kernel and the tile geometry the scheduler should use with it.
#[derive(Debug, Clone, Copy)]
pub struct Microkernel {
    pub name: &'static str,
    pub family: KernelFamily,
    pub tier: KernelTier,
    /// Output rows per tile.
    pub mr: usize,
    /// Output columns per tile.
    pub nr: usize,
    compute: KernelFn,
}

impl Microkernel {
    #[inline]
    pub fn run(&self, w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
        (self.compute)(w, a, tile, out, ld)
    }
}

/// Kernel table built once per context from the detected CPU features.
#[derive(Debug)]
pub struct KernelRegistry {
    features: CpuFeatures,
    kernels: HashMap<(KernelFamily, u32), Microkernel>,
    has_blas: bool,
}

impl KernelRegistry {
    pub fn detect() -> Self {
        Self::with_features(CpuFeatures::detect())
    }

    pub fn with_features(features: CpuFeatures) -> Self {
        let mut kernels = HashMap::new();
        let mut add = |name, family, tier, mr, nr, compute: KernelFn, bits: &[u32]| {
            for &b in bits {
                kernels.insert((family, b), Microkernel { name, family, tier, mr, nr, compute });
            }
        };

        add("dense_f32", KernelFamily::DenseF32, KernelTier::Generic, 4, 16, microkernels::dense_f32, &[32]);
        add("dense_f16", KernelFamily::DenseF16, KernelTier::Generic, 4, 16, microkernels::dense_f16, &[16]);
        add("blocks", KernelFamily::Blocks, KernelTier::Generic, 4, 16, microkernels::blocks, &[4, 5, 8]);

        // matrix extensions first, then vector neural network, then plain vector kernels
        if features.amx_tile && features.amx_int8 {
            add("int8_amx", KernelFamily::PackedInt8, KernelTier::Amx, 16, 48, microkernels::packed_int8, &[4, 8]);
        } else if features.avx512_vnni {
            add("int8_vnni", KernelFamily::PackedInt8, KernelTier::Vnni, 3, 48, microkernels::packed_int8, &[4, 8]);
        }

        if features.avx512f {
            add("fp32_avx512", KernelFamily::PackedFp32, KernelTier::Avx512, 8, 48, microkernels::packed_f32, &[4, 8]);
        } else {
            add("fp32_generic", KernelFamily::PackedFp32, KernelTier::Generic, 4, 48, microkernels::packed_f32, &[4, 8]);
        }

        if features.amx_tile && features.amx_bf16 {
            add("bf16_amx", KernelFamily::PackedBf16, KernelTier::Amx, 16, 64, microkernels::packed_f32, &[4]);
        } else if features.avx512_bf16 {
            add("bf16_avx512", KernelFamily::PackedBf16, KernelTier::Avx512, 8, 64, microkernels::packed_f32, &[4]);
        }

        debug!("CPU features: {features}");
        Self { features, kernels, has_blas: false }
    }

    /// Marks a BLAS-accelerated path as active, which makes large batches run single-threaded.
    pub fn with_blas(mut self, has_blas: bool) -> Self {
        self.has_blas = has_blas;
        self
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    pub fn has_blas(&self) -> bool {
        self.has_blas
    }

    /// The kernel for a weight family and code width.
    pub fn select(&self, family: KernelFamily, bits: u32) -> Result<&Microkernel> {
        self.kernels.get(&(family, bits)).ok_or_else(|| {
            anyhow::anyhow!("No {bits}-bit {family:?} kernel is available on this CPU ({})", self.features)
        })
    }

    pub fn select_for(&self, weight: &WeightRef<'_>) -> Result<&Microkernel> {
        self.select(weight.family(), weight.bits())
    }
}
