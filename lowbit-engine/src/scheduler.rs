//! Splits a matrix multiply into per-thread output regions and runs them on a
//! fixed-size thread pool.

#[cfg(test)]
#[path = "../tests/unit/scheduler_test.rs"]
mod scheduler_test;

use anyhow::{Context, Result};
use half::bf16;
use log::debug;
use rayon::prelude::*;
use std::sync::{Barrier, OnceLock};

use crate::kernels::{Activation, Epilogue, KernelFamily, Microkernel, QuantizedRow, Tile, WeightRef};

const L2_SIZE_PATH: &str = "/sys/devices/system/cpu/cpu0/cache/index2/size";
const DEFAULT_L2_BYTES: usize = 2 * 1024 * 1024;

/// Parses a sysfs cache size such as `2048K` or `1M`.
pub fn parse_cache_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, unit) = match text.as_bytes().last()? {
        b'K' | b'k' => (&text[..text.len() - 1], 1024),
        b'M' | b'm' => (&text[..text.len() - 1], 1024 * 1024),
        b'G' | b'g' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok().filter(|&n| n > 0).map(|n| n * unit)
}

/// Size of the L2 cache of the first CPU, or 2 MiB when it cannot be read.
pub fn detect_l2_cache_size() -> usize {
    std::fs::read_to_string(L2_SIZE_PATH).ok().and_then(|s| parse_cache_size(&s)).unwrap_or(DEFAULT_L2_BYTES)
}

/// Partitions an `m × n` output among at most `threads` workers.
///
/// Rows are split in units of `mr` and columns in units of `nr`. The split
/// maximizes the number of busy workers, then minimizes the largest region, then
/// prefers splitting columns. Regions are contiguous, tile aligned, disjoint and
/// cover the whole output. The result depends only on the arguments.
pub fn partition(m: usize, n: usize, threads: usize, mr: usize, nr: usize) -> Vec<Tile> {
    if m == 0 || n == 0 {
        return Vec::new();
    }
    let (mr, nr, threads) = (mr.max(1), nr.max(1), threads.max(1));
    let (mb, nb) = (m.div_ceil(mr), n.div_ceil(nr));

    let region_area = |rt: usize, ct: usize| (mb.div_ceil(rt) * mr).min(m) * (nb.div_ceil(ct) * nr).min(n);

    let mut best = (1usize, 1usize);
    for rt in 1..=mb.min(threads) {
        for ct in 1..=nb.min(threads / rt) {
            let (brt, bct) = best;
            let better = match (rt * ct).cmp(&(brt * bct)) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => {
                    let (area, best_area) = (region_area(rt, ct), region_area(brt, bct));
                    area < best_area || (area == best_area && ct > bct)
                }
            };
            if better {
                best = (rt, ct);
            }
        }
    }

    let (rt, ct) = best;
    let bounds = |blocks: usize, parts: usize, unit: usize, extent: usize, i: usize| {
        let start = (i * blocks / parts * unit).min(extent);
        let end = ((i + 1) * blocks / parts * unit).min(extent);
        (start, end - start)
    };

    let mut regions = Vec::with_capacity(rt * ct);
    for ri in 0..rt {
        let (row, rows) = bounds(mb, rt, mr, m, ri);
        for ci in 0..ct {
            let (col, cols) = bounds(nb, ct, nr, n, ci);
            regions.push(Tile { row, col, rows, cols });
        }
    }
    regions
}

/// Fixed-size worker pool that runs matrix multiplies region by region.
///
/// The pool is built once for a context and reused by every call.
#[derive(Debug)]
pub struct Scheduler {
    pool: rayon::ThreadPool,
    l2_bytes: usize,
}

impl Scheduler {
    pub fn new(n_threads: usize) -> Result<Self> {
        Self::with_l2_size(n_threads, detect_l2_cache_size())
    }

    pub fn with_l2_size(n_threads: usize, l2_bytes: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads.max(1))
            .thread_name(|i| format!("lowbit-worker-{i}"))
            .build()
            .context("Failed to build the worker thread pool")?;
        debug!("Tile scheduler: {} threads, L2 {} KiB", pool.current_num_threads(), l2_bytes / 1024);
        Ok(Self { pool, l2_bytes })
    }

    pub fn n_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn l2_bytes(&self) -> usize {
        self.l2_bytes
    }

    /// Number of output columns whose weights fit in half the L2 cache, a multiple of `nr`.
    pub fn column_step(&self, weight: &WeightRef<'_>, nr: usize) -> usize {
        let column_bytes = (weight.k() * weight.bits() as usize).div_ceil(8).max(1);
        let columns = (self.l2_bytes / 2 / column_bytes).max(nr);
        columns / nr * nr
    }

    /// Computes `out (m × n) = input (m × k) · weightᵀ` through `epilogue`.
    ///
    /// `n_threads` is capped at the pool size. Packed weights packed for int8
    /// compute take the dynamic path: the activation rows are quantized by the
    /// workers, which meet at a barrier before multiplying.
    #[allow(clippy::too_many_arguments)]
    pub fn matmul(
        &self,
        kernel: &Microkernel,
        weight: &WeightRef<'_>,
        input: &[f32],
        m: usize,
        out: &mut [f32],
        epilogue: Epilogue,
        n_threads: usize,
    ) -> Result<()> {
        let (n, k) = (weight.n(), weight.k());
        if kernel.family != weight.family() {
            anyhow::bail!("Kernel '{}' cannot multiply a {:?} weight", kernel.name, weight.family());
        }
        if input.len() != m * k || out.len() != m * n {
            anyhow::bail!(
                "Matrix multiply shape mismatch: input {} (expected {m}×{k}), output {} (expected {m}×{n})",
                input.len(),
                out.len()
            );
        }

        let threads = n_threads.clamp(1, self.n_threads());
        let regions = partition(m, n, threads, kernel.mr, kernel.nr);
        let n_step = self.column_step(weight, kernel.nr);

        let results: Vec<(Tile, Vec<f32>)> = if kernel.family.is_dynamic() {
            self.run_dynamic(kernel, weight, input, &regions, n_step)?
        } else {
            let rounded: Vec<f32>;
            let data = if kernel.family == KernelFamily::PackedBf16 {
                rounded = input.iter().map(|&v| bf16::from_f32(v).to_f32()).collect();
                &rounded
            } else {
                input
            };
            let act = Activation::F32 { data, k };
            self.pool.install(|| {
                regions.par_iter().map(|region| (*region, compute_region(kernel, weight, &act, region, n_step))).collect()
            })
        };

        for (region, buf) in results {
            for r in 0..region.rows {
                let dst = &mut out[(region.row + r) * n + region.col..][..region.cols];
                epilogue.apply(dst, &buf[r * region.cols..][..region.cols]);
            }
        }
        Ok(())
    }

    fn run_dynamic(
        &self,
        kernel: &Microkernel,
        weight: &WeightRef<'_>,
        input: &[f32],
        regions: &[Tile],
        n_step: usize,
    ) -> Result<Vec<(Tile, Vec<f32>)>> {
        let k = weight.k();
        let m = input.len() / k.max(1);
        let block_size = weight.block_size();
        let workers = self.n_threads();
        let shard = m.div_ceil(workers);

        let quantized: Vec<OnceLock<QuantizedRow>> = (0..m).map(|_| OnceLock::new()).collect();
        let barrier = Barrier::new(workers);

        let results = self.pool.broadcast(|ctx| {
            let first = ctx.index() * shard;
            for row in first..(first + shard).min(m) {
                let _ = quantized[row].set(QuantizedRow::quantize(&input[row * k..][..k], block_size));
            }

            // every row must be quantized before any worker reads another's shard
            barrier.wait();

            let region = regions.get(ctx.index())?;
            let rows: Option<Vec<&QuantizedRow>> = quantized.iter().map(OnceLock::get).collect();
            Some(match rows {
                Some(rows) => Ok((*region, compute_region(kernel, weight, &Activation::Int8 { rows: &rows }, region, n_step))),
                None => Err(anyhow::anyhow!("Activation rows were not quantized before the barrier")),
            })
        });

        results.into_iter().flatten().collect()
    }
}

/// Runs the kernel over one region, column chunk by column chunk, into a
/// region-local row-major buffer.
fn compute_region(kernel: &Microkernel, weight: &WeightRef<'_>, act: &Activation<'_>, region: &Tile, n_step: usize) -> Vec<f32> {
    let mut buf = vec![0.0f32; region.rows * region.cols];
    let ld = region.cols;

    for chunk in (0..region.cols).step_by(n_step.max(1)) {
        let chunk_end = (chunk + n_step).min(region.cols);
        for r in (0..region.rows).step_by(kernel.mr) {
            let rows = kernel.mr.min(region.rows - r);
            for c in (chunk..chunk_end).step_by(kernel.nr) {
                let cols = kernel.nr.min(chunk_end - c);
                let tile = Tile { row: region.row + r, col: region.col + c, rows, cols };
                kernel.run(weight, act, tile, &mut buf[r * ld + c..], ld);
            }
        }
    }
    buf
}
