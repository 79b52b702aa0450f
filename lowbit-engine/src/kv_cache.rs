#[cfg(test)]
#[path = "../tests/unit/kv_cache_test.rs"]
mod kv_cache_test;

use anyhow::Result;
use half::f16;

/// Element type of the cached keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvType {
    #[default]
    F32,
    F16,
}

#[derive(Debug, Clone)]
enum KvBuffer {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl KvBuffer {
    fn new(kind: KvType, len: usize) -> Self {
        match kind {
            KvType::F32 => KvBuffer::F32(vec![0.0; len]),
            KvType::F16 => KvBuffer::F16(vec![f16::ZERO; len]),
        }
    }

    fn write(&mut self, offset: usize, src: &[f32]) {
        match self {
            KvBuffer::F32(buf) => buf[offset..offset + src.len()].copy_from_slice(src),
            KvBuffer::F16(buf) => {
                buf[offset..offset + src.len()].iter_mut().zip(src).for_each(|(d, &s)| *d = f16::from_f32(s))
            }
        }
    }

    #[inline]
    fn dot(&self, offset: usize, q: &[f32]) -> f32 {
        match self {
            KvBuffer::F32(buf) => buf[offset..offset + q.len()].iter().zip(q).map(|(&k, &q)| k * q).sum(),
            KvBuffer::F16(buf) => buf[offset..offset + q.len()].iter().zip(q).map(|(&k, &q)| k.to_f32() * q).sum(),
        }
    }

    #[inline]
    fn axpy(&self, offset: usize, weight: f32, out: &mut [f32]) {
        let len = out.len();
        match self {
            KvBuffer::F32(buf) => {
                out.iter_mut().zip(&buf[offset..offset + len]).for_each(|(o, &v)| *o += weight * v)
            }
            KvBuffer::F16(buf) => {
                out.iter_mut().zip(&buf[offset..offset + len]).for_each(|(o, &v)| *o += weight * v.to_f32())
            }
        }
    }

    fn read(&self, offset: usize, out: &mut [f32]) {
        let len = out.len();
        match self {
            KvBuffer::F32(buf) => out.copy_from_slice(&buf[offset..offset + out.len()]),
            KvBuffer::F16(buf) => {
                out.iter_mut().zip(&buf[offset..offset + len]).for_each(|(o, &v)| *o = v.to_f32())
            }
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            KvBuffer::F32(buf) => buf.len() * 4,
            KvBuffer::F16(buf) => buf.len() * 2,
        }
    }
}

/// Per-layer key/value history indexed by absolute position.
///
/// Each layer holds `n_ctx × kv_dim` keys and values. `n` counts the filled
/// positions; it only moves forward through [`KvCache::advance`] after a decode call
/// has completed.
#[derive(Debug, Clone)]
pub struct KvCache {
    kind: KvType,
    n_layer: usize,
    n_ctx: usize,
    kv_dim: usize,
    k: Vec<KvBuffer>,
    v: Vec<KvBuffer>,
    n: usize,
}

impl KvCache {
    pub fn new(kind: KvType, n_layer: usize, n_ctx: usize, kv_dim: usize) -> Self {
        Self {
            kind,
            n_layer,
            n_ctx,
            kv_dim,
            k: (0..n_layer).map(|_| KvBuffer::new(kind, n_ctx * kv_dim)).collect(),
            v: (0..n_layer).map(|_| KvBuffer::new(kind, n_ctx * kv_dim)).collect(),
            n: 0,
        }
    }

    pub fn kind(&self) -> KvType {
        self.kind
    }

    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Number of filled positions.
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn size_bytes(&self) -> usize {
        self.k.iter().chain(&self.v).map(KvBuffer::size_bytes).sum()
    }

    /// Checks that `n_tokens` positions starting at `n_past` fit into the cache.
    pub fn check_capacity(&self, n_past: usize, n_tokens: usize) -> Result<()> {
        if n_past + n_tokens > self.n_ctx {
            anyhow::bail!("KV cache overflow: {n_past} + {n_tokens} positions exceed capacity {}", self.n_ctx);
        }
        Ok(())
    }

    /// Writes keys and values for positions `[n_past, n_past + N)` of `layer`.
    ///
    /// `k` and `v` hold `N` rows of `kv_dim` values. Positions outside that range are
    /// left untouched.
    pub fn store(&mut self, layer: usize, n_past: usize, k: &[f32], v: &[f32]) -> Result<()> {
        if layer >= self.n_layer {
            anyhow::bail!("KV cache has {} layers, got layer {layer}", self.n_layer);
        }
        if k.len() != v.len() || k.len() % self.kv_dim != 0 {
            anyhow::bail!("KV store expects whole rows of {}: got {} keys and {} values", self.kv_dim, k.len(), v.len());
        }
        self.check_capacity(n_past, k.len() / self.kv_dim)?;

        let offset = n_past * self.kv_dim;
        self.k[layer].write(offset, k);
        self.v[layer].write(offset, v);
        Ok(())
    }

    /// Dot product of `q` with the key slice at `(layer, pos)` starting at `offset` within the row.
    #[inline]
    pub fn dot_key(&self, layer: usize, pos: usize, offset: usize, q: &[f32]) -> f32 {
        self.k[layer].dot(pos * self.kv_dim + offset, q)
    }

    /// Adds `weight ×` the value slice at `(layer, pos)` to `out`.
    #[inline]
    pub fn add_value(&self, layer: usize, pos: usize, offset: usize, weight: f32, out: &mut [f32]) {
        self.v[layer].axpy(pos * self.kv_dim + offset, weight, out)
    }

    /// Copies the key row of `(layer, pos)` into `out`.
    pub fn read_key(&self, layer: usize, pos: usize, out: &mut [f32]) {
        self.k[layer].read(pos * self.kv_dim, &mut out[..self.kv_dim])
    }

    /// Copies the value row of `(layer, pos)` into `out`.
    pub fn read_value(&self, layer: usize, pos: usize, out: &mut [f32]) {
        self.v[layer].read(pos * self.kv_dim, &mut out[..self.kv_dim])
    }

    /// Marks `[0, n)` as filled. Called once a decode call has finished.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.n_ctx);
        self.n = n;
    }

    /// Forgets every cached position.
    pub fn clear(&mut self) {
        self.n = 0;
    }
}
