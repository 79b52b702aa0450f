//! Model runtime context: one decoding session over a loaded model.

use anyhow::{Context as _, Result};
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::arena::{Arena, Region};
use crate::graph::{ExecContext, Graph, GraphBuilder};
use crate::kernels::{CpuFeatures, KernelRegistry};
use crate::kv_cache::{KvCache, KvType};
use crate::model::Model;
use crate::scheduler::Scheduler;
use crate::tensor::Storage;

/// Batches of at least this many tokens run on one thread when BLAS is available.
const BLAS_BATCH_THRESHOLD: usize = 32;

/// Failures of a decode call. The cache fill counter is unchanged after any of them.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("No tokens to evaluate")]
    EmptyBatch,
    #[error("Context overflow: {n_past} past + {n_tokens} new tokens exceed n_ctx = {n_ctx}")]
    ContextOverflow { n_past: usize, n_tokens: usize, n_ctx: usize },
    #[error("The graph uses the KV cache but none was provided")]
    MissingKvCache,
    #[error("Token id {token} is out of range for a vocabulary of {n_vocab}")]
    InvalidToken { token: u32, n_vocab: usize },
    #[error("n_past = {n_past} is beyond the {filled} filled cache positions")]
    InvalidPast { n_past: usize, filled: usize },
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),
    #[error("Tensor '{0}' is read after its region was recycled")]
    Clobbered(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Options of a [`Context`].
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Cache capacity; defaults to the model's `n_ctx`.
    pub n_ctx: Option<usize>,
    pub n_threads: usize,
    pub kv_type: KvType,
    /// Keep logits of every position instead of only the last one.
    pub logits_all: bool,
    /// CPU features to select kernels for; detected when `None`.
    pub features: Option<CpuFeatures>,
    /// Per-region arena limit in f32 slots.
    pub scratch_limit: Option<usize>,
    pub has_blas: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: None,
            n_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            kv_type: KvType::F32,
            logits_all: false,
            features: None,
            scratch_limit: None,
            has_blas: false,
        }
    }
}

impl ContextParams {
    pub fn with_n_ctx(mut self, n_ctx: Option<usize>) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads.max(1);
        self
    }

    pub fn with_kv_type(mut self, kv_type: KvType) -> Self {
        self.kv_type = kv_type;
        self
    }

    pub fn with_logits_all(mut self, logits_all: bool) -> Self {
        self.logits_all = logits_all;
        self
    }

    pub fn with_features(mut self, features: CpuFeatures) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_scratch_limit(mut self, limit: Option<usize>) -> Self {
        self.scratch_limit = limit;
        self
    }

    pub fn with_blas(mut self, has_blas: bool) -> Self {
        self.has_blas = has_blas;
        self
    }
}

/// Timing and memory counters of a context.
#[derive(Debug, Clone, Default)]
pub struct EvalStats {
    /// Time from context creation to the end of the first decode call.
    pub t_load: Option<Duration>,
    pub t_p_eval: Duration,
    pub n_p_eval: usize,
    pub t_eval: Duration,
    pub n_eval: usize,
    pub t_last: Duration,
    /// Planned arena bytes per token of the first call.
    pub mem_per_token: usize,
}

/// Runtime state of one session: arena, KV cache, kernels and the last logits.
///
/// A context must not be driven by two decode calls at once; the model behind it
/// is shared read-only.
pub struct Context {
    model: Arc<Model>,
    params: ContextParams,
    registry: KernelRegistry,
    scheduler: Scheduler,
    arena: Arena,
    kv: KvCache,
    logits: Vec<f32>,
    stats: EvalStats,
    last_graph: Option<(Graph, [u32; 3])>,
    created: Instant,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("params", &self.params)
            .field("kv_filled", &self.kv.n())
            .field("n_ctx", &self.kv.n_ctx())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context. Fails when the CPU has no kernel for one of the model's weights.
    pub fn new(model: Arc<Model>, params: ContextParams) -> Result<Self> {
        let registry = match params.features {
            Some(features) => KernelRegistry::with_features(features),
            None => KernelRegistry::detect(),
        }
        .with_blas(params.has_blas);
        check_kernels(&model, &registry)?;

        let n_ctx = params.n_ctx.unwrap_or(model.header.n_ctx as usize);
        if n_ctx == 0 {
            anyhow::bail!("Context length must be positive");
        }
        if model.pos_embd.is_some() && n_ctx > model.header.n_ctx as usize {
            anyhow::bail!("Context length {n_ctx} exceeds the {} learned positions of the model", model.header.n_ctx);
        }

        let scheduler = Scheduler::new(params.n_threads.max(1))?;
        let kv = KvCache::new(params.kv_type, model.n_layer(), n_ctx, model.kv_dim());
        info!(
            "Context: n_ctx = {n_ctx}, {} threads, KV cache {:?} {:.2} MB, L2 {} KB",
            scheduler.n_threads(),
            params.kv_type,
            kv.size_bytes() as f64 / (1024.0 * 1024.0),
            scheduler.l2_bytes() / 1024
        );
        debug!("{params:#?}");

        Ok(Self {
            model,
            arena: Arena::new(params.scratch_limit),
            params,
            registry,
            scheduler,
            kv,
            logits: Vec::new(),
            stats: EvalStats::default(),
            last_graph: None,
            created: Instant::now(),
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv
    }

    pub fn n_ctx(&self) -> usize {
        self.kv.n_ctx()
    }

    /// Filled cache positions, the `n_past` of the next call.
    pub fn n_past(&self) -> usize {
        self.kv.n()
    }

    /// Logits of the last call: one row of `n_vocab`, or one row per position with `logits_all`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn stats(&self) -> &EvalStats {
        &self.stats
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Forgets the cached history.
    pub fn clear(&mut self) {
        self.kv.clear();
        self.logits.clear();
        self.last_graph = None;
    }

    /// Runs the model over `tokens` placed at positions `n_past..n_past + N`.
    ///
    /// `n_past` may rewind into the filled history but not skip past it. On
    /// success the cache holds `n_past + N` positions and the logits are updated.
    pub fn evaluate(&mut self, tokens: &[u32], n_past: usize, n_threads: usize) -> Result<(), EvalError> {
        let start = Instant::now();
        let n_tokens = tokens.len();
        if n_tokens == 0 {
            return Err(EvalError::EmptyBatch);
        }
        if n_past > self.kv.n() {
            return Err(EvalError::InvalidPast { n_past, filled: self.kv.n() });
        }
        if n_past + n_tokens > self.kv.n_ctx() {
            return Err(EvalError::ContextOverflow { n_past, n_tokens, n_ctx: self.kv.n_ctx() });
        }
        let n_vocab = self.model.n_vocab();
        if let Some(&token) = tokens.iter().find(|&&t| t as usize >= n_vocab) {
            return Err(EvalError::InvalidToken { token, n_vocab });
        }

        let n_threads = if n_tokens >= BLAS_BATCH_THRESHOLD && self.registry.has_blas() { 1 } else { n_threads.max(1) };

        let model = Arc::clone(&self.model);
        let mut builder = GraphBuilder::new(&model, &mut self.arena, n_past, n_tokens);
        let output = model.adapter.build(&mut builder, tokens)?;
        let graph = builder.finish(output);

        graph.validate(Some(&self.kv))?;
        self.arena.commit();

        let ctx = ExecContext { model: &model, kernels: &self.registry, scheduler: &self.scheduler, n_threads };
        graph.execute(&ctx, &mut self.arena, &mut self.kv)?;

        self.extract_logits(&graph, n_vocab)?;
        let epochs = Region::ALL.map(|r| self.arena.epoch(r));
        let planned = self.arena.planned_bytes();
        self.arena.reset();
        self.last_graph = Some((graph, epochs));
        self.kv.advance(n_past + n_tokens);

        self.record_timing(start.elapsed(), n_tokens, planned);
        Ok(())
    }

    fn extract_logits(&mut self, graph: &Graph, n_vocab: usize) -> Result<()> {
        let output = &graph.tensors()[graph.output()];
        let Storage::Arena(span) = output.storage else {
            anyhow::bail!("Logits tensor '{}' is a view", output.name);
        };
        let data = self.arena.slice(&span);
        let rows = if self.params.logits_all { data } else { &data[(graph.n_tokens() - 1) * n_vocab..] };
        self.logits.clear();
        self.logits.extend_from_slice(rows);
        Ok(())
    }

    fn record_timing(&mut self, elapsed: Duration, n_tokens: usize, planned_bytes: usize) {
        let stats = &mut self.stats;
        if stats.t_load.is_none() {
            stats.t_load = Some(self.created.elapsed());
            stats.mem_per_token = planned_bytes / n_tokens;
        }
        if n_tokens > 1 {
            stats.t_p_eval += elapsed;
            stats.n_p_eval += n_tokens;
        } else {
            stats.t_eval += elapsed;
            stats.n_eval += 1;
        }
        stats.t_last = elapsed;
    }

    /// Data of a named tensor of the last call, if its region was not recycled afterwards.
    pub fn inspect(&self, name: &str) -> Option<Vec<f32>> {
        let (graph, epochs) = self.last_graph.as_ref()?;
        let tensor = &graph.tensors()[graph.find(name)?];
        let Storage::Arena(span) = tensor.storage else {
            return None;
        };
        if span.epoch != epochs[span.region.index()] {
            return None;
        }
        Some(self.arena.slice(&span).to_vec())
    }

    pub fn print_timings(&self) {
        let s = &self.stats;
        let per_token = |t: Duration, n: usize| if n > 0 { t.as_secs_f64() * 1000.0 / n as f64 } else { 0.0 };

        info!("load time = {:8.2} ms", s.t_load.unwrap_or_default().as_secs_f64() * 1000.0);
        info!(
            "prompt eval time = {:8.2} ms / {} tokens ({:8.2} ms per token)",
            s.t_p_eval.as_secs_f64() * 1000.0,
            s.n_p_eval,
            per_token(s.t_p_eval, s.n_p_eval)
        );
        info!(
            "eval time = {:8.2} ms / {} runs ({:8.2} ms per run)",
            s.t_eval.as_secs_f64() * 1000.0,
            s.n_eval,
            per_token(s.t_eval, s.n_eval)
        );
        info!("mem per token = {} bytes", s.mem_per_token);
    }
}

/// Every matrix-multiply weight needs a kernel on this CPU.
fn check_kernels(model: &Model, registry: &KernelRegistry) -> Result<()> {
    let layer_weights = model.layers.iter().flat_map(|l| {
        [l.wq, l.wk, l.wv, l.wqkv, Some(l.wo), l.w_gate, Some(l.w_up), Some(l.w_down)].into_iter().flatten()
    });
    for id in layer_weights.chain(std::iter::once(model.output)) {
        let weight = model.weight(id);
        registry.select_for(&weight.operand()).with_context(|| format!("Cannot run weight '{}'", weight.name))?;
    }
    Ok(())
}
