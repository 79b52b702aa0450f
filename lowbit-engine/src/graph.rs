//! Compute graph of one decode call: an ordered list of operations over arena
//! tensors, interleaved with the points where scratch regions are recycled.

#[cfg(test)]
#[path = "../tests/unit/graph_test.rs"]
mod graph_test;

use anyhow::{Context, Result};
use log::debug;
use lowbit_quant::ElementType;

use crate::arena::{Arena, Region, Span};
use crate::context::EvalError;
use crate::kernels::{Epilogue, KernelRegistry};
use crate::kv_cache::KvCache;
use crate::model::{Model, WeightId};
use crate::ops::{self, NormKind};
use crate::scheduler::Scheduler;
use crate::tensor::{Layout, Resolved, Storage, Tensor, TensorId, check_view_bounds, resolve};

/// Tensor operations. Shapes are `[ne0, ne1, ...]`, innermost first; activations are
/// `[width, n_tokens]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Embedding rows of `tokens`.
    GetRows { weight: WeightId, tokens: Vec<u32> },
    /// `input` plus rows `first..first + N` of `weight` (learned positions).
    AddRows { input: TensorId, weight: WeightId, first: usize },
    Norm { kind: NormKind, input: TensorId, weight: Option<WeightId>, bias: Option<WeightId>, eps: f32 },
    /// `weight · input (+ residual) (+ bias)`.
    MatMul { weight: WeightId, input: TensorId, bias: Option<WeightId>, residual: Option<TensorId> },
    Add { a: TensorId, b: TensorId },
    /// Copies a strided view into contiguous memory.
    Cont { input: TensorId },
    /// Rotary embedding of `[head_dim, n_heads, N]` at positions `n_past..`.
    Rope { input: TensorId, n_past: usize, n_rot: usize, theta: f32 },
    /// Writes `[kv_dim, N]` keys and values into the cache at `n_past`.
    KvStore { layer: usize, k: TensorId, v: TensorId, n_past: usize },
    /// Scaled `q · K` over cache positions `0..n_kv`, shape `[n_kv, N, n_head]`.
    AttnScores { q: TensorId, layer: usize, n_kv: usize, scale: f32 },
    Alibi { input: TensorId, bias_max: f32 },
    MaskCausal { input: TensorId, n_past: usize },
    SoftMax { input: TensorId },
    /// Probability-weighted sum of cached values, shape `[head_dim · n_head, N]`.
    AttnOutput { probs: TensorId, layer: usize, head_dim: usize },
    Gelu { input: TensorId },
    /// `silu(gate) · up`.
    SwiGlu { gate: TensorId, up: TensorId },
    Clamp { input: TensorId, limit: f32 },
}

impl Op {
    /// Graph tensors this op reads, in argument order.
    pub fn inputs(&self) -> Vec<TensorId> {
        match *self {
            Op::GetRows { .. } => vec![],
            Op::MatMul { input, residual, .. } => std::iter::once(input).chain(residual).collect(),
            Op::Add { a, b } => vec![a, b],
            Op::KvStore { k, v, .. } => vec![k, v],
            Op::AttnScores { q, .. } => vec![q],
            Op::AttnOutput { probs, .. } => vec![probs],
            Op::SwiGlu { gate, up } => vec![gate, up],
            Op::AddRows { input, .. }
            | Op::Norm { input, .. }
            | Op::Cont { input }
            | Op::Rope { input, .. }
            | Op::Alibi { input, .. }
            | Op::MaskCausal { input, .. }
            | Op::SoftMax { input }
            | Op::Gelu { input }
            | Op::Clamp { input, .. } => vec![input],
        }
    }

    /// Cache layer this op touches, if any.
    fn kv_layer(&self) -> Option<usize> {
        match *self {
            Op::KvStore { layer, .. } | Op::AttnScores { layer, .. } | Op::AttnOutput { layer, .. } => Some(layer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    /// `None` for side-effect-only ops.
    pub output: Option<TensorId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Compute(Node),
    /// Rewinds a scratch region; tensors planned in it before this point become stale.
    Recycle(Region),
}

/// Read-only collaborators of graph execution.
pub struct ExecContext<'a> {
    pub model: &'a Model,
    pub kernels: &'a KernelRegistry,
    pub scheduler: &'a Scheduler,
    pub n_threads: usize,
}

/// A built graph, ready to be validated and executed against the arena it was planned in.
#[derive(Debug, Clone)]
pub struct Graph {
    tensors: Vec<Tensor>,
    steps: Vec<Step>,
    n_tokens: usize,
    n_past: usize,
    output: TensorId,
}

impl Graph {
    pub(crate) fn new(tensors: Vec<Tensor>, steps: Vec<Step>, n_tokens: usize, n_past: usize, output: TensorId) -> Self {
        Self { tensors, steps, n_tokens, n_past, output }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn n_nodes(&self) -> usize {
        self.steps.iter().filter(|s| matches!(s, Step::Compute(_))).count()
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// The tensor holding the logits, `[n_vocab, N]`.
    pub fn output(&self) -> TensorId {
        self.output
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name == name)
    }

    fn root(&self, mut id: TensorId) -> TensorId {
        while let Storage::View { base, .. } = self.tensors[id].storage {
            id = base;
        }
        id
    }

    /// Checks the op list before anything runs.
    ///
    /// Every input must have been produced by an earlier op and still be live in
    /// its region, inputs other than those of `Cont` must be contiguous, and
    /// attention must come after the cache store of its layer.
    pub fn validate(&self, kv: Option<&KvCache>) -> Result<(), EvalError> {
        let uses_cache = self.steps.iter().any(|s| matches!(s, Step::Compute(node) if node.op.kv_layer().is_some()));
        let kv = match kv {
            Some(kv) => Some(kv),
            None if uses_cache => return Err(EvalError::MissingKvCache),
            None => None,
        };
        if let Some(kv) = kv {
            if self.n_past + self.n_tokens > kv.n_ctx() {
                return Err(EvalError::ContextOverflow { n_past: self.n_past, n_tokens: self.n_tokens, n_ctx: kv.n_ctx() });
            }
        }

        let invalid = |msg: String| EvalError::InvalidGraph(msg);
        let mut epochs = [0u32; 3];
        let mut produced = vec![false; self.tensors.len()];
        let mut stored = Vec::new();

        let live = |span: &Span, epochs: &[u32; 3]| span.epoch == epochs[span.region.index()];

        for (i, step) in self.steps.iter().enumerate() {
            let node = match step {
                Step::Recycle(region) => {
                    epochs[region.index()] += 1;
                    continue;
                }
                Step::Compute(node) => node,
            };

            for input in node.op.inputs() {
                let tensor = self.tensors.get(input).ok_or_else(|| invalid(format!("step {i} reads unknown tensor {input}")))?;
                let resolved = resolve(&self.tensors, input).map_err(|e| invalid(e.to_string()))?;
                if !produced[self.root(input)] {
                    return Err(invalid(format!("step {i} reads '{}' before it is produced", tensor.name)));
                }
                if !live(&resolved.span, &epochs) {
                    return Err(EvalError::Clobbered(tensor.name.clone()));
                }
                if !matches!(node.op, Op::Cont { .. }) && !tensor.layout.is_contiguous() {
                    return Err(invalid(format!("step {i} reads non-contiguous tensor '{}'", tensor.name)));
                }
            }

            if let Some(layer) = node.op.kv_layer() {
                if let Some(kv) = kv {
                    if layer >= kv.n_layer() {
                        return Err(invalid(format!("step {i} uses cache layer {layer} of {}", kv.n_layer())));
                    }
                }
                match node.op {
                    Op::KvStore { .. } => stored.push(layer),
                    _ if !stored.contains(&layer) => {
                        return Err(invalid(format!("step {i} attends layer {layer} before storing its keys")));
                    }
                    _ => {}
                }
            }

            match node.output {
                Some(out) => {
                    let tensor = self.tensors.get(out).ok_or_else(|| invalid(format!("step {i} writes unknown tensor {out}")))?;
                    let Storage::Arena(span) = tensor.storage else {
                        return Err(invalid(format!("step {i} writes into view '{}'", tensor.name)));
                    };
                    if produced[out] {
                        return Err(invalid(format!("tensor '{}' is produced twice", tensor.name)));
                    }
                    if !live(&span, &epochs) {
                        return Err(EvalError::Clobbered(tensor.name.clone()));
                    }
                    produced[out] = true;
                }
                None if !matches!(node.op, Op::KvStore { .. }) => {
                    return Err(invalid(format!("step {i} has no output")));
                }
                None => {}
            }
        }

        if !produced.get(self.output).copied().unwrap_or(false) {
            return Err(invalid("graph output is never produced".to_string()));
        }
        Ok(())
    }

    /// Runs every op in order. The arena must be committed.
    pub fn execute(&self, ctx: &ExecContext<'_>, arena: &mut Arena, kv: &mut KvCache) -> Result<(), EvalError> {
        for step in &self.steps {
            if let Step::Compute(node) = step {
                self.run_node(node, ctx, arena, kv)
                    .with_context(|| format!("Failed to compute '{}'", self.node_name(node)))?;
            }
        }
        Ok(())
    }

    fn node_name(&self, node: &Node) -> String {
        match node.output {
            Some(out) => self.tensors[out].name.clone(),
            None => format!("{:?}", node.op),
        }
    }

    /// Input data of a tensor: from its first element through its last, following strides.
    fn input_slice<'s>(&self, data: &'s [f32], resolved: &Resolved, id: TensorId) -> &'s [f32] {
        let len = self.tensors[id].layout.extent_bytes() / 4;
        &data[resolved.start..resolved.start + len]
    }

    fn run_node(&self, node: &Node, ctx: &ExecContext<'_>, arena: &mut Arena, kv: &mut KvCache) -> Result<()> {
        let inputs = node.op.inputs();
        let resolved = inputs.iter().map(|&id| resolve(&self.tensors, id)).collect::<Result<Vec<_>>>()?;

        let Some(out_id) = node.output else {
            if let Op::KvStore { layer, n_past, .. } = node.op {
                let k = self.input_slice(arena.slice(&resolved[0].span), &resolved[0], inputs[0]);
                let v = self.input_slice(arena.slice(&resolved[1].span), &resolved[1], inputs[1]);
                kv.store(layer, n_past, k, v)?;
            }
            return Ok(());
        };

        let out_span = resolve(&self.tensors, out_id)?.span;
        let spans: Vec<Span> = resolved.iter().map(|r| r.span).collect();
        let (reads, out) = arena.split_io(&spans, &out_span)?;
        let ins: Vec<&[f32]> =
            reads.iter().zip(&resolved).zip(&inputs).map(|((data, r), &id)| self.input_slice(data, r, id)).collect();

        self.compute(node, &ins, out, ctx, kv)
    }

    fn compute(&self, node: &Node, ins: &[&[f32]], out: &mut [f32], ctx: &ExecContext<'_>, kv: &KvCache) -> Result<()> {
        let model = ctx.model;
        let out_ne = node.output.map(|id| self.tensors[id].layout.ne).unwrap_or([1; 4]);
        let width = out_ne[0];

        match &node.op {
            Op::GetRows { weight, tokens } => {
                let weight = model.weight(*weight);
                for (row, &token) in out.chunks_exact_mut(width).zip(tokens) {
                    weight.row(token as usize, row)?;
                }
            }
            Op::AddRows { weight, first, .. } => {
                let weight = model.weight(*weight);
                for (t, (row, input)) in out.chunks_exact_mut(width).zip(ins[0].chunks_exact(width)).enumerate() {
                    weight.row(first + t, row)?;
                    row.iter_mut().zip(input).for_each(|(o, &x)| *o += x);
                }
            }
            Op::Norm { kind, weight, bias, eps, .. } => {
                let weight = weight.map(|id| model.weight(id).values()).transpose()?;
                let bias = bias.map(|id| model.weight(id).values()).transpose()?;
                for (row, input) in out.chunks_exact_mut(width).zip(ins[0].chunks_exact(width)) {
                    ops::norm(*kind, row, input, weight, bias, *eps);
                }
            }
            Op::MatMul { weight, bias, residual, .. } => {
                let weight = model.weight(*weight);
                let operand = weight.operand();
                let kernel = ctx.kernels.select_for(&operand)?;
                let m = ins[0].len() / operand.k();

                let epilogue = match residual {
                    Some(_) => {
                        out.copy_from_slice(ins[1]);
                        Epilogue::Accumulate
                    }
                    None => Epilogue::Write,
                };
                ctx.scheduler.matmul(kernel, &operand, ins[0], m, out, epilogue, ctx.n_threads)?;

                if let Some(bias) = bias {
                    let bias = model.weight(*bias).values()?;
                    for row in out.chunks_exact_mut(width) {
                        row.iter_mut().zip(bias).for_each(|(o, &b)| *o += b);
                    }
                }
            }
            Op::Add { .. } => {
                out.iter_mut().zip(ins[0].iter().zip(ins[1])).for_each(|(o, (&a, &b))| *o = a + b);
            }
            Op::Cont { input } => {
                let layout = self.tensors[*input].layout;
                let mut dst = out.iter_mut();
                for i3 in 0..layout.ne[3] {
                    for i2 in 0..layout.ne[2] {
                        for i1 in 0..layout.ne[1] {
                            for i0 in 0..layout.ne[0] {
                                if let Some(d) = dst.next() {
                                    *d = ins[0][layout.offset_of([i0, i1, i2, i3]) / 4];
                                }
                            }
                        }
                    }
                }
            }
            Op::Rope { n_past, n_rot, theta, .. } => {
                out.copy_from_slice(ins[0]);
                let (head_dim, n_heads) = (out_ne[0], out_ne[1]);
                for (t, token) in out.chunks_exact_mut(head_dim * n_heads).enumerate() {
                    for head in token.chunks_exact_mut(head_dim) {
                        ops::rope(head, n_past + t, *n_rot, *theta);
                    }
                }
            }
            Op::KvStore { .. } => unreachable!("cache stores have no output"),
            Op::AttnScores { q, layer, n_kv, scale } => {
                let q_ne = self.tensors[*q].layout.ne;
                let (head_dim, n_head, n_tokens) = (q_ne[0], q_ne[1], q_ne[2]);
                let group = n_head / (kv.kv_dim() / head_dim).max(1);
                for h in 0..n_head {
                    let kv_offset = (h / group) * head_dim;
                    for t in 0..n_tokens {
                        let query = &ins[0][(t * n_head + h) * head_dim..][..head_dim];
                        let row = &mut out[(h * n_tokens + t) * n_kv..][..*n_kv];
                        for (j, score) in row.iter_mut().enumerate() {
                            *score = kv.dot_key(*layer, j, kv_offset, query) * scale;
                        }
                    }
                }
            }
            Op::Alibi { bias_max, .. } => {
                let (n_kv, n_tokens, n_head) = (out_ne[0], out_ne[1], out_ne[2]);
                let slopes = ops::alibi_slopes(n_head, *bias_max);
                for (i, (row, input)) in out.chunks_exact_mut(n_kv).zip(ins[0].chunks_exact(n_kv)).enumerate() {
                    let slope = slopes[i / n_tokens];
                    row.iter_mut().zip(input).enumerate().for_each(|(j, (o, &x))| *o = x + slope * j as f32);
                }
            }
            Op::MaskCausal { n_past, .. } => {
                let (n_kv, n_tokens) = (out_ne[0], out_ne[1]);
                out.copy_from_slice(ins[0]);
                for (i, row) in out.chunks_exact_mut(n_kv).enumerate() {
                    let visible = n_past + i % n_tokens + 1;
                    row.iter_mut().skip(visible).for_each(|v| *v = f32::NEG_INFINITY);
                }
            }
            Op::SoftMax { .. } => {
                out.copy_from_slice(ins[0]);
                out.chunks_exact_mut(width).for_each(ops::softmax);
            }
            Op::AttnOutput { probs, layer, head_dim } => {
                let p_ne = self.tensors[*probs].layout.ne;
                let (n_kv, n_tokens, n_head) = (p_ne[0], p_ne[1], p_ne[2]);
                let group = n_head / (kv.kv_dim() / head_dim).max(1);
                out.fill(0.0);
                for h in 0..n_head {
                    let kv_offset = (h / group) * head_dim;
                    for t in 0..n_tokens {
                        let weights = &ins[0][(h * n_tokens + t) * n_kv..][..n_kv];
                        let dst = &mut out[t * width + h * head_dim..][..*head_dim];
                        for (j, &p) in weights.iter().enumerate() {
                            if p != 0.0 {
                                kv.add_value(*layer, j, kv_offset, p, dst);
                            }
                        }
                    }
                }
            }
            Op::Gelu { .. } => out.iter_mut().zip(ins[0]).for_each(|(o, &x)| *o = ops::gelu(x)),
            Op::SwiGlu { .. } => {
                out.iter_mut().zip(ins[0].iter().zip(ins[1])).for_each(|(o, (&g, &u))| *o = ops::silu(g) * u)
            }
            Op::Clamp { limit, .. } => out.iter_mut().zip(ins[0]).for_each(|(o, &x)| *o = x.clamp(-limit, *limit)),
        }
        Ok(())
    }
}

/// Plans tensors in the arena and records ops in order.
///
/// New tensors go to the current region; [`GraphBuilder::recycle`] rewinds a
/// region and makes it current.
pub struct GraphBuilder<'a> {
    model: &'a Model,
    arena: &'a mut Arena,
    tensors: Vec<Tensor>,
    steps: Vec<Step>,
    region: Region,
    n_past: usize,
    n_tokens: usize,
}

impl<'a> GraphBuilder<'a> {
    /// Starts a build; the arena is rewound first.
    pub fn new(model: &'a Model, arena: &'a mut Arena, n_past: usize, n_tokens: usize) -> Self {
        arena.reset();
        Self { model, arena, tensors: Vec::new(), steps: Vec::new(), region: Region::NoBound, n_past, n_tokens }
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    pub fn ne(&self, id: TensorId) -> [usize; 4] {
        self.tensors[id].layout.ne
    }

    /// Allocates subsequent tensors in `region` without rewinding it.
    pub fn use_region(&mut self, region: Region) {
        self.region = region;
    }

    pub fn recycle(&mut self, region: Region) {
        self.arena.recycle(region);
        self.steps.push(Step::Recycle(region));
        self.region = region;
    }

    fn alloc(&mut self, name: String, dims: &[usize]) -> Result<TensorId> {
        let layout = Layout::f32(dims);
        let span = self.arena.alloc(self.region, layout.n_elements()).with_context(|| format!("Cannot allocate '{name}'"))?;
        self.tensors.push(Tensor { name, layout, storage: Storage::Arena(span) });
        Ok(self.tensors.len() - 1)
    }

    fn compute(&mut self, name: String, dims: &[usize], op: Op) -> Result<TensorId> {
        let output = self.alloc(name, dims)?;
        self.steps.push(Step::Compute(Node { op, output: Some(output) }));
        Ok(output)
    }

    /// A strided view of `base` starting `offset` bytes in.
    pub fn view(&mut self, name: String, base: TensorId, ne: [usize; 4], nb: [usize; 4], offset: usize) -> Result<TensorId> {
        let layout = Layout { ty: ElementType::F32, ne, nb };
        check_view_bounds(&self.tensors[base], &layout, offset)?;
        self.tensors.push(Tensor { name, layout, storage: Storage::View { base, offset } });
        Ok(self.tensors.len() - 1)
    }

    /// A contiguous view of `base` with new dimensions and the same element count.
    pub fn reshape(&mut self, name: String, base: TensorId, dims: &[usize]) -> Result<TensorId> {
        let layout = Layout::f32(dims);
        if layout.n_elements() != self.tensors[base].layout.n_elements() {
            anyhow::bail!("Cannot reshape '{}' {:?} to {dims:?}", self.tensors[base].name, self.ne(base));
        }
        if !self.tensors[base].layout.is_contiguous() {
            anyhow::bail!("Cannot reshape non-contiguous '{}'", self.tensors[base].name);
        }
        self.view(name, base, layout.ne, layout.nb, 0)
    }

    fn same_shape(&self, a: TensorId, b: TensorId) -> Result<()> {
        if self.ne(a) != self.ne(b) {
            anyhow::bail!("Shape mismatch: '{}' {:?} vs '{}' {:?}", self.tensors[a].name, self.ne(a), self.tensors[b].name, self.ne(b));
        }
        Ok(())
    }

    fn check_vector(&self, weight: Option<WeightId>, len: usize) -> Result<()> {
        if let Some(id) = weight {
            let w = self.model.weight(id);
            if w.layout.n_elements() != len {
                anyhow::bail!("Weight '{}' has {} values, expected {len}", w.name, w.layout.n_elements());
            }
        }
        Ok(())
    }

    pub fn get_rows(&mut self, name: &str, weight: WeightId, tokens: &[u32]) -> Result<TensorId> {
        let width = self.model.weight(weight).row_len();
        self.compute(name.to_string(), &[width, tokens.len()], Op::GetRows { weight, tokens: tokens.to_vec() })
    }

    pub fn add_rows(&mut self, name: &str, input: TensorId, weight: WeightId) -> Result<TensorId> {
        let ne = self.ne(input);
        let w = self.model.weight(weight);
        if w.row_len() != ne[0] || self.n_past + ne[1] > w.n_rows() {
            anyhow::bail!("Weight '{}' cannot provide rows {}..{} of width {}", w.name, self.n_past, self.n_past + ne[1], ne[0]);
        }
        let first = self.n_past;
        self.compute(name.to_string(), &ne, Op::AddRows { input, weight, first })
    }

    pub fn norm(
        &mut self,
        name: String,
        kind: NormKind,
        input: TensorId,
        weight: Option<WeightId>,
        bias: Option<WeightId>,
    ) -> Result<TensorId> {
        let ne = self.ne(input);
        self.check_vector(weight, ne[0])?;
        self.check_vector(bias, ne[0])?;
        let eps = self.model.header.norm_eps;
        self.compute(name, &ne, Op::Norm { kind, input, weight, bias, eps })
    }

    pub fn matmul(
        &mut self,
        name: String,
        weight: WeightId,
        input: TensorId,
        bias: Option<WeightId>,
        residual: Option<TensorId>,
    ) -> Result<TensorId> {
        let ne = self.ne(input);
        let w = self.model.weight(weight);
        let (n, k) = (w.n_rows(), w.row_len());
        if ne[0] != k {
            anyhow::bail!("Cannot multiply '{}' ({n}×{k}) with '{}' {ne:?}", w.name, self.tensors[input].name);
        }
        self.check_vector(bias, n)?;
        let m = ne[1] * ne[2] * ne[3];
        if let Some(residual) = residual {
            if self.ne(residual) != [n, m, 1, 1] {
                anyhow::bail!("Residual '{}' does not match the {n}×{m} product", self.tensors[residual].name);
            }
        }
        self.compute(name, &[n, m], Op::MatMul { weight, input, bias, residual })
    }

    pub fn add(&mut self, name: String, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.same_shape(a, b)?;
        let ne = self.ne(a);
        self.compute(name, &ne, Op::Add { a, b })
    }

    pub fn cont(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        self.compute(name, &ne, Op::Cont { input })
    }

    pub fn rope(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        let header = &self.model.header;
        let n_rot = header.n_rot as usize;
        if n_rot > ne[0] {
            anyhow::bail!("Cannot rotate {n_rot} dimensions of heads of size {}", ne[0]);
        }
        let op = Op::Rope { input, n_past: self.n_past, n_rot, theta: header.rope_theta };
        self.compute(name, &ne, op)
    }

    pub fn kv_store(&mut self, layer: usize, k: TensorId, v: TensorId) -> Result<()> {
        self.same_shape(k, v)?;
        self.steps.push(Step::Compute(Node { op: Op::KvStore { layer, k, v, n_past: self.n_past }, output: None }));
        Ok(())
    }

    /// Scores of `q` (`[head_dim, n_head, N]`) against every cached key of `layer`.
    pub fn attn_scores(&mut self, name: String, q: TensorId, layer: usize) -> Result<TensorId> {
        let ne = self.ne(q);
        let (head_dim, n_head) = (ne[0], ne[1]);
        let n_head_kv = self.model.header.n_head_kv as usize;
        if n_head % n_head_kv != 0 {
            anyhow::bail!("{n_head} query heads cannot share {n_head_kv} key/value heads");
        }
        let n_kv = self.n_past + self.n_tokens;
        let scale = 1.0 / (head_dim as f32).sqrt();
        self.compute(name, &[n_kv, ne[2], n_head], Op::AttnScores { q, layer, n_kv, scale })
    }

    pub fn alibi(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        let bias_max = self.model.header.alibi_bias_max;
        self.compute(name, &ne, Op::Alibi { input, bias_max })
    }

    pub fn mask_causal(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        self.compute(name, &ne, Op::MaskCausal { input, n_past: self.n_past })
    }

    pub fn softmax(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        self.compute(name, &ne, Op::SoftMax { input })
    }

    pub fn attn_output(&mut self, name: String, probs: TensorId, layer: usize) -> Result<TensorId> {
        let ne = self.ne(probs);
        let head_dim = self.model.head_dim();
        self.compute(name, &[head_dim * ne[2], ne[1]], Op::AttnOutput { probs, layer, head_dim })
    }

    pub fn gelu(&mut self, name: String, input: TensorId) -> Result<TensorId> {
        let ne = self.ne(input);
        self.compute(name, &ne, Op::Gelu { input })
    }

    pub fn swiglu(&mut self, name: String, gate: TensorId, up: TensorId) -> Result<TensorId> {
        self.same_shape(gate, up)?;
        let ne = self.ne(gate);
        self.compute(name, &ne, Op::SwiGlu { gate, up })
    }

    pub fn clamp(&mut self, name: String, input: TensorId, limit: f32) -> Result<TensorId> {
        let ne = self.ne(input);
        self.compute(name, &ne, Op::Clamp { input, limit })
    }

    pub fn finish(self, output: TensorId) -> Graph {
        debug!(
            "Graph: {} tensors, {} steps, {:.2} MB planned",
            self.tensors.len(),
            self.steps.len(),
            self.arena.planned_bytes() as f64 / (1024.0 * 1024.0)
        );
        Graph::new(self.tensors, self.steps, self.n_tokens, self.n_past, output)
    }
}
