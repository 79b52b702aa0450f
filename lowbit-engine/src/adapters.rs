//! Decoder-layer adapters: the op sequence of each supported model family.

use anyhow::Result;
use lowbit_quant::ModelHeader;

use crate::arena::Region;
use crate::graph::GraphBuilder;
use crate::model::{LayerWeights, WeightTable};
use crate::ops::NormKind;
use crate::tensor::TensorId;

/// Model family, selected once from the architecture id in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// RMS norm, separate Q/K/V, rotary positions, grouped-query attention, SwiGLU.
    Rotary,
    /// Layer norm, fused QKV with optional clipping, ALiBi, GELU.
    LinearBias,
    /// Learned positions, layer norm with bias, fused QKV with bias, GELU with biases.
    FusedQkv,
}

impl Adapter {
    pub fn from_arch(arch: u32) -> Result<Self> {
        match arch {
            1 => Ok(Self::Rotary),
            2 => Ok(Self::LinearBias),
            3 => Ok(Self::FusedQkv),
            other => anyhow::bail!("Unknown model architecture id {other}"),
        }
    }

    pub fn arch(self) -> u32 {
        match self {
            Self::Rotary => 1,
            Self::LinearBias => 2,
            Self::FusedQkv => 3,
        }
    }

    fn norm_kind(self) -> NormKind {
        match self {
            Self::Rotary => NormKind::Rms,
            Self::LinearBias | Self::FusedQkv => NormKind::Layer,
        }
    }

    /// Resolves and shape-checks the weights of layer `i`.
    pub fn bind_layer(self, table: &WeightTable, header: &ModelHeader, i: usize) -> Result<LayerWeights> {
        let e = header.n_embd as usize;
        let f = header.n_ff as usize;
        let hd = header.head_dim() as usize;
        let kv = hd * header.n_head_kv as usize;
        let name = |suffix: &str| format!("blk.{i}.{suffix}");

        let mut layer = LayerWeights {
            attn_norm: table.require(&name("attn_norm.weight"), &[e])?,
            wo: table.require(&name("attn_output.weight"), &[e, e])?,
            ffn_norm: table.require(&name("ffn_norm.weight"), &[e])?,
            w_up: table.require(&name("ffn_up.weight"), &[e, f])?,
            w_down: table.require(&name("ffn_down.weight"), &[f, e])?,
            ..LayerWeights::default()
        };

        match self {
            Self::Rotary => {
                layer.wq = Some(table.require(&name("attn_q.weight"), &[e, e])?);
                layer.wk = Some(table.require(&name("attn_k.weight"), &[e, kv])?);
                layer.wv = Some(table.require(&name("attn_v.weight"), &[e, kv])?);
                layer.bq = table.optional(&name("attn_q.bias"), &[e])?;
                layer.bk = table.optional(&name("attn_k.bias"), &[kv])?;
                layer.bv = table.optional(&name("attn_v.bias"), &[kv])?;
                layer.q_norm = table.optional(&name("attn_q_norm.weight"), &[hd])?;
                layer.k_norm = table.optional(&name("attn_k_norm.weight"), &[hd])?;
                layer.w_gate = Some(table.require(&name("ffn_gate.weight"), &[e, f])?);
            }
            Self::LinearBias => {
                if header.n_head_kv != header.n_head {
                    anyhow::bail!("Fused QKV needs as many key/value heads as query heads");
                }
                layer.wqkv = Some(table.require(&name("attn_qkv.weight"), &[e, 3 * e])?);
            }
            Self::FusedQkv => {
                if header.n_head_kv != header.n_head {
                    anyhow::bail!("Fused QKV needs as many key/value heads as query heads");
                }
                layer.attn_norm_b = Some(table.require(&name("attn_norm.bias"), &[e])?);
                layer.wqkv = Some(table.require(&name("attn_qkv.weight"), &[e, 3 * e])?);
                layer.bqkv = Some(table.require(&name("attn_qkv.bias"), &[3 * e])?);
                layer.bo = Some(table.require(&name("attn_output.bias"), &[e])?);
                layer.ffn_norm_b = Some(table.require(&name("ffn_norm.bias"), &[e])?);
                layer.b_up = Some(table.require(&name("ffn_up.bias"), &[f])?);
                layer.b_down = Some(table.require(&name("ffn_down.bias"), &[e])?);
            }
        }
        Ok(layer)
    }

    /// Checks model-wide tensors the adapter depends on.
    pub fn check_globals(self, has_pos_embd: bool) -> Result<()> {
        match (self, has_pos_embd) {
            (Self::FusedQkv, false) => anyhow::bail!("Tensor 'pos_embd.weight' not found in model file"),
            (Self::Rotary | Self::LinearBias, true) => {
                anyhow::bail!("Unexpected 'pos_embd.weight' for a {self:?} model")
            }
            _ => Ok(()),
        }
    }

    /// Builds the whole forward pass and returns the logits tensor.
    ///
    /// The embedding lives in scratch 1, layer `i` recycles `Region::for_layer(i)`,
    /// and the final norm and logits go to the no-bound region.
    pub fn build(self, b: &mut GraphBuilder<'_>, tokens: &[u32]) -> Result<TensorId> {
        let model = b.model();

        b.use_region(Region::Scratch1);
        let mut cur = b.get_rows("inp_embd", model.tok_embd, tokens)?;
        if let Some(pos_embd) = model.pos_embd {
            cur = b.add_rows("inp_pos", cur, pos_embd)?;
        }

        for i in 0..model.n_layer() {
            b.recycle(Region::for_layer(i));
            cur = match self {
                Self::Rotary => self.rotary_layer(b, i, cur)?,
                Self::LinearBias | Self::FusedQkv => self.fused_layer(b, i, cur)?,
            };
        }

        b.use_region(Region::NoBound);
        let cur = b.norm("result_norm".into(), self.norm_kind(), cur, Some(model.output_norm), model.output_norm_b)?;
        b.matmul("result_output".into(), model.output, cur, None, None)
    }

    fn rotary_layer(self, b: &mut GraphBuilder<'_>, i: usize, inp: TensorId) -> Result<TensorId> {
        let model = b.model();
        let l = &model.layers[i];
        let (hd, n_tokens) = (model.head_dim(), b.n_tokens());
        let (n_head, n_head_kv) = (model.header.n_head as usize, model.header.n_head_kv as usize);
        let (wq, wk, wv) = (required(l.wq, "attn_q", i)?, required(l.wk, "attn_k", i)?, required(l.wv, "attn_v", i)?);

        let cur = b.norm(format!("attn_norm.{i}"), NormKind::Rms, inp, Some(l.attn_norm), None)?;
        let q = b.matmul(format!("q.{i}"), wq, cur, l.bq, None)?;
        let k = b.matmul(format!("k.{i}"), wk, cur, l.bk, None)?;
        let v = b.matmul(format!("v.{i}"), wv, cur, l.bv, None)?;

        let mut q = b.reshape(format!("q_heads.{i}"), q, &[hd, n_head, n_tokens])?;
        let mut k = b.reshape(format!("k_heads.{i}"), k, &[hd, n_head_kv, n_tokens])?;
        if let Some(q_norm) = l.q_norm {
            q = b.norm(format!("q_norm.{i}"), NormKind::Rms, q, Some(q_norm), None)?;
        }
        if let Some(k_norm) = l.k_norm {
            k = b.norm(format!("k_norm.{i}"), NormKind::Rms, k, Some(k_norm), None)?;
        }
        let q = b.rope(format!("q_rope.{i}"), q)?;
        let k = b.rope(format!("k_rope.{i}"), k)?;
        let k = b.reshape(format!("k_cur.{i}"), k, &[hd * n_head_kv, n_tokens])?;

        let attn = attention(b, i, q, k, v, false)?;
        let cur = b.matmul(format!("attn_out.{i}"), l.wo, attn, l.bo, Some(inp))?;

        let ffn_in = cur;
        let cur = b.norm(format!("ffn_norm.{i}"), NormKind::Rms, ffn_in, Some(l.ffn_norm), None)?;
        let gate = b.matmul(format!("ffn_gate.{i}"), required(l.w_gate, "ffn_gate", i)?, cur, None, None)?;
        let up = b.matmul(format!("ffn_up.{i}"), l.w_up, cur, l.b_up, None)?;
        let act = b.swiglu(format!("ffn_act.{i}"), gate, up)?;
        b.matmul(format!("l_out.{i}"), l.w_down, act, l.b_down, Some(ffn_in))
    }

    fn fused_layer(self, b: &mut GraphBuilder<'_>, i: usize, inp: TensorId) -> Result<TensorId> {
        let model = b.model();
        let l = &model.layers[i];
        let (hd, n_head, n_tokens) = (model.head_dim(), model.header.n_head as usize, b.n_tokens());
        let e = model.n_embd();

        let cur = b.norm(format!("attn_norm.{i}"), NormKind::Layer, inp, Some(l.attn_norm), l.attn_norm_b)?;
        let mut qkv = b.matmul(format!("qkv.{i}"), required(l.wqkv, "attn_qkv", i)?, cur, l.bqkv, None)?;
        let clip = model.header.clip_qkv;
        if self == Self::LinearBias && clip > 0.0 {
            qkv = b.clamp(format!("qkv_clamped.{i}"), qkv, clip)?;
        }

        // q, k and v are interleaved per token: [q | k | v] rows of 3·n_embd
        let ne = [hd, n_head, n_tokens, 1];
        let nb = [4, hd * 4, 3 * e * 4, 3 * e * 4 * n_tokens];
        let mut parts = [0; 3];
        for (p, part) in ["q", "k", "v"].iter().enumerate() {
            let view = b.view(format!("{part}_view.{i}"), qkv, ne, nb, p * e * 4)?;
            parts[p] = b.cont(format!("{part}.{i}"), view)?;
        }
        let [q, k, v] = parts;
        let k = b.reshape(format!("k_cur.{i}"), k, &[e, n_tokens])?;
        let v = b.reshape(format!("v_cur.{i}"), v, &[e, n_tokens])?;

        let attn = attention(b, i, q, k, v, self == Self::LinearBias)?;
        let cur = b.matmul(format!("attn_out.{i}"), l.wo, attn, l.bo, Some(inp))?;

        let ffn_in = cur;
        let cur = b.norm(format!("ffn_norm.{i}"), NormKind::Layer, ffn_in, Some(l.ffn_norm), l.ffn_norm_b)?;
        let up = b.matmul(format!("ffn_up.{i}"), l.w_up, cur, l.b_up, None)?;
        let act = b.gelu(format!("ffn_act.{i}"), up)?;
        b.matmul(format!("l_out.{i}"), l.w_down, act, l.b_down, Some(ffn_in))
    }
}

/// Stores the new keys and values, then attends over the whole cached range.
fn attention(b: &mut GraphBuilder<'_>, i: usize, q: TensorId, k: TensorId, v: TensorId, alibi: bool) -> Result<TensorId> {
    b.kv_store(i, k, v)?;
    let mut kq = b.attn_scores(format!("kq_scaled.{i}"), q, i)?;
    if alibi {
        kq = b.alibi(format!("kq_alibi.{i}"), kq)?;
    }
    let kq = b.mask_causal(format!("kq_masked.{i}"), kq)?;
    let kq = b.softmax(format!("kq_soft_max.{i}"), kq)?;
    b.attn_output(format!("kqv.{i}"), kq, i)
}

fn required(id: Option<usize>, what: &str, layer: usize) -> Result<usize> {
    id.ok_or_else(|| anyhow::anyhow!("Layer {layer} has no '{what}' weight"))
}
