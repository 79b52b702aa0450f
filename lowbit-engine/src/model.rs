//! Model file loading: header, vocabulary and weight tensors.

use anyhow::{Context, Result};
use half::f16;
use log::{debug, info};
use lowbit_quant::codec;
use lowbit_quant::record::read_float_payload;
use lowbit_quant::{BlockFormat, ElementType, ModelHeader, PackedWeight, RecordHeader, read_vocab};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::adapters::Adapter;
use crate::kernels::WeightRef;
use crate::tensor::{Layout, Ownership};
use crate::utils::{Bytes, MemoryMapper};

/// Index of a weight inside a [`Model`].
pub type WeightId = usize;

#[derive(Debug, Clone)]
pub enum WeightData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Blocks { format: BlockFormat, bytes: Bytes },
    Packed(PackedWeight),
}

/// A named, immutable weight tensor.
#[derive(Debug, Clone)]
pub struct Weight {
    pub name: String,
    pub layout: Layout,
    pub data: WeightData,
}

impl Weight {
    pub fn f32(name: &str, ne: &[usize], data: Vec<f32>) -> Self {
        Self { name: name.to_string(), layout: Layout::f32(ne), data: WeightData::F32(data) }
    }

    pub fn ne(&self) -> [usize; 4] {
        self.layout.ne
    }

    /// Row length, the reduction dimension of a matrix multiply.
    pub fn row_len(&self) -> usize {
        self.layout.ne[0]
    }

    pub fn n_rows(&self) -> usize {
        self.layout.n_rows()
    }

    pub fn ownership(&self) -> Ownership {
        match &self.data {
            WeightData::Blocks { bytes, .. } if bytes.is_mapped() => Ownership::Mapped,
            _ => Ownership::Owned,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match &self.data {
            WeightData::F32(data) => data.len() * 4,
            WeightData::F16(data) => data.len() * 2,
            WeightData::Blocks { bytes, .. } => bytes.as_slice().len(),
            WeightData::Packed(packed) => packed.serialized_size(),
        }
    }

    /// Float values of a weight stored as f32, such as norms and biases.
    pub fn values(&self) -> Result<&[f32]> {
        match &self.data {
            WeightData::F32(data) => Ok(data),
            _ => anyhow::bail!("Weight '{}' is not stored as f32", self.name),
        }
    }

    /// The weight as a matrix-multiply operand of `n_rows` outputs by `row_len` inputs.
    pub fn operand(&self) -> WeightRef<'_> {
        let (n, k) = (self.n_rows(), self.row_len());
        match &self.data {
            WeightData::F32(data) => WeightRef::F32 { data, n, k },
            WeightData::F16(data) => WeightRef::F16 { data, n, k },
            WeightData::Blocks { format, bytes } => WeightRef::Blocks { format: *format, data: bytes.as_slice(), n, k },
            WeightData::Packed(packed) => WeightRef::Packed(packed),
        }
    }

    /// Dequantizes row `i` into `out`.
    pub fn row(&self, i: usize, out: &mut [f32]) -> Result<()> {
        let k = self.row_len();
        if i >= self.n_rows() || out.len() != k {
            anyhow::bail!("Row {i} of '{}' is out of range ({} rows of {k})", self.name, self.n_rows());
        }

        match &self.data {
            WeightData::F32(data) => out.copy_from_slice(&data[i * k..(i + 1) * k]),
            WeightData::F16(data) => out.iter_mut().zip(&data[i * k..(i + 1) * k]).for_each(|(o, v)| *o = v.to_f32()),
            WeightData::Blocks { format, bytes } => {
                let row_bytes = self.layout.nb[1];
                codec::decode(&bytes.as_slice()[i * row_bytes..(i + 1) * row_bytes], *format, out)?;
            }
            WeightData::Packed(packed) => {
                let bs = packed.block_size();
                out.iter_mut().enumerate().for_each(|(kk, o)| *o = packed.code(i, kk) as f32 * packed.scale(i, kk / bs));
            }
        }
        Ok(())
    }
}

/// Weight ids of one decoder layer. Which optional entries are present depends
/// on the adapter.
#[derive(Debug, Clone, Default)]
pub struct LayerWeights {
    pub attn_norm: WeightId,
    pub attn_norm_b: Option<WeightId>,
    pub wq: Option<WeightId>,
    pub wk: Option<WeightId>,
    pub wv: Option<WeightId>,
    pub bq: Option<WeightId>,
    pub bk: Option<WeightId>,
    pub bv: Option<WeightId>,
    pub wqkv: Option<WeightId>,
    pub bqkv: Option<WeightId>,
    pub q_norm: Option<WeightId>,
    pub k_norm: Option<WeightId>,
    pub wo: WeightId,
    pub bo: Option<WeightId>,
    pub ffn_norm: WeightId,
    pub ffn_norm_b: Option<WeightId>,
    pub w_gate: Option<WeightId>,
    pub w_up: WeightId,
    pub b_up: Option<WeightId>,
    pub w_down: WeightId,
    pub b_down: Option<WeightId>,
}

/// Name lookup over loaded weights with shape checks.
#[derive(Debug, Default)]
pub struct WeightTable {
    weights: Vec<Weight>,
    by_name: HashMap<String, WeightId>,
}

impl WeightTable {
    pub fn new(weights: Vec<Weight>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(weights.len());
        for (id, weight) in weights.iter().enumerate() {
            if by_name.insert(weight.name.clone(), id).is_some() {
                anyhow::bail!("Duplicate tensor '{}'", weight.name);
            }
        }
        Ok(Self { weights, by_name })
    }

    pub fn get(&self, id: WeightId) -> &Weight {
        &self.weights[id]
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Weight> {
        self.weights.iter()
    }

    /// Looks up an optional tensor; when present it must have shape `dims`.
    pub fn optional(&self, name: &str, dims: &[usize]) -> Result<Option<WeightId>> {
        let Some(&id) = self.by_name.get(name) else {
            return Ok(None);
        };
        let mut expected = [1usize; 4];
        expected[..dims.len()].copy_from_slice(dims);
        if self.weights[id].ne() != expected {
            anyhow::bail!("Tensor '{name}' has wrong shape: got {:?}, expected {dims:?}", self.weights[id].ne());
        }
        Ok(Some(id))
    }

    pub fn require(&self, name: &str, dims: &[usize]) -> Result<WeightId> {
        self.optional(name, dims)?.ok_or_else(|| anyhow::anyhow!("Tensor '{name}' not found in model file"))
    }
}

/// A loaded model: hyperparameters, vocabulary, weights and the layer adapter.
#[derive(Debug)]
pub struct Model {
    pub header: ModelHeader,
    pub adapter: Adapter,
    pub vocab: Vec<Vec<u8>>,
    weights: WeightTable,
    pub tok_embd: WeightId,
    pub pos_embd: Option<WeightId>,
    pub output_norm: WeightId,
    pub output_norm_b: Option<WeightId>,
    pub output: WeightId,
    pub layers: Vec<LayerWeights>,
}

impl Model {
    /// Loads a model file. With `use_mmap`, block-format payloads alias the mapped file.
    pub fn load(path: &Path, use_mmap: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open model file {}", path.display()))?;
        let mut mapper = MemoryMapper::new(&file)?;

        let header = ModelHeader::read_from(&mut mapper).context("Failed to read model header")?;
        header.validate()?;
        let vocab = read_vocab(&mut mapper, header.n_vocab as usize).context("Failed to read vocabulary")?;

        let mut weights = Vec::new();
        while let Some(record) = RecordHeader::read_from(&mut mapper)? {
            let weight = read_weight(&mut mapper, record, use_mmap)?;
            debug!("{:>32} - {:?}, {}", weight.name, weight.ne(), weight.layout.ty);
            weights.push(weight);
        }

        let model = Self::from_parts(header, vocab, weights)?;
        model.log_memory_requirements();
        Ok(model)
    }

    /// Assembles a model from already decoded parts, binding every layer through the adapter.
    pub fn from_parts(header: ModelHeader, vocab: Vec<Vec<u8>>, weights: Vec<Weight>) -> Result<Self> {
        header.validate()?;
        if vocab.len() != header.n_vocab as usize {
            anyhow::bail!("Vocabulary has {} entries, header says {}", vocab.len(), header.n_vocab);
        }

        let adapter = Adapter::from_arch(header.arch)?;
        let weights = WeightTable::new(weights)?;
        let (n_embd, n_vocab) = (header.n_embd as usize, header.n_vocab as usize);

        let tok_embd = weights.require("token_embd.weight", &[n_embd, n_vocab])?;
        let pos_embd = weights.optional("pos_embd.weight", &[n_embd, header.n_ctx as usize])?;
        let output_norm = weights.require("output_norm.weight", &[n_embd])?;
        let output_norm_b = weights.optional("output_norm.bias", &[n_embd])?;
        let output = weights.optional("output.weight", &[n_embd, n_vocab])?.unwrap_or(tok_embd);

        let layers = (0..header.n_layer as usize)
            .map(|i| adapter.bind_layer(&weights, &header, i).with_context(|| format!("Invalid layer {i}")))
            .collect::<Result<Vec<_>>>()?;
        adapter.check_globals(pos_embd.is_some())?;

        Ok(Self { header, adapter, vocab, weights, tok_embd, pos_embd, output_norm, output_norm_b, output, layers })
    }

    pub fn weight(&self, id: WeightId) -> &Weight {
        self.weights.get(id)
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn n_vocab(&self) -> usize {
        self.header.n_vocab as usize
    }

    pub fn n_embd(&self) -> usize {
        self.header.n_embd as usize
    }

    pub fn n_layer(&self) -> usize {
        self.header.n_layer as usize
    }

    pub fn head_dim(&self) -> usize {
        self.header.head_dim() as usize
    }

    /// Width of one cached key or value row.
    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.header.n_head_kv as usize
    }

    pub fn weights_size_bytes(&self) -> usize {
        self.weights.iter().map(Weight::size_bytes).sum()
    }

    fn log_memory_requirements(&self) {
        let mapped: usize = self.weights.iter().filter(|w| w.ownership() == Ownership::Mapped).map(Weight::size_bytes).sum();
        info!(
            "Model: {} layers, n_embd = {}, n_vocab = {}, {:?} adapter",
            self.n_layer(),
            self.n_embd(),
            self.n_vocab(),
            self.adapter
        );
        info!(
            "Weights: {:.2} MB ({:.2} MB mapped), {} tensors",
            self.weights_size_bytes() as f64 / (1024.0 * 1024.0),
            mapped as f64 / (1024.0 * 1024.0),
            self.weights.len()
        );
    }
}

fn read_weight(mapper: &mut MemoryMapper, record: RecordHeader, use_mmap: bool) -> Result<Weight> {
    let ty = record.element_type;
    let name = record.name.clone();
    let layout = Layout::contiguous(ty, &record.ne);
    let k = record.ne[0];

    let data = match ty {
        ElementType::F32 | ElementType::F16 => {
            let values = read_float_payload(mapper, &record)?;
            if ty == ElementType::F16 && record.ne.len() >= 2 {
                WeightData::F16(values.into_iter().map(f16::from_f32).collect())
            } else {
                WeightData::F32(values)
            }
        }
        ElementType::Packed => {
            let (packed, consumed) = PackedWeight::from_bytes(mapper.remaining())
                .with_context(|| format!("Invalid packed weight '{name}'"))?;
            mapper.take(consumed)?;
            if record.ne.len() != 2 || packed.k() != k || packed.n() != record.ne[1] {
                anyhow::bail!(
                    "Packed weight '{name}' is {}×{} but the record says {:?}",
                    packed.n(),
                    packed.k(),
                    record.ne
                );
            }
            WeightData::Packed(packed)
        }
        ty => {
            let format = ty
                .block_format()
                .ok_or_else(|| anyhow::anyhow!("Tensor '{name}' has element type {ty}, which cannot be used for inference"))?;
            if k % lowbit_quant::QK != 0 {
                anyhow::bail!("Tensor '{name}' row length {k} is not a multiple of {}", lowbit_quant::QK);
            }
            let size = record.payload_size(&[])?;
            let range = mapper.take(size).with_context(|| format!("Truncated data of tensor '{name}'"))?;
            let bytes = if use_mmap {
                Bytes::Mapped { mmap: mapper.mmap().clone(), range }
            } else {
                Bytes::Owned(mapper.mmap()[range].to_vec())
            };
            WeightData::Blocks { format, bytes }
        }
    };

    Ok(Weight { name, layout, data })
}
