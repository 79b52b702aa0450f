use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::format::ElementType;

/// Magic number of a model file, "lbf1" in ASCII.
pub const MODEL_MAGIC: u32 = 0x6c62_6631;
/// Supported model file version.
pub const MODEL_VERSION: u32 = 1;
/// Serialized header size: magic, version, 10 u32 fields, ftype and 4 f32 fields.
pub const MODEL_HEADER_SIZE: usize = 4 * 17;

/// Longest vocabulary entry accepted when reading.
const MAX_TOKEN_LENGTH: usize = 1 << 16;

/// Hyperparameters stored at the start of a model file.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHeader {
    /// Decoder-layer family, see the engine's adapters.
    pub arch: u32,
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_head: u32,
    pub n_head_kv: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub n_ctx: u32,
    pub n_ff: u32,
    /// Element type code of the bulk of the weights.
    pub ftype: i32,
    pub alibi_bias_max: f32,
    /// Clamp applied to fused QKV activations; zero disables it.
    pub clip_qkv: f32,
    pub norm_eps: f32,
    pub rope_theta: f32,
}

impl ModelHeader {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        macro_rules! read_u32 {
            ($field:literal) => {
                reader.read_u32::<LittleEndian>().with_context(|| format!("Failed to read {}", $field))?
            };
        }
        macro_rules! read_f32 {
            ($field:literal) => {
                reader.read_f32::<LittleEndian>().with_context(|| format!("Failed to read {}", $field))?
            };
        }

        match read_u32!("magic number") {
            MODEL_MAGIC => {}
            actual => anyhow::bail!("Invalid model magic number: expected {MODEL_MAGIC:#x}, got {actual:#x}"),
        }
        match read_u32!("version") {
            MODEL_VERSION => {}
            actual => anyhow::bail!("Unsupported model version: expected {MODEL_VERSION}, got {actual}"),
        }

        let header = Self {
            arch: read_u32!("architecture"),
            n_vocab: read_u32!("vocabulary size"),
            n_embd: read_u32!("embedding size"),
            n_head: read_u32!("number of heads"),
            n_head_kv: read_u32!("number of KV heads"),
            n_layer: read_u32!("number of layers"),
            n_rot: read_u32!("rotary dimensions"),
            n_ctx: read_u32!("context length"),
            n_ff: read_u32!("feed-forward size"),
            ftype: reader.read_i32::<LittleEndian>().context("Failed to read ftype")?,
            alibi_bias_max: read_f32!("alibi bias max"),
            clip_qkv: read_f32!("qkv clip"),
            norm_eps: read_f32!("norm epsilon"),
            rope_theta: read_f32!("rope theta"),
        };

        header.validate()?;
        Ok(header)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(MODEL_MAGIC)?;
        writer.write_u32::<LittleEndian>(MODEL_VERSION)?;
        for value in [
            self.arch,
            self.n_vocab,
            self.n_embd,
            self.n_head,
            self.n_head_kv,
            self.n_layer,
            self.n_rot,
            self.n_ctx,
            self.n_ff,
        ] {
            writer.write_u32::<LittleEndian>(value)?;
        }
        writer.write_i32::<LittleEndian>(self.ftype)?;
        for value in [self.alibi_bias_max, self.clip_qkv, self.norm_eps, self.rope_theta] {
            writer.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("n_vocab", self.n_vocab),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_head_kv", self.n_head_kv),
            ("n_layer", self.n_layer),
            ("n_ctx", self.n_ctx),
            ("n_ff", self.n_ff),
        ];
        if let Some((name, _)) = dimensions.iter().find(|(_, v)| *v == 0) {
            anyhow::bail!("Invalid model header: {name} must be positive");
        }
        if self.n_embd % self.n_head != 0 {
            anyhow::bail!("Invalid model header: n_embd {} is not divisible by n_head {}", self.n_embd, self.n_head);
        }
        if self.n_head % self.n_head_kv != 0 {
            anyhow::bail!("Invalid model header: n_head {} is not divisible by n_head_kv {}", self.n_head, self.n_head_kv);
        }
        if self.n_rot > self.head_dim() || self.n_rot % 2 != 0 {
            anyhow::bail!("Invalid model header: n_rot {} does not fit head size {}", self.n_rot, self.head_dim());
        }
        ElementType::try_from(self.ftype).context("Invalid model header ftype")?;
        Ok(())
    }

    pub fn head_dim(&self) -> u32 {
        self.n_embd / self.n_head
    }

    pub fn ftype(&self) -> Result<ElementType> {
        ElementType::try_from(self.ftype)
    }
}

/// Reads `n_vocab` length-prefixed token strings.
pub fn read_vocab<R: Read>(reader: &mut R, n_vocab: usize) -> Result<Vec<Vec<u8>>> {
    (0..n_vocab)
        .map(|id| {
            let len = reader.read_u32::<LittleEndian>().with_context(|| format!("Failed to read length of token {id}"))?
                as usize;
            if len > MAX_TOKEN_LENGTH {
                anyhow::bail!("Token {id} is too long: {len} bytes");
            }
            let mut token = vec![0u8; len];
            reader.read_exact(&mut token).with_context(|| format!("Failed to read token {id}"))?;
            Ok(token)
        })
        .collect()
}

pub fn write_vocab<W: Write>(writer: &mut W, vocab: &[Vec<u8>]) -> Result<()> {
    for token in vocab {
        writer.write_u32::<LittleEndian>(token.len() as u32)?;
        writer.write_all(token)?;
    }
    Ok(())
}
