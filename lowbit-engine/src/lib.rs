//! # lowbit-engine
//!
//! CPU runtime for quantized transformer models: a model loader, a compute graph
//! planned into a region arena, a KV cache for incremental decoding, and matrix
//! multiplies dispatched to ISA-specific microkernels through a tile scheduler.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use lowbit_engine::{Context, ContextParams, Model};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let model = Arc::new(Model::load(Path::new("model-q4_0.bin"), true)?);
//! let mut ctx = Context::new(model, ContextParams::default().with_threads(4))?;
//!
//! ctx.evaluate(&[1, 15, 27, 4], 0, 4)?;
//! ctx.evaluate(&[9], 4, 4)?;
//! let next = ctx.logits().iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).map(|(i, _)| i);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod arena;
pub mod context;
pub mod generation;
pub mod graph;
pub mod kernels;
pub mod kv_cache;
pub mod model;
pub mod ops;
pub mod sampler;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;
mod utils;

pub use adapters::Adapter;
pub use arena::{Arena, Region};
pub use context::{Context, ContextParams, EvalError, EvalStats};
pub use generation::{GenerationSettings, generate};
pub use kernels::{CpuFeatures, KernelRegistry};
pub use kv_cache::{KvCache, KvType};
pub use model::{Model, Weight, WeightData};
pub use sampler::{Sampler, SamplerConfig};
pub use scheduler::Scheduler;
pub use tokenizer::Tokenizer;
pub use utils::Bytes;

use anyhow::{Context as _, Result};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: PathBuf,
    /// JSON `{token: id}` vocabulary used instead of the one in the model file.
    pub vocab_path: Option<PathBuf>,
    pub prompt: String,
    pub n_predict: usize,
    pub n_batch: usize,
    pub n_threads: usize,
    pub ctx_length: Option<usize>,
    pub use_mmap: bool,
    pub kv_type: KvType,
    pub sampler: SamplerConfig,
    pub repeat_last_n: usize,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<PathBuf>,
    vocab_path: Option<PathBuf>,
    prompt: Option<String>,
    n_predict: Option<usize>,
    n_batch: Option<usize>,
    n_threads: Option<usize>,
    ctx_length: Option<usize>,
    use_mmap: Option<bool>,
    kv_f16: Option<bool>,
    temperature: Option<f32>,
    top_k: Option<usize>,
    top_p: Option<f32>,
    repeat_penalty: Option<f32>,
    repeat_last_n: Option<usize>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.map(PathBuf::from);
        self
    }
    pub fn vocab_path(mut self, path: Option<&String>) -> Self {
        self.vocab_path = path.map(PathBuf::from);
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn n_predict(mut self, n_predict: Option<usize>) -> Self {
        self.n_predict = n_predict;
        self
    }
    pub fn n_batch(mut self, n_batch: Option<usize>) -> Self {
        self.n_batch = n_batch;
        self
    }
    pub fn n_threads(mut self, n_threads: Option<usize>) -> Self {
        self.n_threads = n_threads;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn use_mmap(mut self, use_mmap: Option<bool>) -> Self {
        self.use_mmap = use_mmap;
        self
    }
    pub fn kv_f16(mut self, kv_f16: Option<bool>) -> Self {
        self.kv_f16 = kv_f16;
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
    pub fn repeat_penalty(mut self, repeat_penalty: Option<f32>) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }
    pub fn repeat_last_n(mut self, repeat_last_n: Option<usize>) -> Self {
        self.repeat_last_n = repeat_last_n;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let defaults = SamplerConfig::default();
        let settings = GenerationSettings::default();
        let n_batch = self.n_batch.unwrap_or(settings.n_batch);
        if n_batch == 0 {
            return Err("n_batch must be positive".to_string());
        }

        Ok(InferenceConfig {
            model_path: self.model_path.ok_or("model_path is required")?,
            vocab_path: self.vocab_path,
            prompt: self.prompt.ok_or("prompt is required")?,
            n_predict: self.n_predict.unwrap_or(settings.n_predict),
            n_batch,
            n_threads: self.n_threads.unwrap_or_else(|| ContextParams::default().n_threads),
            ctx_length: self.ctx_length,
            use_mmap: self.use_mmap.unwrap_or(true),
            kv_type: if self.kv_f16.unwrap_or(false) { KvType::F16 } else { KvType::F32 },
            sampler: SamplerConfig {
                temperature: self.temperature.unwrap_or(defaults.temperature),
                top_k: self.top_k.unwrap_or(defaults.top_k),
                top_p: self.top_p.unwrap_or(defaults.top_p),
                repeat_penalty: self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            },
            repeat_last_n: self.repeat_last_n.unwrap_or(settings.repeat_last_n),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Runs inference.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let model = Arc::new(Model::load(&inference_config.model_path, inference_config.use_mmap)?);

    let tokenizer = match &inference_config.vocab_path {
        Some(path) => Tokenizer::from_json_file(path)?,
        None => Tokenizer::from_vocab(model.vocab.clone()),
    };
    debug!("{tokenizer:#?}");

    let params = ContextParams::default()
        .with_n_ctx(inference_config.ctx_length)
        .with_threads(inference_config.n_threads)
        .with_kv_type(inference_config.kv_type);
    let mut context = Context::new(Arc::clone(&model), params).context("Failed to create context")?;

    let mut sampler = Sampler::new(inference_config.sampler.clone(), inference_config.seed)?;
    info!("Sampling: {:?}, seed = {}", inference_config.sampler, inference_config.seed);

    let settings = GenerationSettings {
        n_predict: inference_config.n_predict,
        n_batch: inference_config.n_batch,
        n_threads: inference_config.n_threads,
        repeat_last_n: inference_config.repeat_last_n,
    };

    let mut stdout = std::io::stdout().lock();
    generate(&mut context, &tokenizer, &mut sampler, &inference_config.prompt, &settings, &mut stdout)?;
    println!();

    context.print_timings();
    Ok(())
}
