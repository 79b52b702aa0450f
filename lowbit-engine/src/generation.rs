use anyhow::{Context as _, Result};
use log::info;
use std::io::Write;
use std::time::Instant;

use crate::context::Context;
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;

/// Knobs of the generation loop.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Maximum number of new tokens.
    pub n_predict: usize,
    /// Prompt tokens per decode call.
    pub n_batch: usize,
    pub n_threads: usize,
    /// Window of recent tokens seen by the repetition penalty.
    pub repeat_last_n: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self { n_predict: 128, n_batch: 8, n_threads: 1, repeat_last_n: 64 }
    }
}

/// Feeds the prompt, then samples until `n_predict` tokens, the end of the
/// context or the end-of-sequence token. Prompt and new tokens are written to `out`
/// as they become known; the new token ids are returned.
pub fn generate<W: Write>(
    context: &mut Context,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    settings: &GenerationSettings,
    out: &mut W,
) -> Result<Vec<u32>> {
    let prompt_tokens = tokenizer.tokenize(prompt);
    if prompt_tokens.is_empty() {
        anyhow::bail!("Please provide a prompt");
    }
    let n_ctx = context.n_ctx();
    if prompt_tokens.len() >= n_ctx {
        anyhow::bail!("Prompt is too long: {} tokens for a context of {n_ctx}", prompt_tokens.len());
    }
    let n_vocab = context.model().n_vocab();
    if tokenizer.n_vocab() > n_vocab {
        anyhow::bail!("Tokenizer has {} tokens but the model only {n_vocab}", tokenizer.n_vocab());
    }

    out.write_all(&tokenizer.decode(&prompt_tokens).into_bytes())?;
    out.flush()?;

    let mut n_past = 0;
    for batch in prompt_tokens.chunks(settings.n_batch.max(1)) {
        context.evaluate(batch, n_past, settings.n_threads).with_context(|| format!("Failed to evaluate prompt at {n_past}"))?;
        n_past += batch.len();
    }

    let mut recent: Vec<u32> = prompt_tokens.clone();
    let mut metrics = TokenMetrics::new();
    let mut generated = Vec::new();

    while generated.len() < settings.n_predict {
        metrics.start_generation();
        let logits = context.logits();
        let mut last = logits[logits.len() - n_vocab..].to_vec();
        let window = &recent[recent.len().saturating_sub(settings.repeat_last_n)..];
        let token = sampler.sample(&mut last, window);

        if Some(token) == tokenizer.eos_token_id() {
            break;
        }
        out.write_all(tokenizer.token_bytes(token))?;
        out.flush()?;
        generated.push(token);
        recent.push(token);
        metrics.increment_token();

        if generated.len() == settings.n_predict || n_past >= n_ctx {
            break;
        }
        context.evaluate(&[token], n_past, settings.n_threads).with_context(|| format!("Failed to evaluate token at {n_past}"))?;
        n_past += 1;
    }

    metrics.report();
    Ok(generated)
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report(&self) {
        if let Some(start_time) = self.start_time {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!("Generated {} tokens in {:.2}s - {:.2} tokens/sec", self.generated_count, duration.as_secs_f64(), tps);
            }
        }
    }
}
