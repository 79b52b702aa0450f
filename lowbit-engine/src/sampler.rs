use crate::ops::softmax;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// 0 selects greedy decoding.
    pub temperature: f32,
    /// Number of candidates kept; 0 keeps the whole vocabulary.
    pub top_k: usize,
    /// Nucleus threshold; 1.0 disables it.
    pub top_p: f32,
    /// Divides positive (multiplies negative) logits of recent tokens; 1.0 disables it.
    pub repeat_penalty: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { temperature: 0.8, top_k: 40, top_p: 0.95, repeat_penalty: 1.1 }
    }
}

/// Repetition-penalty/top-k/top-p/temperature sampler for language model logits.
///
/// Uses a simple xorshift RNG so that a seed reproduces the same tokens.
#[derive(Debug)]
pub struct Sampler {
    config: SamplerConfig,
    candidates: Vec<ProbIndex>,
    rng_state: u64,
}

impl Sampler {
    /// Creates a sampler. A zero seed is replaced, xorshift would stay at zero forever.
    pub fn new(config: SamplerConfig, rng_seed: u64) -> anyhow::Result<Self> {
        if config.temperature < 0.0 || !config.temperature.is_finite() {
            anyhow::bail!("Temperature must be non-negative, got {}", config.temperature);
        }
        if !(0.0..=1.0).contains(&config.top_p) {
            anyhow::bail!("Top-p must be between 0.0 and 1.0, got {}", config.top_p);
        }
        if config.repeat_penalty <= 0.0 {
            anyhow::bail!("Repeat penalty must be positive, got {}", config.repeat_penalty);
        }

        Ok(Self { config, candidates: Vec::new(), rng_state: if rng_seed == 0 { 0x5DEE_CE66_D1CE_5EED } else { rng_seed } })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Returns the index of the maximum logit (greedy decoding).
    fn sample_argmax(logits: &[f32]) -> usize {
        logits.iter().enumerate().max_by(|(_, a), (_, b)| a.total_cmp(b)).map(|(i, _)| i).unwrap_or_default()
    }

    /// Penalizes every token of `recent` once, however often it occurs.
    fn apply_repeat_penalty(&self, logits: &mut [f32], recent: &[u32]) {
        let penalty = self.config.repeat_penalty;
        if penalty == 1.0 {
            return;
        }
        let mut seen = std::collections::HashSet::with_capacity(recent.len());
        for &token in recent {
            let Some(logit) = logits.get_mut(token as usize) else { continue };
            if seen.insert(token) {
                *logit = if *logit > 0.0 { *logit / penalty } else { *logit * penalty };
            }
        }
    }

    /// Keeps the `top_k` best candidates, sorted by descending logit.
    fn collect_top_k(&mut self, logits: &[f32]) {
        self.candidates.clear();
        self.candidates.extend(logits.iter().enumerate().map(|(index, &prob)| ProbIndex { prob, index }));
        let k = match self.config.top_k {
            0 => logits.len(),
            k => k.min(logits.len()),
        };
        if k < self.candidates.len() {
            self.candidates.select_nth_unstable_by(k - 1, |a, b| b.prob.total_cmp(&a.prob));
            self.candidates.truncate(k);
        }
        self.candidates.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob));
    }

    /// Number of candidates needed to exceed `top_p` of the mass.
    ///
    /// When the sorted candidates never reach the threshold all of them are kept.
    fn top_p_cutoff(&self) -> usize {
        let top_p = self.config.top_p;
        if top_p >= 1.0 {
            return self.candidates.len();
        }
        let mut cumulative = 0.0;
        for (i, candidate) in self.candidates.iter().enumerate() {
            cumulative += candidate.prob;
            if cumulative >= top_p {
                return i + 1;
            }
        }
        self.candidates.len()
    }

    /// Samples a token id. `recent` holds the last tokens for the repetition penalty.
    ///
    /// - If temperature is 0, returns the argmax of the penalized logits (greedy).
    /// - Otherwise, applies temperature scaling, top-k, softmax and top-p, then
    ///   draws from what remains.
    pub fn sample(&mut self, logits: &mut [f32], recent: &[u32]) -> u32 {
        self.apply_repeat_penalty(logits, recent);

        if self.config.temperature == 0.0 {
            return Self::sample_argmax(logits) as u32;
        }

        for logit in logits.iter_mut() {
            *logit /= self.config.temperature;
        }
        self.collect_top_k(logits);

        let mut probs: Vec<f32> = self.candidates.iter().map(|c| c.prob).collect();
        softmax(&mut probs);
        for (candidate, &p) in self.candidates.iter_mut().zip(&probs) {
            candidate.prob = p;
        }

        let kept = self.top_p_cutoff();
        let mass: f32 = self.candidates[..kept].iter().map(|c| c.prob).sum();
        let r = self.random_f32() * mass;
        let mut cdf = 0.0;
        for candidate in &self.candidates[..kept] {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index as u32;
            }
        }
        self.candidates.get(kept.saturating_sub(1)).map_or(0, |c| c.index as u32)
    }
}
