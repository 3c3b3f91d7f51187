//! Token sampling over raw logit vectors.
//!
//! Backend-independent: every [`LanguageModel`](jarvis_core::LanguageModel)
//! hands back plain `f32` logits and the sampler picks the next token.
//! Greedy mode is arg-max; stochastic mode applies temperature, top-k and
//! top-p (nucleus) filtering and draws from a seeded RNG so runs are
//! reproducible per seed.

use jarvis_config::SamplingConfig;
use jarvis_core::{GenerationError, TokenId};
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            config: config.clone(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn greedy() -> Self {
        Self::new(&SamplingConfig::greedy())
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, GenerationError> {
        if logits.is_empty() {
            return Err(GenerationError::Sampling("empty logits".into()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(GenerationError::Sampling("logits contain NaN".into()));
        }
        if self.config.is_greedy() {
            return Ok(argmax(logits));
        }
        self.sample_stochastic(logits)
    }

    fn sample_stochastic(&mut self, logits: &[f32]) -> Result<TokenId, GenerationError> {
        let temperature = self.config.temperature;

        // Highest logit first; equal logits keep index order.
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, l)| (i, *l / temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if self.config.top_k > 0 && self.config.top_k < candidates.len() {
            candidates.truncate(self.config.top_k);
        }

        let max = candidates[0].1;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|(_, l)| f64::from(*l - max).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(GenerationError::Sampling("degenerate probability mass".into()));
        }

        let mut probs: Vec<f64> = weights.iter().map(|w| w / total).collect();

        let top_p = f64::from(self.config.top_p);
        if top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep.max(1));
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| GenerationError::Sampling(format!("invalid distribution: {e}")))?;
        let picked = dist.sample(&mut self.rng);
        Ok(candidates[picked].0 as TokenId)
    }
}

/// Index of the largest logit; ties go to the lowest index.
pub fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0;
    for (i, l) in logits.iter().enumerate().skip(1) {
        if *l > logits[best] {
            best = i;
        }
    }
    best as TokenId
}
