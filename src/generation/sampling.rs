//! Token sampling.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Temperature for scaling logits. `<= 0` selects exact argmax.
    pub temperature: f32,
    /// Random seed (None = entropy).
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        // Transcription defaults to deterministic greedy decoding.
        Self {
            temperature: 0.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            seed: None,
        }
    }
}

/// Token sampler.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Sample a token ID from raw logits.
    ///
    /// Temperature `<= 0` is exact argmax, never approximated through the
    /// categorical path. Positive temperature divides logits before a
    /// categorical draw.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if self.config.temperature <= 0.0 {
            return argmax(logits) as u32;
        }

        let inv_t = 1.0 / self.config.temperature;
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = logits.iter().map(|&l| ((l - max) * inv_t).exp()).collect();

        match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng) as u32,
            // Degenerate weights (all zero) fall back to argmax.
            Err(_) => argmax(logits) as u32,
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
