//! Sinusoidal time embedding.
//!
//! Encodes the streaming transcription delay as a conditioning vector for
//! the decoder's adaptive modulation.

use burn::prelude::*;

/// Sinusoidal embedding generator.
#[derive(Debug)]
pub struct TimeEmbedding {
    dim: usize,
    theta: f32,
}

impl TimeEmbedding {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            theta: 10_000.0,
        }
    }

    /// Embed a scalar time value as `[1, 1, dim]`: `[cos(t·f), sin(t·f)]`
    /// over logarithmically spaced frequencies.
    pub fn embed<B: Backend>(&self, t: f32, device: &B::Device) -> Tensor<B, 3> {
        let half_dim = self.dim / 2;
        let log_theta = self.theta.ln();

        let mut embedding = Vec::with_capacity(self.dim);
        let angles: Vec<f32> = (0..half_dim)
            .map(|i| t * (-log_theta * i as f32 / half_dim as f32).exp())
            .collect();
        embedding.extend(angles.iter().map(|a| a.cos()));
        embedding.extend(angles.iter().map(|a| a.sin()));

        Tensor::from_data(TensorData::new(embedding, [1, 1, self.dim]), device)
    }
}
