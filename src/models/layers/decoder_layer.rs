//! Transformer decoder layer: GQA attention + SwiGLU, optionally
//! modulated by a time-conditioning embedding.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::attention::{Attention, AttentionConfig, ScalePlacement};
use super::feed_forward::{SwiGlu, SwiGluConfig};
use super::kv_cache::KvCache;
use super::rms_norm::{AdaRmsNorm, AdaRmsNormConfig, RmsNorm, RmsNormConfig};
use super::rope::Rope;

/// Decoder layer configuration.
#[derive(Config, Debug)]
pub struct DecoderLayerConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub mlp_hidden_dim: usize,
    /// Conditioning dimension; 0 disables adaptive modulation.
    #[config(default = 0)]
    pub t_cond_dim: usize,
    pub sliding_window: Option<usize>,
    #[config(default = false)]
    pub use_biases: bool,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Pre-norm decoder layer.
///
/// The adaptive modulation, when present, runs after `ffn_norm` and before
/// the MLP: `ffn(ada(norm(x), t_embed))`.
#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    ada_norm: Option<AdaRmsNorm<B>>,
    attention_norm: RmsNorm<B>,
    attention: Attention<B>,
    ffn_norm: RmsNorm<B>,
    ffn: SwiGlu<B>,
}

impl DecoderLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderLayer<B> {
        let ada_norm = (self.t_cond_dim > 0)
            .then(|| AdaRmsNormConfig::new(self.d_model, self.t_cond_dim).init(device));

        let attention_norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);

        let attention = AttentionConfig::new(
            self.d_model,
            self.n_heads,
            self.head_dim,
            ScalePlacement::Scores,
        )
        .with_n_kv_heads(Some(self.n_kv_heads))
        .with_q_bias(self.use_biases)
        .with_k_bias(self.use_biases)
        .with_v_bias(self.use_biases)
        .with_o_bias(self.use_biases)
        .with_sliding_window(self.sliding_window)
        .init(device);

        let ffn_norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);

        let ffn = SwiGluConfig::new(self.d_model, self.mlp_hidden_dim)
            .with_bias(self.use_biases)
            .init(device);

        DecoderLayer {
            ada_norm,
            attention_norm,
            attention,
            ffn_norm,
            ffn,
        }
    }
}

impl<B: Backend> DecoderLayer<B> {
    /// Build from loaded components.
    pub fn new(
        ada_norm: Option<AdaRmsNorm<B>>,
        attention_norm: RmsNorm<B>,
        attention: Attention<B>,
        ffn_norm: RmsNorm<B>,
        ffn: SwiGlu<B>,
    ) -> Self {
        Self {
            ada_norm,
            attention_norm,
            attention,
            ffn_norm,
            ffn,
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        t_embed: Option<&Tensor<B, 3>>,
        rope: &Rope<B>,
        offset: usize,
    ) -> Tensor<B, 3> {
        let residual = x.clone();
        let x = self.attention_norm.forward(x);
        let x = self.attention.forward(x, rope, offset, true);
        let x = x + residual;

        let residual = x.clone();
        let x = self.ffn_norm.forward(x);
        let x = self.modulate(x, t_embed);
        let x = self.ffn.forward(x);
        x + residual
    }

    pub fn forward_with_cache(
        &self,
        x: Tensor<B, 3>,
        t_embed: Option<&Tensor<B, 3>>,
        rope: &Rope<B>,
        cache: &mut KvCache<B>,
    ) -> Tensor<B, 3> {
        let residual = x.clone();
        let x = self.attention_norm.forward(x);
        let x = self.attention.forward_with_cache(x, rope, cache, true);
        let x = x + residual;

        let residual = x.clone();
        let x = self.ffn_norm.forward(x);
        let x = self.modulate(x, t_embed);
        let x = self.ffn.forward(x);
        x + residual
    }

    fn modulate(&self, x: Tensor<B, 3>, t_embed: Option<&Tensor<B, 3>>) -> Tensor<B, 3> {
        match (&self.ada_norm, t_embed) {
            (Some(ada), Some(t)) => ada.forward(x, t.clone()),
            _ => x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layers::rope::{RopeConfig, RopeStyle};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_decoder_layer_shape_with_conditioning() {
        let device = Default::default();
        let layer = DecoderLayerConfig::new(64, 4, 2, 16, 256)
            .with_t_cond_dim(8)
            .with_sliding_window(Some(32))
            .init::<TestBackend>(&device);
        let rope = RopeConfig::new(16, 256, RopeStyle::Interleaved).init(&device);

        let x = Tensor::<TestBackend, 3>::zeros([2, 10, 64], &device);
        let t = Tensor::<TestBackend, 3>::zeros([2, 1, 64], &device);
        let out = layer.forward(x, Some(&t), &rope, 0);
        assert_eq!(out.dims(), [2, 10, 64]);
    }

    #[test]
    fn test_decoder_layer_without_conditioning() {
        let device = Default::default();
        let layer = DecoderLayerConfig::new(32, 2, 1, 16, 64).init::<TestBackend>(&device);
        let rope = RopeConfig::new(16, 256, RopeStyle::Half).init(&device);

        let x = Tensor::<TestBackend, 3>::zeros([1, 5, 32], &device);
        let out = layer.forward(x, None, &rope, 0);
        assert_eq!(out.dims(), [1, 5, 32]);
    }
}
