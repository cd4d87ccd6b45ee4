//! Transformer encoder layer: pre-norm attention + SwiGLU.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::attention::{Attention, AttentionConfig, ScalePlacement};
use super::feed_forward::{SwiGlu, SwiGluConfig};
use super::kv_cache::KvCache;
use super::rms_norm::{RmsNorm, RmsNormConfig};
use super::rope::Rope;

/// Encoder layer configuration.
#[derive(Config, Debug)]
pub struct EncoderLayerConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub mlp_hidden_dim: usize,
    pub sliding_window: Option<usize>,
    #[config(default = true)]
    pub use_biases: bool,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Pre-norm encoder layer.
///
/// ```text
/// x -> RMSNorm -> Attention -> + -> x'
/// x' -> RMSNorm -> SwiGLU   -> + -> out
/// ```
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    attention_norm: RmsNorm<B>,
    attention: Attention<B>,
    ffn_norm: RmsNorm<B>,
    ffn: SwiGlu<B>,
}

impl EncoderLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncoderLayer<B> {
        let attention_norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);

        // K carries no bias in the reference encoder checkpoints.
        let attention = AttentionConfig::new(
            self.d_model,
            self.n_heads,
            self.head_dim,
            ScalePlacement::Scores,
        )
        .with_q_bias(self.use_biases)
        .with_k_bias(false)
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

        EncoderLayer {
            attention_norm,
            attention,
            ffn_norm,
            ffn,
        }
    }
}

impl<B: Backend> EncoderLayer<B> {
    /// Build from loaded components.
    pub fn new(
        attention_norm: RmsNorm<B>,
        attention: Attention<B>,
        ffn_norm: RmsNorm<B>,
        ffn: SwiGlu<B>,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            ffn,
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        rope: &Rope<B>,
        offset: usize,
        causal: bool,
    ) -> Tensor<B, 3> {
        let residual = x.clone();
        let x = self.attention_norm.forward(x);
        let x = self.attention.forward(x, rope, offset, causal);
        let x = x + residual;

        let residual = x.clone();
        let x = self.ffn_norm.forward(x);
        let x = self.ffn.forward(x);
        x + residual
    }

    pub fn forward_with_cache(
        &self,
        x: Tensor<B, 3>,
        rope: &Rope<B>,
        cache: &mut KvCache<B>,
        causal: bool,
    ) -> Tensor<B, 3> {
        let residual = x.clone();
        let x = self.attention_norm.forward(x);
        let x = self.attention.forward_with_cache(x, rope, cache, causal);
        let x = x + residual;

        let residual = x.clone();
        let x = self.ffn_norm.forward(x);
        let x = self.ffn.forward(x);
        x + residual
    }
}
