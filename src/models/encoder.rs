//! Transformer audio encoder.
//!
//! Shared by the chunked (non-causal, full attention) and streaming
//! (causal, sliding-window) families: conv subsampling front-end, RoPE
//! transformer layers, final norm.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::layers::encoder_layer::{EncoderLayer, EncoderLayerConfig};
use super::layers::{
    ConvDownsampler, ConvDownsamplerConfig, LayerCaches, RmsNorm, RmsNormConfig, Rope, RopeConfig,
    RopeStyle,
};

/// Audio encoder configuration.
#[derive(Config, Debug)]
pub struct AudioEncoderConfig {
    pub n_mels: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub mlp_hidden_dim: usize,
    pub sliding_window: Option<usize>,
    pub rope_style: RopeStyle,
    #[config(default = true)]
    pub causal: bool,
    #[config(default = true)]
    pub use_biases: bool,
    #[config(default = 4096)]
    pub max_seq_len: usize,
    #[config(default = 1_000_000.0)]
    pub rope_theta: f64,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Audio encoder: conv downsample -> transformer layers -> final norm.
///
/// Input: mel spectrogram `[batch, n_mels, time]`.
/// Output: hidden states `[batch, time/4, d_model]`.
#[derive(Module, Debug)]
pub struct AudioEncoder<B: Backend> {
    conv: ConvDownsampler<B>,
    rope: Rope<B>,
    layers: Vec<EncoderLayer<B>>,
    norm: RmsNorm<B>,
    causal: bool,
}

impl AudioEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AudioEncoder<B> {
        let conv = ConvDownsamplerConfig::new(self.n_mels, self.d_model, self.d_model).init(device);

        let rope = RopeConfig::new(self.head_dim, self.max_seq_len, self.rope_style.clone())
            .with_theta(self.rope_theta)
            .init(device);

        let layers = (0..self.n_layers)
            .map(|_| {
                EncoderLayerConfig::new(
                    self.d_model,
                    self.n_heads,
                    self.head_dim,
                    self.mlp_hidden_dim,
                )
                .with_sliding_window(self.sliding_window)
                .with_use_biases(self.use_biases)
                .with_norm_eps(self.norm_eps)
                .init(device)
            })
            .collect();

        let norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);

        AudioEncoder {
            conv,
            rope,
            layers,
            norm,
            causal: self.causal,
        }
    }
}

impl<B: Backend> AudioEncoder<B> {
    /// Build from loaded components.
    pub fn new(
        conv: ConvDownsampler<B>,
        rope: Rope<B>,
        layers: Vec<EncoderLayer<B>>,
        norm: RmsNorm<B>,
        causal: bool,
    ) -> Self {
        Self {
            conv,
            rope,
            layers,
            norm,
            causal,
        }
    }

    /// Forward pass without caches.
    pub fn forward(&self, mel: Tensor<B, 3>, offset: usize) -> Tensor<B, 3> {
        let x = self.conv.forward(mel);
        let mut x = x.swap_dims(1, 2);
        for layer in &self.layers {
            x = layer.forward(x, &self.rope, offset, self.causal);
        }
        self.norm.forward(x)
    }

    /// Forward pass through per-layer caches (streaming continuation).
    pub fn forward_with_cache(
        &self,
        mel: Tensor<B, 3>,
        caches: &mut LayerCaches<B>,
    ) -> Tensor<B, 3> {
        let x = self.conv.forward(mel);
        let mut x = x.swap_dims(1, 2);
        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(cache) = caches.get_mut(i) {
                x = layer.forward_with_cache(x, &self.rope, cache, self.causal);
            }
        }
        self.norm.forward(x)
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Unbounded caches, one per layer.
    pub fn create_cache(&self) -> LayerCaches<B> {
        LayerCaches::unbounded(self.layers.len())
    }
}
