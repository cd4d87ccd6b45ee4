//! Autoregressive language-model decoder.
//!
//! Shared by the chunked and streaming families. GQA attention, SwiGLU
//! MLPs, tied-embedding LM head, optional adaptive time conditioning.

use burn::config::Config;
use burn::module::{Module, Param, ParamId};
use burn::nn::{Embedding, EmbeddingConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::layers::{
    DecoderLayer, DecoderLayerConfig, LayerCaches, RmsNorm, RmsNormConfig, Rope, RopeConfig,
    RopeStyle,
};

/// Decoder configuration.
#[derive(Config, Debug)]
pub struct LanguageDecoderConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub mlp_hidden_dim: usize,
    pub rope_style: RopeStyle,
    /// Conditioning dimension; 0 disables adaptive modulation.
    #[config(default = 0)]
    pub t_cond_dim: usize,
    pub sliding_window: Option<usize>,
    #[config(default = false)]
    pub use_biases: bool,
    #[config(default = 16384)]
    pub max_seq_len: usize,
    #[config(default = 1_000_000.0)]
    pub rope_theta: f64,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Language-model decoder.
///
/// Input: token IDs or pre-built hidden states; output: hidden states, with
/// logits computed through the tied embedding matrix on demand.
#[derive(Module, Debug)]
pub struct LanguageDecoder<B: Backend> {
    tok_embeddings: Embedding<B>,
    rope: Rope<B>,
    layers: Vec<DecoderLayer<B>>,
    norm: RmsNorm<B>,
    d_model: usize,
}

impl LanguageDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LanguageDecoder<B> {
        let tok_embeddings = EmbeddingConfig::new(self.vocab_size, self.d_model).init(device);

        let rope = RopeConfig::new(self.head_dim, self.max_seq_len, self.rope_style.clone())
            .with_theta(self.rope_theta)
            .init(device);

        let layers = (0..self.n_layers)
            .map(|_| {
                DecoderLayerConfig::new(
                    self.d_model,
                    self.n_heads,
                    self.n_kv_heads,
                    self.head_dim,
                    self.mlp_hidden_dim,
                )
                .with_t_cond_dim(self.t_cond_dim)
                .with_sliding_window(self.sliding_window)
                .with_use_biases(self.use_biases)
                .with_norm_eps(self.norm_eps)
                .init(device)
            })
            .collect();

        let norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);

        LanguageDecoder {
            tok_embeddings,
            rope,
            layers,
            norm,
            d_model: self.d_model,
        }
    }
}

impl<B: Backend> LanguageDecoder<B> {
    /// Build from loaded components.
    pub fn new(
        tok_embeddings_weight: Tensor<B, 2>,
        rope: Rope<B>,
        layers: Vec<DecoderLayer<B>>,
        norm: RmsNorm<B>,
    ) -> Self {
        let d_model = tok_embeddings_weight.dims()[1];
        let tok_embeddings = Embedding {
            weight: Param::initialized(ParamId::new(), tok_embeddings_weight),
        };
        Self {
            tok_embeddings,
            rope,
            layers,
            norm,
            d_model,
        }
    }

    /// Token embeddings (also used to fuse with audio embeddings).
    pub fn embed_tokens(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.tok_embeddings.forward(token_ids)
    }

    /// Cache-free forward over hidden states.
    pub fn forward_hidden(
        &self,
        hidden: Tensor<B, 3>,
        t_embed: Option<&Tensor<B, 3>>,
        offset: usize,
    ) -> Tensor<B, 3> {
        let mut x = hidden;
        for layer in &self.layers {
            x = layer.forward(x, t_embed, &self.rope, offset);
        }
        self.norm.forward(x)
    }

    /// Cached forward over hidden states (prefill or decode step).
    pub fn forward_hidden_with_cache(
        &self,
        hidden: Tensor<B, 3>,
        t_embed: Option<&Tensor<B, 3>>,
        caches: &mut LayerCaches<B>,
    ) -> Tensor<B, 3> {
        let mut x = hidden;
        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(cache) = caches.get_mut(i) {
                x = layer.forward_with_cache(x, t_embed, &self.rope, cache);
            }
        }
        self.norm.forward(x)
    }

    /// Logits through the tied embedding matrix.
    pub fn lm_head(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq, _] = hidden.dims();
        let embed = self.tok_embeddings.weight.val();
        let vocab_size = embed.dims()[0];
        let logits = hidden.matmul(embed.transpose().unsqueeze::<3>());
        logits.reshape([batch, seq, vocab_size])
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Unbounded caches (chunked family).
    pub fn create_cache(&self) -> LayerCaches<B> {
        LayerCaches::unbounded(self.layers.len())
    }

    /// Rotating caches capped at `capacity` tokens (streaming family).
    pub fn create_rotating_cache(&self, capacity: usize) -> LayerCaches<B> {
        LayerCaches::rotating(self.layers.len(), capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> LanguageDecoderConfig {
        LanguageDecoderConfig::new(100, 32, 2, 4, 2, 8, 64, RopeStyle::Interleaved)
            .with_sliding_window(Some(16))
            .with_max_seq_len(256)
    }

    #[test]
    fn test_decoder_logits_shape() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let ids = Tensor::<TestBackend, 2, Int>::zeros([1, 10], &device);
        let hidden = model.forward_hidden(model.embed_tokens(ids), None, 0);
        assert_eq!(hidden.dims(), [1, 10, 32]);

        let logits = model.lm_head(hidden);
        assert_eq!(logits.dims(), [1, 10, 100]);
    }

    #[test]
    fn test_cached_forward_matches_uncached() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let ids = Tensor::<TestBackend, 2, Int>::from_data([[3, 7, 12, 5]], &device);
        let embeds = model.embed_tokens(ids);

        let full = model.forward_hidden(embeds.clone(), None, 0);

        let mut caches = model.create_cache();
        let first = model.forward_hidden_with_cache(
            embeds.clone().slice([0..1, 0..3, 0..32]),
            None,
            &mut caches,
        );
        assert_eq!(first.dims(), [1, 3, 32]);
        let step = model.forward_hidden_with_cache(
            embeds.slice([0..1, 3..4, 0..32]),
            None,
            &mut caches,
        );

        let full_tail: Vec<f32> = full.slice([0..1, 3..4, 0..32]).to_data().to_vec().unwrap();
        let cached: Vec<f32> = step.to_data().to_vec().unwrap();
        for (a, b) in full_tail.iter().zip(cached.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rotating_cache_decode_stays_bounded() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let mut caches = model.create_rotating_cache(4);

        for step in 0..12 {
            let ids = Tensor::<TestBackend, 2, Int>::from_data([[step as i32 % 90]], &device);
            let hidden = model.forward_hidden_with_cache(model.embed_tokens(ids), None, &mut caches);
            assert_eq!(hidden.dims(), [1, 1, 32]);
        }
        assert_eq!(caches.offset(), 12);
    }
}
