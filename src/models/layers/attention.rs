//! Multi-head and grouped-query attention with RoPE.
//!
//! One module covers the encoder (MHA, optional biases) and decoder (GQA)
//! configurations. Where the query scale is applied, to the queries
//! before the dot product or to the score matrix after, differs between
//! the supported checkpoints and must be preserved exactly; it is a config
//! flag, not a free choice.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::kv_cache::KvCache;
use super::masking;
use super::rope::Rope;

/// Where the `1/sqrt(head_dim)` factor is applied.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ScalePlacement {
    /// Scale queries before the dot product.
    Query,
    /// Scale the score matrix after the dot product.
    Scores,
}

/// Attention configuration.
#[derive(Config, Debug)]
pub struct AttentionConfig {
    pub d_model: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of KV heads. `None` means MHA.
    pub n_kv_heads: Option<usize>,
    pub head_dim: usize,
    #[config(default = false)]
    pub q_bias: bool,
    #[config(default = false)]
    pub k_bias: bool,
    #[config(default = false)]
    pub v_bias: bool,
    #[config(default = false)]
    pub o_bias: bool,
    /// Sliding-window size (`None` = full attention).
    pub sliding_window: Option<usize>,
    /// Query-scale placement.
    pub scale_placement: ScalePlacement,
}

/// Attention layer.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    wq: Linear<B>,
    wk: Linear<B>,
    wv: Linear<B>,
    wo: Linear<B>,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    scale: f32,
    sliding_window: Option<usize>,
    scale_placement: Ignored<ScalePlacement>,
}

impl AttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Attention<B> {
        let n_kv_heads = self.n_kv_heads.unwrap_or(self.n_heads);

        let wq = LinearConfig::new(self.d_model, self.n_heads * self.head_dim)
            .with_bias(self.q_bias)
            .init(device);
        let wk = LinearConfig::new(self.d_model, n_kv_heads * self.head_dim)
            .with_bias(self.k_bias)
            .init(device);
        let wv = LinearConfig::new(self.d_model, n_kv_heads * self.head_dim)
            .with_bias(self.v_bias)
            .init(device);
        let wo = LinearConfig::new(self.n_heads * self.head_dim, self.d_model)
            .with_bias(self.o_bias)
            .init(device);

        Attention {
            wq,
            wk,
            wv,
            wo,
            n_heads: self.n_heads,
            n_kv_heads,
            head_dim: self.head_dim,
            scale: (self.head_dim as f32).powf(-0.5),
            sliding_window: self.sliding_window,
            scale_placement: Ignored(self.scale_placement.clone()),
        }
    }
}

impl<B: Backend> Attention<B> {
    /// Build from loaded projections.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wq: Linear<B>,
        wk: Linear<B>,
        wv: Linear<B>,
        wo: Linear<B>,
        n_heads: usize,
        n_kv_heads: usize,
        head_dim: usize,
        sliding_window: Option<usize>,
        scale_placement: ScalePlacement,
    ) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            n_kv_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
            sliding_window,
            scale_placement: Ignored(scale_placement),
        }
    }

    /// Cache-free forward pass.
    ///
    /// `x` is `[batch, seq, d_model]`; `offset` shifts the rotary phase.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        rope: &Rope<B>,
        offset: usize,
        causal: bool,
    ) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();

        let q = self.wq.forward(x.clone());
        let k = self.wk.forward(x.clone());
        let v = self.wv.forward(x);

        let q = q.reshape([batch, seq_len, self.n_heads, self.head_dim]);
        let k = k.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);
        let v = v.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);

        let (q, k) = rope.apply(q, k, offset);

        let q = q.swap_dims(1, 2);
        let k = k.swap_dims(1, 2);
        let v = v.swap_dims(1, 2);

        let (k, v) = self.expand_kv(k, v);

        let mut scores = self.scaled_scores(q, k);
        if causal {
            scores = masking::apply_causal_mask(scores, seq_len);
        }
        if let Some(window) = self.sliding_window {
            scores = masking::apply_sliding_window_mask(scores, seq_len, window);
        }

        let out = softmax(scores, 3).matmul(v);
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.n_heads * self.head_dim]);
        self.wo.forward(out)
    }

    /// Forward pass through a KV cache.
    ///
    /// The rotary phase comes from the cache's total token offset, so a
    /// rotating cache keeps advancing positions even after eviction.
    pub fn forward_with_cache(
        &self,
        x: Tensor<B, 3>,
        rope: &Rope<B>,
        cache: &mut KvCache<B>,
        causal: bool,
    ) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let offset = cache.offset();

        let q = self.wq.forward(x.clone());
        let k = self.wk.forward(x.clone());
        let v = self.wv.forward(x);

        let q = q.reshape([batch, seq_len, self.n_heads, self.head_dim]);
        let k = k.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);
        let v = v.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);

        let (q, k) = rope.apply(q, k, offset);

        let q = q.swap_dims(1, 2);
        let k = k.swap_dims(1, 2);
        let v = v.swap_dims(1, 2);

        let (k, v) = cache.update(k, v);
        let kv_len = k.dims()[2];
        let kv_start = cache.kv_start();

        let (k, v) = self.expand_kv(k, v);

        let mut scores = self.scaled_scores(q, k);
        if causal {
            scores = masking::apply_causal_mask_with_offset(scores, seq_len, kv_len, offset, kv_start);
        }
        if let Some(window) = self.sliding_window {
            scores = masking::apply_sliding_window_mask_with_offset(
                scores, seq_len, kv_len, window, offset, kv_start,
            );
        }

        let out = softmax(scores, 3).matmul(v);
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.n_heads * self.head_dim]);
        self.wo.forward(out)
    }

    /// `Q @ K^T` with the scale applied where the architecture expects it.
    fn scaled_scores(&self, q: Tensor<B, 4>, k: Tensor<B, 4>) -> Tensor<B, 4> {
        let k_t = k.swap_dims(2, 3);
        match self.scale_placement.0 {
            ScalePlacement::Query => (q * self.scale).matmul(k_t),
            ScalePlacement::Scores => q.matmul(k_t) * self.scale,
        }
    }

    /// Broadcast KV heads across the query-head groups (GQA).
    fn expand_kv(&self, k: Tensor<B, 4>, v: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        if self.n_heads == self.n_kv_heads {
            return (k, v);
        }
        let repeat = self.n_heads / self.n_kv_heads;
        let [batch, n_kv_heads, seq, head_dim] = k.dims();

        let k = k
            .unsqueeze_dim::<5>(2)
            .repeat_dim(2, repeat)
            .reshape([batch, n_kv_heads * repeat, seq, head_dim]);
        let v = v
            .unsqueeze_dim::<5>(2)
            .repeat_dim(2, repeat)
            .reshape([batch, n_kv_heads * repeat, seq, head_dim]);
        (k, v)
    }
}
