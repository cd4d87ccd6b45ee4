//! Conformer encoder with a CTC head.
//!
//! Blocks interleave half-step feed-forwards, self-attention, and a causal
//! depthwise conv module. The 0.5 feed-forward residual weight is part of
//! the architecture, not a tunable.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{EngineError, Result};

use super::layers::{
    Attention, AttentionConfig, CausalConvModule, CausalConvModuleConfig, ConvDownsampler,
    ConvDownsamplerConfig, Mlp, MlpConfig, PositionalConvConfig, PositionalConvEmbedding, RmsNorm,
    RmsNormConfig, Rope, RopeConfig, RopeStyle, ScalePlacement,
};

/// Conformer block configuration.
#[derive(Config, Debug)]
pub struct ConformerBlockConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub ff_hidden_dim: usize,
    #[config(default = 9)]
    pub conv_kernel_size: usize,
    /// Feed-forward residual weight (0.5 for the half-step design).
    #[config(default = 0.5)]
    pub ff_residual_weight: f32,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// One conformer block.
///
/// ```text
/// x -> + 0.5·FF1(norm) -> + Attn(norm) -> + Conv(norm) -> + 0.5·FF2(norm) -> norm_final
/// ```
#[derive(Module, Debug)]
pub struct ConformerBlock<B: Backend> {
    norm_ff1: RmsNorm<B>,
    ff1: Mlp<B>,
    norm_attn: RmsNorm<B>,
    attention: Attention<B>,
    norm_conv: RmsNorm<B>,
    conv: CausalConvModule<B>,
    norm_ff2: RmsNorm<B>,
    ff2: Mlp<B>,
    norm_final: RmsNorm<B>,
    ff_residual_weight: f32,
}

impl ConformerBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConformerBlock<B> {
        let norm = |d: &B::Device| RmsNormConfig::new(self.d_model).with_eps(self.norm_eps).init(d);

        // The conformer checkpoints scale queries before the dot product.
        let attention = AttentionConfig::new(
            self.d_model,
            self.n_heads,
            self.head_dim,
            ScalePlacement::Query,
        )
        .with_q_bias(true)
        .with_k_bias(true)
        .with_v_bias(true)
        .with_o_bias(true)
        .init(device);

        ConformerBlock {
            norm_ff1: norm(device),
            ff1: MlpConfig::new(self.d_model, self.ff_hidden_dim).init(device),
            norm_attn: norm(device),
            attention,
            norm_conv: norm(device),
            conv: CausalConvModuleConfig::new(self.d_model)
                .with_kernel_size(self.conv_kernel_size)
                .with_norm_eps(self.norm_eps)
                .init(device),
            norm_ff2: norm(device),
            ff2: MlpConfig::new(self.d_model, self.ff_hidden_dim).init(device),
            norm_final: norm(device),
            ff_residual_weight: self.ff_residual_weight,
        }
    }
}

impl<B: Backend> ConformerBlock<B> {
    /// Build from loaded components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        norm_ff1: RmsNorm<B>,
        ff1: Mlp<B>,
        norm_attn: RmsNorm<B>,
        attention: Attention<B>,
        norm_conv: RmsNorm<B>,
        conv: CausalConvModule<B>,
        norm_ff2: RmsNorm<B>,
        ff2: Mlp<B>,
        norm_final: RmsNorm<B>,
        ff_residual_weight: f32,
    ) -> Self {
        Self {
            norm_ff1,
            ff1,
            norm_attn,
            attention,
            norm_conv,
            conv,
            norm_ff2,
            ff2,
            norm_final,
            ff_residual_weight,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, rope: &Rope<B>) -> Tensor<B, 3> {
        let x = x.clone() + self.ff1.forward(self.norm_ff1.forward(x)) * self.ff_residual_weight;
        let x = x.clone() + self.attention.forward(self.norm_attn.forward(x), rope, 0, false);
        let x = x.clone() + self.conv.forward(self.norm_conv.forward(x));
        let x = x.clone() + self.ff2.forward(self.norm_ff2.forward(x)) * self.ff_residual_weight;
        self.norm_final.forward(x)
    }
}

/// Conformer encoder configuration.
#[derive(Config, Debug)]
pub struct ConformerEncoderConfig {
    pub n_mels: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub ff_hidden_dim: usize,
    /// Output classes including the blank.
    pub n_classes: usize,
    #[config(default = 9)]
    pub conv_kernel_size: usize,
    #[config(default = 128)]
    pub pos_conv_kernel: usize,
    #[config(default = 16)]
    pub pos_conv_groups: usize,
    #[config(default = 0.5)]
    pub ff_residual_weight: f32,
    #[config(default = 4096)]
    pub max_seq_len: usize,
    #[config(default = 1_000_000.0)]
    pub rope_theta: f64,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Conformer encoder + CTC head.
///
/// Input: mel `[batch, n_mels, time]`.
/// Output: per-frame class logits `[batch, time/4, n_classes]`.
#[derive(Module, Debug)]
pub struct ConformerEncoder<B: Backend> {
    subsample: ConvDownsampler<B>,
    pos_conv: PositionalConvEmbedding<B>,
    rope: Rope<B>,
    blocks: Vec<ConformerBlock<B>>,
    ctc_head: Linear<B>,
}

impl ConformerEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConformerEncoder<B> {
        let subsample =
            ConvDownsamplerConfig::new(self.n_mels, self.d_model, self.d_model).init(device);

        let pos_conv = PositionalConvConfig::new(self.d_model)
            .with_kernel_size(self.pos_conv_kernel)
            .with_groups(self.pos_conv_groups)
            .init(device);

        let rope = RopeConfig::new(self.head_dim, self.max_seq_len, RopeStyle::Half)
            .with_theta(self.rope_theta)
            .init(device);

        let blocks = (0..self.n_layers)
            .map(|_| {
                ConformerBlockConfig::new(self.d_model, self.n_heads, self.head_dim, self.ff_hidden_dim)
                    .with_conv_kernel_size(self.conv_kernel_size)
                    .with_ff_residual_weight(self.ff_residual_weight)
                    .with_norm_eps(self.norm_eps)
                    .init(device)
            })
            .collect();

        let ctc_head = LinearConfig::new(self.d_model, self.n_classes)
            .with_bias(true)
            .init(device);

        ConformerEncoder {
            subsample,
            pos_conv,
            rope,
            blocks,
            ctc_head,
        }
    }
}

impl<B: Backend> ConformerEncoder<B> {
    /// Build from loaded components.
    pub fn new(
        subsample: ConvDownsampler<B>,
        pos_conv: PositionalConvEmbedding<B>,
        rope: Rope<B>,
        blocks: Vec<ConformerBlock<B>>,
        ctc_head: Linear<B>,
    ) -> Self {
        Self {
            subsample,
            pos_conv,
            rope,
            blocks,
            ctc_head,
        }
    }

    /// Per-frame class logits.
    pub fn forward(&self, mel: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.subsample.forward(mel); // [batch, d, time/4]
        let x = x.clone() + self.pos_conv.forward(x);
        let mut x = x.swap_dims(1, 2); // [batch, time/4, d]
        for block in &self.blocks {
            x = block.forward(x, &self.rope);
        }
        self.ctc_head.forward(x)
    }

    /// Greedy per-frame argmax labels for a single utterance.
    ///
    /// Non-finite logits are an inference error for the calling session,
    /// never a process failure.
    pub fn greedy_labels(&self, mel: Tensor<B, 3>) -> Result<Vec<u32>> {
        let logits = self.forward(mel);
        let [_, frames, n_classes] = logits.dims();
        let data: Vec<f32> = logits
            .to_data()
            .to_vec()
            .map_err(|e| EngineError::Inference(format!("logits readback failed: {e:?}")))?;
        if data.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::Inference(
                "non-finite logits from the encoder".into(),
            ));
        }

        let mut labels = Vec::with_capacity(frames);
        for t in 0..frames {
            let row = &data[t * n_classes..(t + 1) * n_classes];
            let mut best = 0usize;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            labels.push(best as u32);
        }
        Ok(labels)
    }

    pub fn n_layers(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> ConformerEncoderConfig {
        ConformerEncoderConfig::new(16, 32, 2, 4, 8, 64, 41)
            .with_conv_kernel_size(3)
            .with_pos_conv_kernel(8)
            .with_pos_conv_groups(4)
            .with_max_seq_len(256)
    }

    #[test]
    fn test_conformer_logit_shape() {
        let device = Default::default();
        let encoder = small_config().init::<TestBackend>(&device);

        let mel = Tensor::<TestBackend, 3>::zeros([1, 16, 80], &device);
        let logits = encoder.forward(mel);
        assert_eq!(logits.dims(), [1, 20, 41]);
    }

    #[test]
    fn test_greedy_labels_one_per_frame() {
        let device = Default::default();
        let encoder = small_config().init::<TestBackend>(&device);

        let mel = Tensor::<TestBackend, 3>::zeros([1, 16, 40], &device);
        let labels = encoder.greedy_labels(mel).unwrap();
        assert_eq!(labels.len(), 10);
        assert!(labels.iter().all(|&l| l < 41));
    }

    #[test]
    fn test_block_shape_preserved() {
        let device = Default::default();
        let block = ConformerBlockConfig::new(32, 4, 8, 64)
            .with_conv_kernel_size(3)
            .init::<TestBackend>(&device);
        let rope = RopeConfig::new(8, 128, RopeStyle::Half).init(&device);
        let x = Tensor::<TestBackend, 3>::zeros([2, 12, 32], &device);
        assert_eq!(block.forward(x, &rope).dims(), [2, 12, 32]);
    }
}
