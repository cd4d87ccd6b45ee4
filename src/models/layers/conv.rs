//! Convolutional building blocks.
//!
//! Three modules share this file: the strided downsampler every encoder
//! uses as its front-end, the weight-normalized positional conv embedding
//! of the CTC family (reconstructed to a plain conv at load time), and the
//! causal depthwise conv module inside conformer blocks.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::PaddingConfig1d;
use burn::tensor::activation::{gelu, sigmoid, silu};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::rms_norm::{RmsNorm, RmsNormConfig};

/// Downsampler configuration.
#[derive(Config, Debug)]
pub struct ConvDownsamplerConfig {
    /// Input channels (mel bins).
    pub in_channels: usize,
    /// Hidden channels after the first conv.
    pub hidden_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    /// Stride per conv; total downsample = stride².
    #[config(default = 2)]
    pub stride: usize,
}

/// Two strided Conv1d layers with GELU, 4x temporal downsampling.
#[derive(Module, Debug)]
pub struct ConvDownsampler<B: Backend> {
    conv1: Conv1d<B>,
    conv2: Conv1d<B>,
}

impl ConvDownsamplerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvDownsampler<B> {
        let conv1 = Conv1dConfig::new(self.in_channels, self.hidden_channels, self.kernel_size)
            .with_stride(self.stride)
            .with_padding(PaddingConfig1d::Explicit(1))
            .with_bias(true)
            .init(device);
        let conv2 = Conv1dConfig::new(self.hidden_channels, self.out_channels, self.kernel_size)
            .with_stride(self.stride)
            .with_padding(PaddingConfig1d::Explicit(1))
            .with_bias(true)
            .init(device);
        ConvDownsampler { conv1, conv2 }
    }
}

impl<B: Backend> ConvDownsampler<B> {
    pub fn new(conv1: Conv1d<B>, conv2: Conv1d<B>) -> Self {
        Self { conv1, conv2 }
    }

    /// `[batch, mel_bins, time]` -> `[batch, out_channels, time/4]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.conv1.forward(x));
        gelu(self.conv2.forward(x))
    }
}

/// Positional conv embedding configuration.
#[derive(Config, Debug)]
pub struct PositionalConvConfig {
    pub d_model: usize,
    #[config(default = 128)]
    pub kernel_size: usize,
    #[config(default = 16)]
    pub groups: usize,
}

/// Grouped convolution positional embedding.
///
/// Trained with weight normalization; the loader reconstructs the plain
/// kernel once, so this module only ever sees a fused weight. Even kernel
/// sizes produce one extra output sample, trimmed at the end.
#[derive(Module, Debug)]
pub struct PositionalConvEmbedding<B: Backend> {
    conv: Conv1d<B>,
    kernel_size: usize,
}

impl PositionalConvConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PositionalConvEmbedding<B> {
        let conv = Conv1dConfig::new(self.d_model, self.d_model, self.kernel_size)
            .with_groups(self.groups)
            .with_padding(PaddingConfig1d::Explicit(self.kernel_size / 2))
            .with_bias(true)
            .init(device);
        PositionalConvEmbedding {
            conv,
            kernel_size: self.kernel_size,
        }
    }
}

impl<B: Backend> PositionalConvEmbedding<B> {
    pub fn new(conv: Conv1d<B>, kernel_size: usize) -> Self {
        Self { conv, kernel_size }
    }

    /// `[batch, d_model, time]` -> positional embedding of the same shape.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, channels, time] = x.dims();
        let out = self.conv.forward(x);
        let out = if self.kernel_size % 2 == 0 {
            out.slice([0..batch, 0..channels, 0..time])
        } else {
            out
        };
        gelu(out)
    }
}

/// Causal conv module configuration.
#[derive(Config, Debug)]
pub struct CausalConvModuleConfig {
    pub d_model: usize,
    /// Depthwise kernel size; must be odd.
    #[config(default = 9)]
    pub kernel_size: usize,
    #[config(default = 1e-5)]
    pub norm_eps: f64,
}

/// Conformer-style causal convolution module.
///
/// Pointwise expand (2x) -> GLU -> left-padded depthwise causal conv ->
/// RMSNorm -> SiLU -> pointwise project. The left padding of `kernel - 1`
/// keeps every output sample a function of past inputs only.
#[derive(Module, Debug)]
pub struct CausalConvModule<B: Backend> {
    pointwise1: Conv1d<B>,
    depthwise: Conv1d<B>,
    norm: RmsNorm<B>,
    pointwise2: Conv1d<B>,
    d_model: usize,
    kernel_size: usize,
}

impl CausalConvModuleConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CausalConvModule<B> {
        assert!(
            self.kernel_size % 2 == 1,
            "causal conv module requires an odd kernel"
        );
        let pointwise1 = Conv1dConfig::new(self.d_model, 2 * self.d_model, 1)
            .with_padding(PaddingConfig1d::Valid)
            .with_bias(true)
            .init(device);
        let depthwise = Conv1dConfig::new(self.d_model, self.d_model, self.kernel_size)
            .with_groups(self.d_model)
            .with_padding(PaddingConfig1d::Valid)
            .with_bias(true)
            .init(device);
        let norm = RmsNormConfig::new(self.d_model)
            .with_eps(self.norm_eps)
            .init(device);
        let pointwise2 = Conv1dConfig::new(self.d_model, self.d_model, 1)
            .with_padding(PaddingConfig1d::Valid)
            .with_bias(true)
            .init(device);

        CausalConvModule {
            pointwise1,
            depthwise,
            norm,
            pointwise2,
            d_model: self.d_model,
            kernel_size: self.kernel_size,
        }
    }
}

impl<B: Backend> CausalConvModule<B> {
    pub fn new(
        pointwise1: Conv1d<B>,
        depthwise: Conv1d<B>,
        norm: RmsNorm<B>,
        pointwise2: Conv1d<B>,
        d_model: usize,
        kernel_size: usize,
    ) -> Self {
        Self {
            pointwise1,
            depthwise,
            norm,
            pointwise2,
            d_model,
            kernel_size,
        }
    }

    /// `[batch, seq, d_model]` -> `[batch, seq, d_model]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq, _] = x.dims();
        let x = x.swap_dims(1, 2); // [batch, d, seq]

        // Pointwise expand + GLU gate over the channel axis.
        let x = self.pointwise1.forward(x); // [batch, 2d, seq]
        let a = x.clone().slice([0..batch, 0..self.d_model, 0..seq]);
        let b = x.slice([0..batch, self.d_model..2 * self.d_model, 0..seq]);
        let x = a * sigmoid(b);

        // Left-pad so the depthwise conv is strictly causal.
        let pad = Tensor::zeros([batch, self.d_model, self.kernel_size - 1], &x.device());
        let x = Tensor::cat(vec![pad, x], 2);
        let x = self.depthwise.forward(x); // [batch, d, seq]

        let x = x.swap_dims(1, 2); // [batch, seq, d]
        let x = silu(self.norm.forward(x));

        let x = x.swap_dims(1, 2);
        let x = self.pointwise2.forward(x);
        x.swap_dims(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_downsampler_4x() {
        let device = Default::default();
        let conv = ConvDownsamplerConfig::new(128, 256, 256).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::zeros([1, 128, 100], &device);
        let out = conv.forward(x);
        assert_eq!(out.dims(), [1, 256, 25]);
    }

    #[test]
    fn test_positional_conv_preserves_time() {
        let device = Default::default();
        // Even kernel: the conv emits one extra sample that gets trimmed.
        let pos = PositionalConvConfig::new(32)
            .with_kernel_size(4)
            .with_groups(4)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::zeros([1, 32, 50], &device);
        assert_eq!(pos.forward(x).dims(), [1, 32, 50]);
    }

    #[test]
    fn test_causal_conv_module_shape() {
        let device = Default::default();
        let module = CausalConvModuleConfig::new(16)
            .with_kernel_size(5)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::zeros([2, 20, 16], &device);
        assert_eq!(module.forward(x).dims(), [2, 20, 16]);
    }

    #[test]
    fn test_causal_conv_module_is_causal() {
        // Changing a later input sample must not affect earlier outputs.
        let device = Default::default();
        let module = CausalConvModuleConfig::new(8)
            .with_kernel_size(3)
            .init::<TestBackend>(&device);

        let base = Tensor::<TestBackend, 3>::ones([1, 10, 8], &device) * 0.5;
        let out_a = module.forward(base.clone());

        // Perturb only the final time step.
        let bump = Tensor::<TestBackend, 3>::ones([1, 1, 8], &device) * 10.0;
        let perturbed = Tensor::cat(
            vec![base.slice([0..1, 0..9, 0..8]), bump],
            1,
        );
        let out_b = module.forward(perturbed);

        let a: Vec<f32> = out_a
            .slice([0..1, 0..9, 0..8])
            .to_data()
            .to_vec()
            .unwrap();
        let b: Vec<f32> = out_b
            .slice([0..1, 0..9, 0..8])
            .to_data()
            .to_vec()
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6, "future leaked into the past");
        }
    }

    #[test]
    #[should_panic(expected = "odd kernel")]
    fn test_causal_conv_rejects_even_kernel() {
        let device: <TestBackend as burn::tensor::backend::Backend>::Device = Default::default();
        let _ = CausalConvModuleConfig::new(8)
            .with_kernel_size(4)
            .init::<TestBackend>(&device);
    }
}
