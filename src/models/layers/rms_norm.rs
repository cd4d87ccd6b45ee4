//! RMSNorm and adaptive (time-conditioned) modulation.

use burn::config::Config;
use burn::module::{Module, Param, ParamId};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Standard RMSNorm configuration.
#[derive(Config, Debug)]
pub struct RmsNormConfig {
    pub d_model: usize,
    #[config(default = 1e-5)]
    pub eps: f64,
}

/// Standard RMSNorm: `x * weight / sqrt(mean(x^2) + eps)`.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    pub weight: burn::nn::RmsNorm<B>,
}

impl RmsNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RmsNorm<B> {
        let weight = burn::nn::RmsNormConfig::new(self.d_model)
            .with_epsilon(self.eps)
            .init(device);
        RmsNorm { weight }
    }
}

impl<B: Backend> RmsNorm<B> {
    /// Build from a loaded gamma vector.
    pub fn from_weight(gamma: Tensor<B, 1>, eps: f64) -> Self {
        RmsNorm {
            weight: burn::nn::RmsNorm {
                gamma: Param::initialized(ParamId::new(), gamma),
                epsilon: eps,
            },
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.weight.forward(x)
    }
}

/// Adaptive modulation configuration.
#[derive(Config, Debug)]
pub struct AdaRmsNormConfig {
    pub d_model: usize,
    /// Conditioning bottleneck dimension.
    pub t_cond_dim: usize,
}

/// Time-conditioned adaptive modulation.
///
/// Architecture: `Linear(d_model -> t_cond_dim) -> GELU ->
/// Linear(t_cond_dim -> d_model)`, applied as `x * (1 + scale)`.
///
/// This is modulation only; the actual RMSNorm happens separately in the
/// layer's attention/ffn norms.
#[derive(Module, Debug)]
pub struct AdaRmsNorm<B: Backend> {
    /// Down projection: d_model -> t_cond_dim.
    down: Linear<B>,
    /// Up projection: t_cond_dim -> d_model.
    up: Linear<B>,
}

impl AdaRmsNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AdaRmsNorm<B> {
        let down = LinearConfig::new(self.d_model, self.t_cond_dim)
            .with_bias(false)
            .init(device);
        let up = LinearConfig::new(self.t_cond_dim, self.d_model)
            .with_bias(false)
            .init(device);
        AdaRmsNorm { down, up }
    }
}

impl<B: Backend> AdaRmsNorm<B> {
    /// Build from loaded projections.
    pub fn new(down: Linear<B>, up: Linear<B>) -> Self {
        Self { down, up }
    }

    /// Modulate `x` with the conditioning embedding.
    ///
    /// `t_embed` is `[batch, 1, d_model]`; broadcast over the sequence.
    pub fn forward(&self, x: Tensor<B, 3>, t_embed: Tensor<B, 3>) -> Tensor<B, 3> {
        let scale = self.down.forward(t_embed);
        let scale = gelu(scale);
        let scale = self.up.forward(scale);
        x * (scale + 1.0)
    }
}
