//! Feed-forward blocks: SwiGLU and the plain two-layer MLP.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::silu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// SwiGLU configuration.
#[derive(Config, Debug)]
pub struct SwiGluConfig {
    pub d_model: usize,
    pub hidden_dim: usize,
    #[config(default = false)]
    pub bias: bool,
}

/// SwiGLU MLP: `w2(silu(w1(x)) * w3(x))`.
///
/// Named w1/w2/w3 to match the checkpoint layout:
/// w1 = gate, w2 = down, w3 = up.
#[derive(Module, Debug)]
pub struct SwiGlu<B: Backend> {
    w1: Linear<B>,
    w2: Linear<B>,
    w3: Linear<B>,
}

impl SwiGluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwiGlu<B> {
        let w1 = LinearConfig::new(self.d_model, self.hidden_dim)
            .with_bias(self.bias)
            .init(device);
        let w2 = LinearConfig::new(self.hidden_dim, self.d_model)
            .with_bias(self.bias)
            .init(device);
        let w3 = LinearConfig::new(self.d_model, self.hidden_dim)
            .with_bias(self.bias)
            .init(device);
        SwiGlu { w1, w2, w3 }
    }
}

impl<B: Backend> SwiGlu<B> {
    /// Build from loaded linears.
    pub fn new(w1: Linear<B>, w2: Linear<B>, w3: Linear<B>) -> Self {
        Self { w1, w2, w3 }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = silu(self.w1.forward(x.clone()));
        let up = self.w3.forward(x);
        self.w2.forward(gate * up)
    }
}

/// Two-layer MLP configuration (conformer feed-forward halves).
#[derive(Config, Debug)]
pub struct MlpConfig {
    pub d_model: usize,
    pub hidden_dim: usize,
    #[config(default = true)]
    pub bias: bool,
}

/// Plain `Linear -> SiLU -> Linear` feed-forward.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    w1: Linear<B>,
    w2: Linear<B>,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let w1 = LinearConfig::new(self.d_model, self.hidden_dim)
            .with_bias(self.bias)
            .init(device);
        let w2 = LinearConfig::new(self.hidden_dim, self.d_model)
            .with_bias(self.bias)
            .init(device);
        Mlp { w1, w2 }
    }
}

impl<B: Backend> Mlp<B> {
    pub fn new(w1: Linear<B>, w2: Linear<B>) -> Self {
        Self { w1, w2 }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.w2.forward(silu(self.w1.forward(x)))
    }
}
