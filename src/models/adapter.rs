//! Audio-to-decoder adapter.
//!
//! Concatenates adjacent encoder frames to match the decoder token rate,
//! then projects into the decoder's hidden dimension.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Adapter configuration.
#[derive(Config, Debug)]
pub struct AudioAdapterConfig {
    /// Input width (encoder dim x reshape factor).
    pub in_dim: usize,
    pub hidden_dim: usize,
    /// Decoder hidden dimension.
    pub out_dim: usize,
}

/// Two-layer GELU projection.
#[derive(Module, Debug)]
pub struct AudioAdapter<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
}

impl AudioAdapterConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AudioAdapter<B> {
        let linear1 = LinearConfig::new(self.in_dim, self.hidden_dim)
            .with_bias(false)
            .init(device);
        let linear2 = LinearConfig::new(self.hidden_dim, self.out_dim)
            .with_bias(false)
            .init(device);
        AudioAdapter { linear1, linear2 }
    }
}

impl<B: Backend> AudioAdapter<B> {
    pub fn new(linear1: Linear<B>, linear2: Linear<B>) -> Self {
        Self { linear1, linear2 }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.linear1.forward(x));
        self.linear2.forward(x)
    }
}

/// Concatenate `factor` adjacent frames along the feature axis.
///
/// A trailing partial group is truncated.
pub fn reshape_encoder_output<B: Backend>(
    encoder_output: Tensor<B, 3>,
    factor: usize,
) -> Tensor<B, 3> {
    let [batch, seq, d_model] = encoder_output.dims();
    let new_seq = seq / factor;
    let truncated = new_seq * factor;
    encoder_output
        .slice([0..batch, 0..truncated, 0..d_model])
        .reshape([batch, new_seq, d_model * factor])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_adapter_shape() {
        let device = Default::default();
        let adapter = AudioAdapterConfig::new(128, 64, 32).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::zeros([1, 10, 128], &device);
        assert_eq!(adapter.forward(x).dims(), [1, 10, 32]);
    }

    #[test]
    fn test_reshape_concatenates_frames() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::zeros([1, 20, 64], &device);
        assert_eq!(reshape_encoder_output(x, 4).dims(), [1, 5, 256]);
    }

    #[test]
    fn test_reshape_truncates_partial_group() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::zeros([1, 21, 64], &device);
        assert_eq!(reshape_encoder_output(x, 4).dims(), [1, 5, 256]);
    }
}
