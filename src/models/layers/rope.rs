//! Rotary position embeddings.
//!
//! Two application conventions exist in the supported checkpoints and they
//! are NOT interchangeable: the streaming family rotates adjacent
//! interleaved pairs, while the conformer and chunked families rotate the
//! two contiguous halves of each head ("rotate-half"). The convention is a
//! per-model flag carried in the configuration.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Which rotation convention a checkpoint was trained with.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum RopeStyle {
    /// Rotate adjacent pairs `(x[2i], x[2i+1])`.
    Interleaved,
    /// Rotate the first and second contiguous halves of the head dim.
    Half,
}

/// RoPE configuration.
#[derive(Config, Debug)]
pub struct RopeConfig {
    /// Head dimension.
    pub head_dim: usize,
    /// Maximum sequence length.
    pub max_seq_len: usize,
    /// Base frequency (theta).
    #[config(default = 1_000_000.0)]
    pub theta: f64,
    /// Rotation convention.
    pub style: RopeStyle,
}

/// Rotary position embeddings with precomputed cos/sin tables.
#[derive(Module, Debug)]
pub struct Rope<B: Backend> {
    /// Cosine table [max_seq_len, head_dim/2].
    cos: Tensor<B, 2>,
    /// Sine table [max_seq_len, head_dim/2].
    sin: Tensor<B, 2>,
    style: Ignored<RopeStyle>,
}

impl RopeConfig {
    /// Initialize RoPE with precomputed frequency tables.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Rope<B> {
        let half_dim = self.head_dim / 2;

        // inv_freq[i] = 1 / theta^(2i/d)
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / (self.theta as f32).powf((2 * i) as f32 / self.head_dim as f32))
            .collect();

        let mut freqs = vec![0.0f32; self.max_seq_len * half_dim];
        for pos in 0..self.max_seq_len {
            for (j, &f) in inv_freq.iter().enumerate() {
                freqs[pos * half_dim + j] = pos as f32 * f;
            }
        }

        let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), device)
            .reshape([self.max_seq_len, half_dim]);

        Rope {
            cos: freqs.clone().cos(),
            sin: freqs.sin(),
            style: Ignored(self.style.clone()),
        }
    }
}

impl<B: Backend> Rope<B> {
    /// Apply rotary embeddings to query and key tensors.
    ///
    /// `offset` is the number of tokens already in the cache: a fresh
    /// prefill passes 0, a continuation passes the cache's token count so
    /// that positions keep advancing.
    ///
    /// Shapes: `q`/`k` are `[batch, seq, heads, head_dim]`.
    pub fn apply(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
        offset: usize,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let seq_len = q.dims()[1];
        let [_max, half_dim] = self.cos.dims();

        let cos = self
            .cos
            .clone()
            .slice([offset..offset + seq_len, 0..half_dim]);
        let sin = self
            .sin
            .clone()
            .slice([offset..offset + seq_len, 0..half_dim]);

        let q_rot = self.rotate(q, cos.clone(), sin.clone());
        let k_rot = self.rotate(k, cos, sin);
        (q_rot, k_rot)
    }

    fn rotate(&self, x: Tensor<B, 4>, cos: Tensor<B, 2>, sin: Tensor<B, 2>) -> Tensor<B, 4> {
        match self.style.0 {
            RopeStyle::Interleaved => self.rotate_interleaved(x, cos, sin),
            RopeStyle::Half => self.rotate_half(x, cos, sin),
        }
    }

    /// Adjacent-pair rotation: pairs are `(x[2i], x[2i+1])`.
    fn rotate_interleaved(
        &self,
        x: Tensor<B, 4>,
        cos: Tensor<B, 2>,
        sin: Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let [batch, seq, heads, head_dim] = x.dims();
        let half_dim = head_dim / 2;

        let x_pairs = x.reshape([batch, seq, heads, half_dim, 2]);
        let x_r: Tensor<B, 4> = x_pairs
            .clone()
            .slice([0..batch, 0..seq, 0..heads, 0..half_dim, 0..1])
            .reshape([batch, seq, heads, half_dim]);
        let x_i: Tensor<B, 4> = x_pairs
            .slice([0..batch, 0..seq, 0..heads, 0..half_dim, 1..2])
            .reshape([batch, seq, heads, half_dim]);

        // [seq, half_dim] -> [1, seq, 1, half_dim] for broadcasting
        let cos: Tensor<B, 4> = cos.unsqueeze_dim::<3>(0).unsqueeze_dim(2);
        let sin: Tensor<B, 4> = sin.unsqueeze_dim::<3>(0).unsqueeze_dim(2);

        let out_r = x_r.clone() * cos.clone() - x_i.clone() * sin.clone();
        let out_i = x_r * sin + x_i * cos;

        let out_r: Tensor<B, 5> = out_r.unsqueeze_dim(4);
        let out_i: Tensor<B, 5> = out_i.unsqueeze_dim(4);
        Tensor::cat(vec![out_r, out_i], 4).reshape([batch, seq, heads, head_dim])
    }

    /// Rotate-half: pairs are `(x[i], x[i + d/2])`.
    fn rotate_half(&self, x: Tensor<B, 4>, cos: Tensor<B, 2>, sin: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, seq, heads, head_dim] = x.dims();
        let half_dim = head_dim / 2;

        let x1 = x
            .clone()
            .slice([0..batch, 0..seq, 0..heads, 0..half_dim]);
        let x2 = x.slice([0..batch, 0..seq, 0..heads, half_dim..head_dim]);

        let cos: Tensor<B, 4> = cos.unsqueeze_dim::<3>(0).unsqueeze_dim(2);
        let sin: Tensor<B, 4> = sin.unsqueeze_dim::<3>(0).unsqueeze_dim(2);

        let out1 = x1.clone() * cos.clone() - x2.clone() * sin.clone();
        let out2 = x2 * cos + x1 * sin;
        Tensor::cat(vec![out1, out2], 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn tensor4(data: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn test_rope_shapes() {
        let device = Default::default();
        for style in [RopeStyle::Interleaved, RopeStyle::Half] {
            let rope = RopeConfig::new(64, 512, style).init::<TestBackend>(&device);
            let q = Tensor::<TestBackend, 4>::zeros([2, 10, 8, 64], &device);
            let k = Tensor::<TestBackend, 4>::zeros([2, 10, 8, 64], &device);
            let (q_rot, k_rot) = rope.apply(q, k, 0);
            assert_eq!(q_rot.dims(), [2, 10, 8, 64]);
            assert_eq!(k_rot.dims(), [2, 10, 8, 64]);
        }
    }

    #[test]
    fn test_position_zero_is_identity() {
        // At position 0 every angle is 0, so both conventions are identity.
        for style in [RopeStyle::Interleaved, RopeStyle::Half] {
            let device = Default::default();
            let rope = RopeConfig::new(8, 16, style).init::<TestBackend>(&device);
            let x = tensor4(
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
                [1, 1, 1, 8],
            );
            let (out, _) = rope.apply(x.clone(), x.clone(), 0);
            let a: Vec<f32> = out.to_data().to_vec().unwrap();
            let b: Vec<f32> = x.to_data().to_vec().unwrap();
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_conventions_differ_at_nonzero_positions() {
        let device = Default::default();
        let inter = RopeConfig::new(8, 16, RopeStyle::Interleaved)
            .with_theta(10_000.0)
            .init::<TestBackend>(&device);
        let half = RopeConfig::new(8, 16, RopeStyle::Half)
            .with_theta(10_000.0)
            .init::<TestBackend>(&device);

        let row = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let x = tensor4([row.clone(), row].concat(), [1, 2, 1, 8]);
        let (a, _) = inter.apply(x.clone(), x.clone(), 0);
        let (b, _) = half.apply(x.clone(), x.clone(), 0);

        let a: Vec<f32> = a.to_data().to_vec().unwrap();
        let b: Vec<f32> = b.to_data().to_vec().unwrap();
        let max_diff = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff > 1e-3, "conventions must not coincide, diff {max_diff}");
    }

    #[test]
    fn test_offset_matches_absolute_position() {
        // Rotating the token at absolute position 3 must give the same
        // result whether it arrives via offset=3/seq=1 or offset=0/seq=4.
        let device = Default::default();
        let rope = RopeConfig::new(8, 16, RopeStyle::Interleaved)
            .with_theta(10_000.0)
            .init::<TestBackend>(&device);

        let row = vec![0.5, -1.0, 2.0, 0.25, 1.5, -0.5, 0.75, 1.0];
        let seq4 = tensor4(row.repeat(4), [1, 4, 1, 8]);
        let one = tensor4(row, [1, 1, 1, 8]);

        let (full, _) = rope.apply(seq4.clone(), seq4, 0);
        let (stepped, _) = rope.apply(one.clone(), one, 3);

        let full_last: Vec<f32> = full
            .slice([0..1, 3..4, 0..1, 0..8])
            .to_data()
            .to_vec()
            .unwrap();
        let stepped: Vec<f32> = stepped.to_data().to_vec().unwrap();
        for (a, b) in full_last.iter().zip(stepped.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let device = Default::default();
        for style in [RopeStyle::Interleaved, RopeStyle::Half] {
            let rope = RopeConfig::new(8, 16, style).with_theta(10_000.0).init::<TestBackend>(&device);
            let x = tensor4(
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
                [1, 1, 1, 8],
            );
            let (out, _) = rope.apply(x.clone(), x.clone(), 5);
            let orig: Vec<f32> = x.to_data().to_vec().unwrap();
            let rot: Vec<f32> = out.to_data().to_vec().unwrap();
            let n0: f32 = orig.iter().map(|v| v * v).sum();
            let n1: f32 = rot.iter().map(|v| v * v).sum();
            assert!((n0 - n1).abs() < 1e-4, "rotation must preserve norm");
        }
    }
}
