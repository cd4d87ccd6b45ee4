//! Attention masking helpers.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Apply a causal mask to attention scores (same-length Q and K).
///
/// Masks positions where `j > i` with `-inf`.
pub fn apply_causal_mask<B: Backend>(scores: Tensor<B, 4>, seq_len: usize) -> Tensor<B, 4> {
    let device = scores.device();
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    let mask: Tensor<B, 1> = Tensor::from_floats(mask_data.as_slice(), &device);
    let mask: Tensor<B, 4> = mask
        .reshape([seq_len, seq_len])
        .unsqueeze_dim::<3>(0)
        .unsqueeze_dim(0);
    scores + mask
}

/// Apply a causal mask with different Q/K lengths (cached decode).
///
/// Query position `i` maps to absolute position `offset + i`; keys start at
/// absolute `kv_start` (non-zero once a rotating cache has evicted). Key
/// positions past the query are masked.
pub fn apply_causal_mask_with_offset<B: Backend>(
    scores: Tensor<B, 4>,
    q_len: usize,
    kv_len: usize,
    offset: usize,
    kv_start: usize,
) -> Tensor<B, 4> {
    // Single-token cached decode: the query is at `offset` and every cached
    // key is at or before it, so nothing needs masking.
    if q_len == 1 {
        return scores;
    }
    let device = scores.device();
    let mut mask_data = vec![0.0f32; q_len * kv_len];
    for i in 0..q_len {
        let pos = offset + i;
        for j in 0..kv_len {
            if kv_start + j > pos {
                mask_data[i * kv_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    let mask: Tensor<B, 1> = Tensor::from_floats(mask_data.as_slice(), &device);
    let mask: Tensor<B, 4> = mask
        .reshape([q_len, kv_len])
        .unsqueeze_dim::<3>(0)
        .unsqueeze_dim(0);
    scores + mask
}

/// Apply a sliding-window mask: positions farther than `window` apart are
/// masked in both directions.
pub fn apply_sliding_window_mask<B: Backend>(
    scores: Tensor<B, 4>,
    seq_len: usize,
    window: usize,
) -> Tensor<B, 4> {
    let device = scores.device();
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in 0..seq_len {
            if i.abs_diff(j) > window {
                mask_data[i * seq_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    let mask: Tensor<B, 1> = Tensor::from_floats(mask_data.as_slice(), &device);
    let mask: Tensor<B, 4> = mask
        .reshape([seq_len, seq_len])
        .unsqueeze_dim::<3>(0)
        .unsqueeze_dim(0);
    scores + mask
}

/// Sliding-window mask for cached decode with different Q/K lengths.
///
/// `kv_start` is the absolute position of the first cached key (non-zero
/// once a rotating cache has evicted).
pub fn apply_sliding_window_mask_with_offset<B: Backend>(
    scores: Tensor<B, 4>,
    q_len: usize,
    kv_len: usize,
    window: usize,
    offset: usize,
    kv_start: usize,
) -> Tensor<B, 4> {
    // Fast path: the whole KV span already fits inside the window.
    let farthest = offset + q_len - 1;
    if farthest.saturating_sub(kv_start) <= window {
        return scores;
    }
    let device = scores.device();
    let mut mask_data = vec![0.0f32; q_len * kv_len];
    for i in 0..q_len {
        let pos = offset + i;
        for j in 0..kv_len {
            let key_pos = kv_start + j;
            if pos.abs_diff(key_pos) > window {
                mask_data[i * kv_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    let mask: Tensor<B, 1> = Tensor::from_floats(mask_data.as_slice(), &device);
    let mask: Tensor<B, 4> = mask
        .reshape([q_len, kv_len])
        .unsqueeze_dim::<3>(0)
        .unsqueeze_dim(0);
    scores + mask
}
