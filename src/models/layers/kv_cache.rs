//! Per-layer key/value caches for autoregressive decoding.
//!
//! Two policies:
//!
//! - **Unbounded**: new keys/values are concatenated forever (chunked
//!   family, where the prompt is bounded by the audio chunk).
//! - **Rotating**: stored length is capped at a fixed capacity and the
//!   oldest entries are evicted FIFO (streaming family, so memory stays
//!   bounded over arbitrarily long sessions).
//!
//! Both policies keep a monotonically non-decreasing `offset` counting
//! every token ever appended. The offset feeds the rotary phase; the
//! stored length does not.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// KV cache for one decoder or encoder layer.
#[derive(Debug, Clone)]
pub struct KvCache<B: Backend> {
    /// Cached keys [batch, heads, stored, head_dim].
    k: Option<Tensor<B, 4>>,
    /// Cached values [batch, heads, stored, head_dim].
    v: Option<Tensor<B, 4>>,
    /// Maximum stored length; `None` appends without bound.
    capacity: Option<usize>,
    /// Total tokens ever appended.
    offset: usize,
}

impl<B: Backend> KvCache<B> {
    /// Create an unbounded append-only cache.
    pub fn unbounded() -> Self {
        Self {
            k: None,
            v: None,
            capacity: None,
            offset: 0,
        }
    }

    /// Create a rotating cache holding at most `capacity` positions.
    pub fn rotating(capacity: usize) -> Self {
        assert!(capacity > 0, "rotating cache capacity must be positive");
        Self {
            k: None,
            v: None,
            capacity: Some(capacity),
            offset: 0,
        }
    }

    /// Append new keys/values and return the full stored sequences.
    ///
    /// Under the rotating policy, eviction happens after the append so the
    /// returned tensors never exceed the capacity.
    pub fn update(&mut self, k_new: Tensor<B, 4>, v_new: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let appended = k_new.dims()[2];

        let k_full = match self.k.take() {
            None => k_new,
            Some(prev) => Tensor::cat(vec![prev, k_new], 2),
        };
        let v_full = match self.v.take() {
            None => v_new,
            Some(prev) => Tensor::cat(vec![prev, v_new], 2),
        };

        let (k_full, v_full) = match self.capacity {
            Some(cap) if k_full.dims()[2] > cap => {
                let [batch, heads, stored, head_dim] = k_full.dims();
                let start = stored - cap;
                (
                    k_full.slice([0..batch, 0..heads, start..stored, 0..head_dim]),
                    v_full.slice([0..batch, 0..heads, start..stored, 0..head_dim]),
                )
            }
            _ => (k_full, v_full),
        };

        self.offset += appended;
        self.k = Some(k_full.clone());
        self.v = Some(v_full.clone());
        (k_full, v_full)
    }

    /// Number of positions currently stored.
    pub fn len(&self) -> usize {
        self.k.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total tokens ever appended. Monotone; the rotary-phase source.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Absolute position of the first stored key.
    pub fn kv_start(&self) -> usize {
        self.offset - self.len()
    }

    /// Drop stored tensors and reset the offset.
    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
        self.offset = 0;
    }
}

/// One cache per layer, advanced in lockstep.
#[derive(Debug)]
pub struct LayerCaches<B: Backend> {
    caches: Vec<KvCache<B>>,
}

impl<B: Backend> LayerCaches<B> {
    /// Unbounded caches for `n_layers` layers.
    pub fn unbounded(n_layers: usize) -> Self {
        Self {
            caches: (0..n_layers).map(|_| KvCache::unbounded()).collect(),
        }
    }

    /// Rotating caches for `n_layers` layers.
    pub fn rotating(n_layers: usize, capacity: usize) -> Self {
        Self {
            caches: (0..n_layers).map(|_| KvCache::rotating(capacity)).collect(),
        }
    }

    pub fn get_mut(&mut self, layer: usize) -> Option<&mut KvCache<B>> {
        self.caches.get_mut(layer)
    }

    /// Token offset (identical across layers).
    pub fn offset(&self) -> usize {
        self.caches.first().map(|c| c.offset()).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        for cache in &mut self.caches {
            cache.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn step(val: f32, seq: usize) -> Tensor<TestBackend, 4> {
        Tensor::ones([1, 2, seq, 4], &Default::default()) * val
    }

    #[test]
    fn test_unbounded_append() {
        let mut cache: KvCache<TestBackend> = KvCache::unbounded();
        assert!(cache.is_empty());

        let (k, _) = cache.update(step(1.0, 5), step(1.0, 5));
        assert_eq!(k.dims(), [1, 2, 5, 4]);
        let (k, _) = cache.update(step(2.0, 3), step(2.0, 3));
        assert_eq!(k.dims(), [1, 2, 8, 4]);
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.offset(), 8);
        assert_eq!(cache.kv_start(), 0);
    }

    #[test]
    fn test_rotating_caps_length_but_not_offset() {
        let capacity = 4;
        let mut cache: KvCache<TestBackend> = KvCache::rotating(capacity);

        let n_steps = 10;
        for i in 0..n_steps {
            cache.update(step(i as f32, 1), step(i as f32, 1));
            assert!(cache.len() <= capacity, "stored length exceeded capacity");
        }
        assert_eq!(cache.len(), capacity);
        assert_eq!(cache.offset(), n_steps);
        assert_eq!(cache.kv_start(), n_steps - capacity);
    }

    #[test]
    fn test_rotating_evicts_oldest() {
        let mut cache: KvCache<TestBackend> = KvCache::rotating(2);
        cache.update(step(1.0, 1), step(1.0, 1));
        cache.update(step(2.0, 1), step(2.0, 1));
        let (k, _) = cache.update(step(3.0, 1), step(3.0, 1));

        let data: Vec<f32> = k.to_data().to_vec().unwrap();
        // Oldest (1.0) is gone; stored order is [2.0, 3.0] per head.
        assert_eq!(&data[..8], &[2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_rotating_prefill_larger_than_capacity() {
        let mut cache: KvCache<TestBackend> = KvCache::rotating(3);
        let (k, v) = cache.update(step(1.0, 8), step(1.0, 8));
        assert_eq!(k.dims()[2], 3);
        assert_eq!(v.dims()[2], 3);
        assert_eq!(cache.offset(), 8);
        assert_eq!(cache.kv_start(), 5);
    }

    #[test]
    fn test_reset() {
        let mut cache: KvCache<TestBackend> = KvCache::rotating(4);
        cache.update(step(1.0, 2), step(1.0, 2));
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.offset(), 0);
    }

    #[test]
    fn test_layer_caches_lockstep() {
        let mut caches: LayerCaches<TestBackend> = LayerCaches::unbounded(3);
        for layer in 0..3 {
            caches
                .get_mut(layer)
                .unwrap()
                .update(step(1.0, 5), step(1.0, 5));
        }
        assert_eq!(caches.offset(), 5);
        caches.reset();
        assert_eq!(caches.offset(), 0);
    }
}
