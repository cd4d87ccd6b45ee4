//! Generation session state.
//!
//! One session per transcribe/stream call. Owns the KV caches, the emitted
//! token list, the sampler, the cancellation flag, and telemetry. Destroyed
//! with the call; a session never outlives its stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::debug;

use super::sampling::Sampler;
use crate::error::{EngineError, Result};
use crate::models::layers::LayerCaches;

/// Scratch buffers are shrunk every this many decode steps, not every
/// step, to bound peak memory over long streams without per-step churn.
const SCRATCH_FLUSH_INTERVAL: usize = 32;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Cancelled,
    Failed,
}

/// Cancellation flag shared between the caller and a running session.
///
/// Observed once per decode step, never mid-step, so cache state stays
/// coherent at cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observational session metrics. Never feeds back into control flow.
#[derive(Debug, Clone, Default)]
pub struct SessionTelemetry {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub peak_scratch_bytes: usize,
}

impl SessionTelemetry {
    /// Generated tokens per second of decode wall time.
    pub fn tokens_per_sec(&self) -> f64 {
        if self.decode_ms <= 0.0 {
            return 0.0;
        }
        self.generated_tokens as f64 / (self.decode_ms / 1000.0)
    }
}

/// Mutable state for one generation call.
pub struct GenerationSession<B: Backend> {
    pub state: SessionState,
    caches: LayerCaches<B>,
    pub emitted: Vec<u32>,
    sampler: Sampler,
    cancel: CancellationToken,
    telemetry: SessionTelemetry,
    scratch: Vec<f32>,
    steps_since_flush: usize,
    prefill_started: Option<Instant>,
    decode_started: Option<Instant>,
}

impl<B: Backend> GenerationSession<B> {
    pub fn new(caches: LayerCaches<B>, sampler: Sampler, cancel: CancellationToken) -> Self {
        Self {
            state: SessionState::Idle,
            caches,
            emitted: Vec::new(),
            sampler,
            cancel,
            telemetry: SessionTelemetry::default(),
            scratch: Vec::new(),
            steps_since_flush: 0,
            prefill_started: None,
            decode_started: None,
        }
    }

    pub fn caches_mut(&mut self) -> &mut LayerCaches<B> {
        &mut self.caches
    }

    pub fn telemetry(&self) -> &SessionTelemetry {
        &self.telemetry
    }

    /// Whether the caller has requested cancellation. Checked between
    /// steps only.
    pub fn cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A cloneable handle to this session's cancellation flag.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn begin_prefill(&mut self, prompt_tokens: usize) {
        self.state = SessionState::Prefilling;
        self.telemetry.prompt_tokens = prompt_tokens;
        self.prefill_started = Some(Instant::now());
    }

    pub fn begin_decode(&mut self) {
        if let Some(start) = self.prefill_started.take() {
            self.telemetry.prefill_ms = start.elapsed().as_secs_f64() * 1000.0;
        }
        self.state = SessionState::Decoding;
        self.decode_started = Some(Instant::now());
    }

    /// Read the last-position logits, check them, and sample one token.
    ///
    /// Non-finite logits terminate this session (`Failed`), never the
    /// process and never the shared model.
    pub fn sample_last(&mut self, logits: Tensor<B, 3>) -> Result<u32> {
        let [_, seq, vocab] = logits.dims();
        let data = logits
            .slice([0..1, seq - 1..seq, 0..vocab])
            .to_data();
        self.scratch.clear();
        self.scratch.extend(
            data.to_vec::<f32>()
                .map_err(|e| EngineError::Inference(format!("logits readback failed: {e:?}")))?,
        );

        if self.scratch.iter().any(|v| !v.is_finite()) {
            self.state = SessionState::Failed;
            return Err(EngineError::Inference(
                "non-finite logits during decode".into(),
            ));
        }

        self.telemetry.peak_scratch_bytes = self
            .telemetry
            .peak_scratch_bytes
            .max(self.scratch.capacity() * std::mem::size_of::<f32>());

        let token = self.sampler.sample(&self.scratch);
        self.maybe_flush_scratch();
        Ok(token)
    }

    /// Record one emitted token.
    pub fn record_token(&mut self, token: u32) {
        self.emitted.push(token);
        self.telemetry.generated_tokens += 1;
    }

    /// Mark the session finished and close out decode timing.
    pub fn complete(&mut self) {
        if let Some(start) = self.decode_started.take() {
            self.telemetry.decode_ms = start.elapsed().as_secs_f64() * 1000.0;
        }
        self.state = SessionState::Completed;
        debug!(
            prompt = self.telemetry.prompt_tokens,
            generated = self.telemetry.generated_tokens,
            "session completed"
        );
    }

    /// Mark the session cancelled and release session-owned buffers.
    pub fn mark_cancelled(&mut self) {
        if let Some(start) = self.decode_started.take() {
            self.telemetry.decode_ms = start.elapsed().as_secs_f64() * 1000.0;
        }
        self.state = SessionState::Cancelled;
        self.release_buffers();
    }

    /// Drop session-owned tensors. Called on cancellation and failure so
    /// the guarantees hold before the stream returns.
    pub fn release_buffers(&mut self) {
        self.caches.reset();
        self.scratch = Vec::new();
    }

    fn maybe_flush_scratch(&mut self) {
        self.steps_since_flush += 1;
        if self.steps_since_flush >= SCRATCH_FLUSH_INTERVAL {
            self.steps_since_flush = 0;
            self.scratch.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::sampling::SamplingConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn session() -> GenerationSession<TestBackend> {
        GenerationSession::new(
            LayerCaches::unbounded(1),
            Sampler::new(SamplingConfig::greedy()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_state_progression() {
        let mut s = session();
        assert_eq!(s.state, SessionState::Idle);
        s.begin_prefill(10);
        assert_eq!(s.state, SessionState::Prefilling);
        s.begin_decode();
        assert_eq!(s.state, SessionState::Decoding);
        s.complete();
        assert_eq!(s.state, SessionState::Completed);
        assert_eq!(s.telemetry().prompt_tokens, 10);
    }

    fn logits3(data: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(burn::tensor::TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn test_sample_last_takes_final_position() {
        let mut s = session();
        let logits = logits3(vec![5.0, 0.0, 0.0, 0.0, 0.0, 9.0], [1, 2, 3]);
        assert_eq!(s.sample_last(logits).unwrap(), 2);
    }

    #[test]
    fn test_nan_logits_fail_the_session() {
        let mut s = session();
        let logits = logits3(vec![0.0, f32::NAN, 1.0], [1, 1, 3]);
        let err = s.sample_last(logits).unwrap_err();
        assert!(matches!(err, EngineError::Inference(_)));
        assert_eq!(s.state, SessionState::Failed);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_telemetry_tokens_per_sec() {
        let mut t = SessionTelemetry {
            generated_tokens: 50,
            decode_ms: 2000.0,
            ..Default::default()
        };
        assert!((t.tokens_per_sec() - 25.0).abs() < 1e-9);
        t.decode_ms = 0.0;
        assert_eq!(t.tokens_per_sec(), 0.0);
    }
}
