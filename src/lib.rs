//! # vox-engine
//!
//! On-device speech-to-text inference runtime built on the Burn framework.
//! Three interchangeable architectures sit behind one engine surface:
//!
//! 1. **Conformer + CTC**: non-autoregressive encoder with greedy
//!    per-frame decoding.
//! 2. **Chunked audio LM**: fixed-chunk encoder feeding an autoregressive
//!    transformer decoder through a projection adapter.
//! 3. **Streaming audio LM**: causal sliding-window encoder with
//!    time-conditioned decoding and a bounded rotating KV cache.
//!
//! The engine consumes a resolved local model directory (`config.json`,
//! `tokenizer.json`, safetensors shards) and a raw mono waveform, and
//! exposes a blocking `transcribe` plus a cancellable `transcribe_stream`.
//!
//! Everything heavier (model download and caching, audio capture,
//! orchestration, UI) lives with collaborators, reached through the
//! [`engine::ModelResolver`] trait and the [`audio::AudioBuffer`] input
//! type.

pub mod audio;
pub mod engine;
pub mod error;
pub mod generation;
pub mod models;
pub mod tokenizer;
pub mod weights;

pub use audio::AudioBuffer;
pub use engine::{ModelResolver, SpeechEngine};
pub use error::{EngineError, Result};
pub use generation::{
    CancellationToken, SamplingConfig, SessionTelemetry, StreamEvent, Transcription,
    TranscriptionStream,
};
pub use models::{Architecture, ModelConfig, SpeechModel};
pub use tokenizer::BpeTokenizer;
