//! Unified error types for the inference runtime.

use std::path::PathBuf;

/// Main error type for engine operations.
///
/// Load-time variants (`Configuration`, `WeightMismatch`, `TokenizerAsset`)
/// are fatal for the model instance being loaded; there is no partial or
/// degraded load. `Inference` terminates only the session that raised it;
/// the shared module tree is never touched. `Cancelled` is caller-initiated
/// and not a failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or missing model configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sanitized tensors do not align with the module tree.
    #[error("weight mismatch: {0}")]
    WeightMismatch(String),

    /// Malformed tokenizer vocabulary file.
    #[error("tokenizer asset error: {0}")]
    TokenizerAsset(String),

    /// Numerical or shape failure during a forward pass.
    #[error("inference error: {0}")]
    Inference(String),

    /// Caller-initiated cancellation of a streaming session.
    #[error("transcription cancelled")]
    Cancelled,

    /// Unusable input waveform (empty, wrong sample rate).
    #[error("audio input error: {0}")]
    AudioInput(String),

    /// A package identifier could not be resolved to a local directory.
    /// Distinct from inference failures: the caller may retry resolution.
    #[error("model resolution failed for {id}: {reason}")]
    ModelResolve { id: String, reason: String },

    /// File read failed while loading a model package.
    #[error("I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that are fatal at model load time.
    pub fn is_fatal_load_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::WeightMismatch(_) | Self::TokenizerAsset(_) | Self::Io { .. }
        )
    }
}
