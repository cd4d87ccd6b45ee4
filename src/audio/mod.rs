//! Audio front-end.
//!
//! Waveform container, length normalization/padding, and log-mel
//! spectrogram extraction shared by all model families.

pub mod chunk;
pub mod mel;
pub mod pad;

pub use chunk::{chunk_audio, ChunkConfig};
pub use mel::{MelExtractor, MelFeatures, MelLayout};
pub use pad::{pad_fixed_length, pad_streaming, StreamPadConfig};

use crate::error::{EngineError, Result};

/// Immutable mono waveform plus its sample rate.
///
/// Produced by the capture collaborator and consumed read-only by the
/// runtime; the runtime never resamples, a mismatched rate is rejected.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono audio samples, typically in [-1, 1].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a buffer from samples and a sample rate.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Validate the buffer against the rate a model expects.
    ///
    /// Empty waveforms and mismatched sample rates are `AudioInput` errors;
    /// resampling belongs to the capture pipeline, not this runtime.
    pub fn check(&self, expected_rate: u32) -> Result<()> {
        if self.samples.is_empty() {
            return Err(EngineError::AudioInput("empty waveform".into()));
        }
        if self.sample_rate != expected_rate {
            return Err(EngineError::AudioInput(format!(
                "sample rate {} Hz, model expects {} Hz",
                self.sample_rate, expected_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_rejects_empty() {
        let audio = AudioBuffer::new(vec![], 16000);
        assert!(matches!(
            audio.check(16000),
            Err(EngineError::AudioInput(_))
        ));
    }

    #[test]
    fn test_check_rejects_wrong_rate() {
        let audio = AudioBuffer::new(vec![0.0; 100], 44100);
        let err = audio.check(16000).unwrap_err();
        assert!(err.to_string().contains("44100"));
    }

    #[test]
    fn test_duration() {
        let audio = AudioBuffer::new(vec![0.0; 8000], 16000);
        assert!((audio.duration_secs() - 0.5).abs() < 1e-6);
    }
}
