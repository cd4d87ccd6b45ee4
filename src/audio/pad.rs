//! Waveform padding for the two framing regimes.
//!
//! Fixed-length models (CTC and chunked families) right-pad or truncate to
//! an exact sample count before framing. The streaming family left-pads by
//! a whole number of audio tokens and right-pads to a token boundary plus a
//! fixed alignment tail so the spectrogram length divides evenly by the
//! encoder's time-downsampling factor.

use super::AudioBuffer;

/// Right-pad with zeros or truncate to exactly `target_len` samples.
///
/// A no-op (sample-for-sample) when the input is already the target length.
pub fn pad_fixed_length(samples: &[f32], target_len: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(target_len);
    if samples.len() >= target_len {
        out.extend_from_slice(&samples[..target_len]);
    } else {
        out.extend_from_slice(samples);
        out.resize(target_len, 0.0);
    }
    out
}

/// Streaming padding configuration.
#[derive(Debug, Clone)]
pub struct StreamPadConfig {
    pub sample_rate: u32,
    /// Number of silence tokens prepended so the decoder prefix sees only
    /// silence.
    pub left_pad_tokens: usize,
    /// Audio token rate in Hz (after encoder downsampling).
    pub frame_rate: f32,
    /// Extra right-pad tokens for conv/reshape alignment in the encoder.
    pub right_pad_tokens: usize,
}

impl Default for StreamPadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            left_pad_tokens: 32,
            frame_rate: 12.5,
            right_pad_tokens: 17,
        }
    }
}

impl StreamPadConfig {
    /// Samples per audio token.
    pub fn samples_per_token(&self) -> usize {
        (self.sample_rate as f32 / self.frame_rate) as usize
    }

    /// Number of samples to left-pad.
    pub fn left_pad_samples(&self) -> usize {
        self.left_pad_tokens * self.samples_per_token()
    }

    /// Right padding needed to reach a token boundary plus the fixed tail.
    pub fn right_pad_samples(&self, total_samples: usize) -> usize {
        let spt = self.samples_per_token();
        let remainder = total_samples % spt;
        let alignment = if remainder == 0 { 0 } else { spt - remainder };
        alignment + self.right_pad_tokens * spt
    }
}

/// Apply streaming padding: silence before, boundary alignment after.
pub fn pad_streaming(audio: &AudioBuffer, config: &StreamPadConfig) -> AudioBuffer {
    let left = config.left_pad_samples();
    let right = config.right_pad_samples(left + audio.samples.len());

    let mut padded = vec![0.0f32; left + audio.samples.len() + right];
    padded[left..left + audio.samples.len()].copy_from_slice(&audio.samples);

    AudioBuffer {
        samples: padded,
        sample_rate: audio.sample_rate,
    }
}

/// Number of whole audio tokens covered by `samples`.
pub fn num_audio_tokens(samples: usize, config: &StreamPadConfig) -> usize {
    samples / config.samples_per_token()
}
