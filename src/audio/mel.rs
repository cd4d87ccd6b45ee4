//! Log mel-spectrogram computation.
//!
//! Shared by all model families. The STFT uses a periodic Hann window with
//! reflect padding; the magnitude-squared spectrum drops the bin adjacent
//! to Nyquist to match the reference filterbank shapes; the filterbank is
//! Slaney-normalized. Normalization is log10 → clamp to (max − 8) →
//! (x + 4) / 4, in that exact order; the trained weights depend on it.

use std::f32::consts::PI;
use std::sync::OnceLock;

use num_complex::Complex;
use rustfft::{num_complex::Complex as FftComplex, FftPlanner};

use crate::error::{EngineError, Result};

/// Output axis orientation for the feature matrix.
///
/// An explicit parameter rather than an implicit convention: the CTC
/// family consumes `[frames, n_mels]`, the transformer families consume
/// `[n_mels, frames]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MelLayout {
    /// Row-major `[n_mels, frames]`.
    MelMajor,
    /// Row-major `[frames, n_mels]`.
    FrameMajor,
}

/// Extracted features: flat row-major data plus its 2D shape.
#[derive(Debug, Clone)]
pub struct MelFeatures {
    pub data: Vec<f32>,
    /// Number of mel bins.
    pub n_mels: usize,
    /// Number of frames.
    pub n_frames: usize,
    pub layout: MelLayout,
}

/// Mel extraction configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    /// Global log-mel maximum for normalization. `<= 0` means use the
    /// per-audio maximum instead.
    pub log_mel_max: f32,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 400,
            hop_length: 160,
            n_mels: 128,
            log_mel_max: 1.5,
        }
    }
}

/// Mel-spectrogram extractor with a precomputed window and filterbank.
pub struct MelExtractor {
    config: MelConfig,
    /// `[n_mels][n_freqs]` triangular filters.
    mel_basis: &'static Vec<Vec<f32>>,
    window: Vec<f32>,
}

/// Process-wide filterbank cache.
///
/// The filterbank is a pure function of (sample_rate, n_fft, n_mels) and is
/// never mutated after construction, so it is safe to share across
/// concurrent sessions. One slot per distinct parameter set.
static FILTERBANKS: OnceLock<std::sync::Mutex<Vec<((u32, usize, usize), &'static Vec<Vec<f32>>)>>> =
    OnceLock::new();

fn shared_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> &'static Vec<Vec<f32>> {
    let cache = FILTERBANKS.get_or_init(|| std::sync::Mutex::new(Vec::new()));
    let mut cache = cache.lock().expect("filterbank cache poisoned");
    let key = (sample_rate, n_fft, n_mels);
    if let Some((_, fb)) = cache.iter().find(|(k, _)| *k == key) {
        return fb;
    }
    let fb: &'static Vec<Vec<f32>> = Box::leak(Box::new(build_mel_filterbank(
        sample_rate,
        n_fft,
        n_mels,
    )));
    cache.push((key, fb));
    fb
}

impl MelExtractor {
    /// Create an extractor for the given configuration.
    pub fn new(config: MelConfig) -> Self {
        let mel_basis = shared_filterbank(config.sample_rate, config.n_fft, config.n_mels);
        let window = hann_window(config.n_fft);
        Self {
            config,
            mel_basis,
            window,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `num_samples` input samples.
    ///
    /// Matches center-padded STFT behavior minus the trailing frame the
    /// reference drops.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let pad = self.config.n_fft / 2;
        (num_samples + 2 * pad - self.config.n_fft) / self.config.hop_length
    }

    /// Compute the normalized log-mel features.
    ///
    /// Output is finite for any input, including all-zero waveforms: the
    /// power floor of 1e-10 bounds the log, and the clamp bounds the range.
    pub fn extract(&self, samples: &[f32], layout: MelLayout) -> Result<MelFeatures> {
        if samples.len() < self.config.n_fft {
            return Err(EngineError::AudioInput(format!(
                "waveform of {} samples is shorter than one FFT window ({})",
                samples.len(),
                self.config.n_fft
            )));
        }

        let power = self.power_spectrogram(samples);
        let n_frames = power.len();
        let n_mels = self.config.n_mels;

        // Mel projection, then log10 with floor.
        let mut log_mel = vec![0.0f32; n_frames * n_mels];
        for (t, frame) in power.iter().enumerate() {
            for (m, filter) in self.mel_basis.iter().enumerate() {
                let energy: f32 = filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum();
                log_mel[t * n_mels + m] = energy.max(1e-10).log10();
            }
        }

        // Clamp to (max − 8). The global maximum comes from config when set,
        // otherwise from this audio. Clamp MUST precede the affine rescale.
        let log_max = if self.config.log_mel_max > 0.0 {
            self.config.log_mel_max
        } else {
            log_mel.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
        };
        let floor = log_max - 8.0;
        for v in &mut log_mel {
            *v = (v.max(floor) + 4.0) / 4.0;
        }

        let data = match layout {
            MelLayout::FrameMajor => log_mel,
            MelLayout::MelMajor => {
                let mut out = vec![0.0f32; n_frames * n_mels];
                for t in 0..n_frames {
                    for m in 0..n_mels {
                        out[m * n_frames + t] = log_mel[t * n_mels + m];
                    }
                }
                out
            }
        };

        Ok(MelFeatures {
            data,
            n_mels,
            n_frames,
            layout,
        })
    }

    /// Magnitude-squared STFT frames, `[n_frames][n_freqs]`.
    ///
    /// Keeps bins `0..n_fft/2`: the final kept bin is the one adjacent to
    /// Nyquist; Nyquist itself is dropped to match the reference weights.
    fn power_spectrogram(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_freqs = n_fft / 2;

        // Reflect padding by n_fft/2 on each side (center=True behavior).
        let pad = n_fft / 2;
        let mut padded = Vec::with_capacity(samples.len() + 2 * pad);
        for i in (1..=pad).rev() {
            padded.push(samples[i.min(samples.len() - 1)]);
        }
        padded.extend_from_slice(samples);
        for i in 0..pad {
            let idx = samples.len().saturating_sub(2).saturating_sub(i);
            padded.push(samples[idx]);
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        // Drop the trailing frame to match the reference framing.
        let n_frames = (padded.len() - n_fft) / hop;
        let mut result = Vec::with_capacity(n_frames);
        let mut buffer: Vec<FftComplex<f32>> = vec![FftComplex::new(0.0, 0.0); n_fft];

        for t in 0..n_frames {
            let start = t * hop;
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = FftComplex::new(padded[start + j] * self.window[j], 0.0);
            }
            fft.process(&mut buffer);
            let frame: Vec<f32> = buffer
                .iter()
                .take(n_freqs)
                .map(|c| Complex::new(c.re, c.im).norm_sqr())
                .collect();
            result.push(frame);
        }

        result
    }
}

/// Periodic Hann window: `0.5 * (1 - cos(2*pi*n/N))` for `n in [0, N)`.
fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / length as f32).cos()))
        .collect()
}

/// Convert frequency in Hz to mel scale (Slaney / O'Shaughnessy).
fn hz_to_mel(f: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74; // ln(6.4) / 27

    if f < MIN_LOG_HZ {
        f / F_SP
    } else {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

/// Convert mel value to Hz (Slaney / O'Shaughnessy).
fn mel_to_hz(m: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74;

    if m < MIN_LOG_MEL {
        m * F_SP
    } else {
        MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Build the Slaney-normalized triangular mel filterbank over the kept
/// spectrum bins (`n_fft/2` of them).
fn build_mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2;
    let fmax = sample_rate as f32 / 2.0;

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(fmax);
    let hz_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let mut filterbank = vec![vec![0.0f32; n_freqs]; n_mels];
    for i in 0..n_mels {
        let (f_lower, f_center, f_upper) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        for (j, &freq) in fft_freqs.iter().enumerate() {
            if freq >= f_lower && freq <= f_center && f_center > f_lower {
                filterbank[i][j] = (freq - f_lower) / (f_center - f_lower);
            } else if freq > f_center && freq <= f_upper && f_upper > f_center {
                filterbank[i][j] = (f_upper - freq) / (f_upper - f_center);
            }
        }

        // Slaney area-normalization
        let band_width = f_upper - f_lower;
        if band_width > 0.0 {
            let enorm = 2.0 / band_width;
            for val in &mut filterbank[i] {
                *val *= enorm;
            }
        }
    }

    filterbank
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> MelExtractor {
        MelExtractor::new(MelConfig::default())
    }

    #[test]
    fn test_hann_window_is_periodic() {
        let w = hann_window(4);
        assert!((w[0]).abs() < 1e-6);
        assert!((w[2] - 1.0).abs() < 1e-6, "periodic window, got {}", w[2]);

        // torch.hann_window(400, periodic=True)[1] = 0.0000616908
        let w400 = hann_window(400);
        assert!((w400[1] - 6.1690807e-05).abs() < 1e-8);
    }

    #[test]
    fn test_hz_mel_roundtrip() {
        for hz in [100.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz(hz_to_mel(hz));
            assert!((back - hz).abs() < hz * 0.01, "{} -> {}", hz, back);
        }
    }

    #[test]
    fn test_filterbank_shape_drops_nyquist_adjacent_bin() {
        let mel = extractor();
        assert_eq!(mel.mel_basis.len(), 128);
        assert_eq!(mel.mel_basis[0].len(), 200); // n_fft/2, not n_fft/2 + 1
    }

    #[test]
    fn test_num_frames_per_second() {
        let mel = extractor();
        let n = mel.num_frames(16000);
        assert!((99..=101).contains(&n), "expected ~100 frames, got {}", n);
    }

    #[test]
    fn test_silence_is_finite() {
        let mel = extractor();
        let features = mel
            .extract(&vec![0.0f32; 16000], MelLayout::MelMajor)
            .unwrap();
        assert!(features.data.iter().all(|v| v.is_finite()));
        // All-zero input hits the power floor everywhere: one constant value.
        let first = features.data[0];
        assert!(features.data.iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn test_deterministic() {
        let mel = extractor();
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let a = mel.extract(&samples, MelLayout::MelMajor).unwrap();
        let b = mel.extract(&samples, MelLayout::MelMajor).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_layouts_are_transposes() {
        let mel = extractor();
        let samples: Vec<f32> = (0..8000)
            .map(|i| (2.0 * PI * 220.0 * i as f32 / 16000.0).sin())
            .collect();
        let fm = mel.extract(&samples, MelLayout::FrameMajor).unwrap();
        let mm = mel.extract(&samples, MelLayout::MelMajor).unwrap();
        assert_eq!(fm.n_frames, mm.n_frames);
        for t in 0..fm.n_frames {
            for m in 0..fm.n_mels {
                assert_eq!(fm.data[t * fm.n_mels + m], mm.data[m * mm.n_frames + t]);
            }
        }
    }

    #[test]
    fn test_tone_has_energy_near_peak_bin() {
        let mel = extractor();
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let features = mel.extract(&samples, MelLayout::FrameMajor).unwrap();
        // Normalized values for a strong tone must exceed the silence floor.
        let max = features.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = features.data.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!(max > min + 0.5, "tone should span dynamic range");
    }

    #[test]
    fn test_rejects_sub_window_input() {
        let mel = extractor();
        assert!(mel.extract(&[0.0; 100], MelLayout::MelMajor).is_err());
    }
}
