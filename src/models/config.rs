//! Model configuration.
//!
//! Parsed once from the package's `config.json` and treated as the sole
//! source of truth for layer shapes; shapes are never re-derived from the
//! weights themselves. Unknown architectures and structurally impossible
//! configurations are `Configuration` errors before any tensor is read.

use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::models::layers::RopeStyle;

/// Which model family a package contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Conformer encoder + CTC greedy decode.
    ConformerCtc,
    /// Fixed-chunk encoder + autoregressive decoder.
    AudioLm,
    /// Streaming causal encoder + time-conditioned decoder.
    StreamingAudioLm,
}

impl Architecture {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "conformer-ctc" => Ok(Self::ConformerCtc),
            "audio-lm" => Ok(Self::AudioLm),
            "streaming-audio-lm" => Ok(Self::StreamingAudioLm),
            other => Err(EngineError::Configuration(format!(
                "unknown architecture {other:?}"
            ))),
        }
    }
}

/// Audio input specification.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Global log-mel maximum; `<= 0` uses the per-audio maximum.
    #[serde(default = "default_log_mel_max")]
    pub global_log_mel_max: f32,
    /// Fixed chunk length in seconds for fixed-length families.
    #[serde(default)]
    pub chunk_seconds: Option<f32>,
    /// Audio token rate after downsampling (streaming family).
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            n_mels: default_n_mels(),
            hop_length: default_hop_length(),
            window_size: default_window_size(),
            global_log_mel_max: default_log_mel_max(),
            chunk_seconds: None,
            frame_rate: default_frame_rate(),
        }
    }
}

impl AudioConfig {
    /// Samples in one fixed chunk.
    pub fn chunk_samples(&self) -> Option<usize> {
        self.chunk_seconds
            .map(|s| (s * self.sample_rate as f32) as usize)
    }

    /// Audio samples per decoder token (streaming family).
    pub fn samples_per_token(&self) -> usize {
        (self.sample_rate as f32 / self.frame_rate) as usize
    }
}

/// Encoder section, shared by all families.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    #[serde(default)]
    pub n_kv_heads: Option<usize>,
    pub head_dim: usize,
    pub hidden_dim: usize,
    /// Sliding attention window; `None` = full attention.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default = "default_true")]
    pub causal: bool,
    #[serde(default = "default_true")]
    pub use_biases: bool,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rope_style")]
    pub rope_style: String,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Maximum mel frames per forward pass; `None` = unbounded.
    #[serde(default)]
    pub max_source_positions: Option<usize>,
    /// Temporal downsampling of the conv front-end.
    #[serde(default = "default_downsample")]
    pub downsample_factor: usize,
    /// Conformer: depthwise conv kernel (odd).
    #[serde(default = "default_conv_kernel")]
    pub conv_kernel_size: usize,
    /// Conformer: positional conv embedding kernel / groups.
    #[serde(default = "default_pos_conv_kernel")]
    pub pos_conv_kernel: usize,
    #[serde(default = "default_pos_conv_groups")]
    pub pos_conv_groups: usize,
    /// Conformer: feed-forward residual weight. Architecture-critical;
    /// 0.5 for the half-step conformer feed-forwards.
    #[serde(default = "default_ff_residual_weight")]
    pub ff_residual_weight: f32,
}

impl EncoderConfig {
    pub fn rope_style(&self) -> Result<RopeStyle> {
        parse_rope_style(&self.rope_style)
    }
}

/// Decoder section for the LM families.
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default = "default_false")]
    pub use_biases: bool,
    #[serde(default = "default_true")]
    pub tied_embeddings: bool,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rope_style")]
    pub rope_style: String,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Adaptive-norm conditioning dimension; 0 disables it.
    #[serde(default)]
    pub t_cond_dim: usize,
    // Control-token IDs live in the reserved special range.
    #[serde(default = "default_bos_id")]
    pub bos_id: u32,
    #[serde(default = "default_eos_id")]
    pub eos_id: u32,
    #[serde(default)]
    pub audio_token_id: u32,
    /// Streaming family: pad/word control tokens and decode delay.
    #[serde(default)]
    pub streaming_pad_id: u32,
    #[serde(default)]
    pub delay_tokens: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

impl DecoderConfig {
    pub fn rope_style(&self) -> Result<RopeStyle> {
        parse_rope_style(&self.rope_style)
    }

    /// Queries per KV head.
    pub fn gqa_groups(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// CTC head section.
#[derive(Debug, Clone, Deserialize)]
pub struct CtcConfig {
    pub vocab_size: usize,
    /// Blank label; by convention the extra class past the vocabulary.
    #[serde(default)]
    pub blank_id: Option<u32>,
}

impl CtcConfig {
    pub fn blank(&self) -> u32 {
        self.blank_id.unwrap_or(self.vocab_size as u32)
    }

    /// Output classes including the blank.
    pub fn n_classes(&self) -> usize {
        self.vocab_size + 1
    }
}

/// Post-hoc quantization request.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    pub group_size: usize,
    #[serde(default = "default_quant_bits")]
    pub bits: u8,
}

/// Streaming padding/decode parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_left_pad_tokens")]
    pub left_pad_tokens: usize,
    #[serde(default = "default_right_pad_tokens")]
    pub right_pad_tokens: usize,
    /// Rotating decoder-cache capacity in tokens.
    #[serde(default = "default_decoder_window")]
    pub decoder_cache_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            left_pad_tokens: default_left_pad_tokens(),
            right_pad_tokens: default_right_pad_tokens(),
            decoder_cache_capacity: default_decoder_window(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelConfigJson {
    architecture: String,
    #[serde(default)]
    audio: AudioConfig,
    encoder: EncoderConfig,
    #[serde(default)]
    decoder: Option<DecoderConfig>,
    #[serde(default)]
    ctc: Option<CtcConfig>,
    #[serde(default)]
    quantization: Option<QuantizationConfig>,
    #[serde(default)]
    streaming: Option<StreamingConfig>,
}

/// Complete, validated model configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub audio: AudioConfig,
    pub encoder: EncoderConfig,
    pub decoder: Option<DecoderConfig>,
    pub ctc: Option<CtcConfig>,
    pub quantization: Option<QuantizationConfig>,
    pub streaming: StreamingConfig,
}

impl ModelConfig {
    /// Parse and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: ModelConfigJson = serde_json::from_str(json)
            .map_err(|e| EngineError::Configuration(format!("failed to parse config: {e}")))?;

        let config = Self {
            architecture: Architecture::parse(&parsed.architecture)?,
            audio: parsed.audio,
            encoder: parsed.encoder,
            decoder: parsed.decoder,
            ctc: parsed.ctc,
            quantization: parsed.quantization,
            streaming: parsed.streaming.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_json(&content)
    }

    /// Load from a model directory (looks for `config.json`).
    pub fn from_model_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_file(dir.as_ref().join("config.json"))
    }

    /// Decoder section, or a `Configuration` error for families without one.
    pub fn decoder(&self) -> Result<&DecoderConfig> {
        self.decoder.as_ref().ok_or_else(|| {
            EngineError::Configuration("decoder section required for this architecture".into())
        })
    }

    /// CTC section, or a `Configuration` error.
    pub fn ctc(&self) -> Result<&CtcConfig> {
        self.ctc.as_ref().ok_or_else(|| {
            EngineError::Configuration("ctc section required for conformer-ctc".into())
        })
    }

    /// Derived adapter input width: encoder dim times the frame-concat
    /// factor that aligns encoder frames to decoder tokens.
    pub fn adapter_input_dim(&self) -> usize {
        self.encoder.dim * self.encoder.downsample_factor
    }

    fn validate(&self) -> Result<()> {
        let enc = &self.encoder;
        if enc.n_heads * enc.head_dim == 0 {
            return Err(EngineError::Configuration(
                "encoder heads and head_dim must be positive".into(),
            ));
        }
        if let Some(kv) = enc.n_kv_heads {
            if kv == 0 || enc.n_heads % kv != 0 {
                return Err(EngineError::Configuration(format!(
                    "encoder n_heads {} not divisible by n_kv_heads {kv}",
                    enc.n_heads
                )));
            }
        }
        if enc.conv_kernel_size % 2 == 0 {
            return Err(EngineError::Configuration(format!(
                "conformer conv kernel must be odd, got {}",
                enc.conv_kernel_size
            )));
        }
        enc.rope_style()?;

        match self.architecture {
            Architecture::ConformerCtc => {
                self.ctc()?;
                if self.audio.chunk_seconds.is_none() {
                    return Err(EngineError::Configuration(
                        "conformer-ctc requires audio.chunk_seconds".into(),
                    ));
                }
            }
            Architecture::AudioLm => {
                let dec = self.decoder()?;
                self.validate_decoder(dec)?;
                if self.audio.chunk_seconds.is_none() {
                    return Err(EngineError::Configuration(
                        "audio-lm requires audio.chunk_seconds".into(),
                    ));
                }
            }
            Architecture::StreamingAudioLm => {
                let dec = self.decoder()?;
                self.validate_decoder(dec)?;
                if dec.t_cond_dim == 0 {
                    return Err(EngineError::Configuration(
                        "streaming-audio-lm requires decoder.t_cond_dim > 0".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_decoder(&self, dec: &DecoderConfig) -> Result<()> {
        if dec.n_kv_heads == 0 || dec.n_heads % dec.n_kv_heads != 0 {
            return Err(EngineError::Configuration(format!(
                "decoder n_heads {} not divisible by n_kv_heads {}",
                dec.n_heads, dec.n_kv_heads
            )));
        }
        dec.rope_style()?;
        Ok(())
    }
}

fn parse_rope_style(s: &str) -> Result<RopeStyle> {
    match s {
        "interleaved" => Ok(RopeStyle::Interleaved),
        "half" => Ok(RopeStyle::Half),
        other => Err(EngineError::Configuration(format!(
            "unknown rope_style {other:?} (expected \"interleaved\" or \"half\")"
        ))),
    }
}

// Serde defaults

fn default_sample_rate() -> u32 {
    16000
}
fn default_n_mels() -> usize {
    128
}
fn default_hop_length() -> usize {
    160
}
fn default_window_size() -> usize {
    400
}
fn default_log_mel_max() -> f32 {
    1.5
}
fn default_frame_rate() -> f32 {
    12.5
}
fn default_rope_theta() -> f64 {
    1_000_000.0
}
fn default_rope_style() -> String {
    "interleaved".to_string()
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_max_seq_len() -> usize {
    8192
}
fn default_downsample() -> usize {
    4
}
fn default_conv_kernel() -> usize {
    9
}
fn default_pos_conv_kernel() -> usize {
    128
}
fn default_pos_conv_groups() -> usize {
    16
}
fn default_ff_residual_weight() -> f32 {
    0.5
}
fn default_bos_id() -> u32 {
    1
}
fn default_eos_id() -> u32 {
    2
}
fn default_max_new_tokens() -> usize {
    1024
}
fn default_quant_bits() -> u8 {
    8
}
fn default_left_pad_tokens() -> usize {
    32
}
fn default_right_pad_tokens() -> usize {
    17
}
fn default_decoder_window() -> usize {
    8192
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_streaming_config() {
        let config = ModelConfig::from_json(test_configs::streaming_json()).unwrap();
        assert_eq!(config.architecture, Architecture::StreamingAudioLm);
        assert_eq!(config.encoder.dim, 32);
        let dec = config.decoder().unwrap();
        assert_eq!(dec.gqa_groups(), 2);
        assert_eq!(config.streaming.decoder_cache_capacity, 8);
        assert_eq!(config.adapter_input_dim(), 128);
    }

    #[test]
    fn test_parse_ctc_config() {
        let config = ModelConfig::from_json(test_configs::ctc_json()).unwrap();
        assert_eq!(config.architecture, Architecture::ConformerCtc);
        let ctc = config.ctc().unwrap();
        assert_eq!(ctc.blank(), 290);
        assert_eq!(ctc.n_classes(), 291);
        assert_eq!(config.audio.chunk_samples(), Some(32000));
    }

    #[test]
    fn test_unknown_architecture_rejected() {
        let err = ModelConfig::from_json(r#"{"architecture": "rnnt", "encoder": {}}"#).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_streaming_requires_t_cond() {
        let json = test_configs::streaming_json().replace(r#""t_cond_dim": 4,"#, r#""t_cond_dim": 0,"#);
        let err = ModelConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("t_cond_dim"));
    }

    #[test]
    fn test_gqa_divisibility_checked() {
        let json = test_configs::streaming_json().replace(r#""n_kv_heads": 1,"#, r#""n_kv_heads": 3,"#);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_even_conformer_kernel_rejected() {
        let json = test_configs::ctc_json().replace(r#""conv_kernel_size": 3,"#, r#""conv_kernel_size": 4,"#);
        assert!(ModelConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_defaults_fill_in() {
        let config = ModelConfig::from_json(test_configs::ctc_json()).unwrap();
        assert_eq!(config.encoder.rope_theta, 1_000_000.0);
        assert!((config.encoder.ff_residual_weight - 0.5).abs() < 1e-6);
        assert_eq!(config.streaming.left_pad_tokens, 32);
    }
}
