//! Composable sequence-model building blocks.
//!
//! Shared across the three model families; value-like layers assembled by
//! the variant constructors, not a class hierarchy.

pub mod attention;
pub mod conv;
pub mod decoder_layer;
pub mod encoder_layer;
pub mod feed_forward;
pub mod kv_cache;
pub mod masking;
pub mod rms_norm;
pub mod rope;

pub use attention::{Attention, AttentionConfig, ScalePlacement};
pub use conv::{
    CausalConvModule, CausalConvModuleConfig, ConvDownsampler, ConvDownsamplerConfig,
    PositionalConvConfig, PositionalConvEmbedding,
};
pub use decoder_layer::{DecoderLayer, DecoderLayerConfig};
pub use encoder_layer::{EncoderLayer, EncoderLayerConfig};
pub use feed_forward::{Mlp, MlpConfig, SwiGlu, SwiGluConfig};
pub use kv_cache::{KvCache, LayerCaches};
pub use rms_norm::{AdaRmsNorm, AdaRmsNormConfig, RmsNorm, RmsNormConfig};
pub use rope::{Rope, RopeConfig, RopeStyle};
