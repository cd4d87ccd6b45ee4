//! Model variant assembly.
//!
//! One capability surface over the three families, selected by parsed
//! configuration. Each variant declares the exact parameter set it
//! consumes (name + shape), which drives both strict load verification
//! and synthetic fixtures in tests.

use burn::nn::{Linear, PaddingConfig1d};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use tracing::info;

use crate::audio::mel::{MelFeatures, MelLayout};
use crate::error::{EngineError, Result};
use crate::models::adapter::{reshape_encoder_output, AudioAdapter};
use crate::models::config::{Architecture, DecoderConfig, EncoderConfig, ModelConfig};
use crate::models::conformer::{ConformerBlock, ConformerEncoder};
use crate::models::decoder::LanguageDecoder;
use crate::models::encoder::AudioEncoder;
use crate::models::layers::{
    Attention, CausalConvModule, ConvDownsampler, DecoderLayer, EncoderLayer, Mlp,
    PositionalConvEmbedding, RmsNorm, RopeConfig, ScalePlacement, SwiGlu,
};
use crate::models::time_embedding::TimeEmbedding;
use crate::weights::{conv1d_from_raw, linear_from_raw, take, to_tensor1, to_tensor2, TensorMap};

/// A loaded model, ready for inference. Immutable after construction and
/// safe to share across concurrent sessions.
pub enum SpeechModel<B: Backend> {
    Ctc(CtcModel<B>),
    Chunked(ChunkedModel<B>),
    Streaming(StreamingModel<B>),
}

impl<B: Backend> SpeechModel<B> {
    /// Populate the module tree from sanitized tensors.
    ///
    /// Callers must run [`crate::weights::sanitize::verify`] first; this
    /// constructor assumes an exact tensor set.
    pub fn from_tensors(
        config: &ModelConfig,
        tensors: &mut TensorMap,
        device: &B::Device,
    ) -> Result<Self> {
        let model = match config.architecture {
            Architecture::ConformerCtc => Self::Ctc(CtcModel::from_tensors(config, tensors, device)?),
            Architecture::AudioLm => {
                Self::Chunked(ChunkedModel::from_tensors(config, tensors, device)?)
            }
            Architecture::StreamingAudioLm => {
                Self::Streaming(StreamingModel::from_tensors(config, tensors, device)?)
            }
        };
        info!(architecture = ?config.architecture, "model populated");
        Ok(model)
    }

    /// Every parameter this configuration's module tree expects:
    /// `(sanitized name, shape)`.
    pub fn expected_parameters(config: &ModelConfig) -> Result<Vec<(String, Vec<usize>)>> {
        match config.architecture {
            Architecture::ConformerCtc => conformer_parameters(config),
            Architecture::AudioLm | Architecture::StreamingAudioLm => {
                let mut params = encoder_parameters(&config.encoder, config.audio.n_mels);
                params.extend(adapter_parameters(config)?);
                params.extend(decoder_parameters(config.decoder()?));
                Ok(params)
            }
        }
    }
}

/// Lift mel-major features into a `[1, n_mels, frames]` device tensor.
pub fn mel_to_tensor<B: Backend>(
    features: &MelFeatures,
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    if features.layout != MelLayout::MelMajor {
        return Err(EngineError::Inference(
            "model input requires mel-major features".into(),
        ));
    }
    Ok(Tensor::from_data(
        TensorData::new(
            features.data.clone(),
            [1, features.n_mels, features.n_frames],
        ),
        device,
    ))
}

// ---------------------------------------------------------------------------
// CTC family
// ---------------------------------------------------------------------------

/// Conformer encoder + CTC greedy decode.
pub struct CtcModel<B: Backend> {
    pub encoder: ConformerEncoder<B>,
    pub blank_id: u32,
}

impl<B: Backend> CtcModel<B> {
    fn from_tensors(config: &ModelConfig, map: &mut TensorMap, device: &B::Device) -> Result<Self> {
        let enc = &config.encoder;
        let ctc = config.ctc()?;

        let subsample = load_downsampler(map, "encoder.subsample", device)?;

        let pos_conv_name = "encoder.pos_conv.conv";
        let pos_conv = conv1d_from_raw(
            take(map, &format!("{pos_conv_name}.weight"))?,
            Some(take(map, &format!("{pos_conv_name}.bias"))?),
            1,
            enc.pos_conv_groups,
            PaddingConfig1d::Explicit(enc.pos_conv_kernel / 2),
            pos_conv_name,
            device,
        )?;
        let pos_conv = PositionalConvEmbedding::new(pos_conv, enc.pos_conv_kernel);

        let rope = RopeConfig::new(enc.head_dim, enc.max_seq_len, enc.rope_style()?)
            .with_theta(enc.rope_theta)
            .init(device);

        let mut blocks = Vec::with_capacity(enc.n_layers);
        for i in 0..enc.n_layers {
            blocks.push(load_conformer_block(enc, map, i, device)?);
        }

        let ctc_head = load_linear(map, "encoder.ctc_head", true, device)?;

        Ok(Self {
            encoder: ConformerEncoder::new(subsample, pos_conv, rope, blocks, ctc_head),
            blank_id: ctc.blank(),
        })
    }

    /// Greedy per-frame labels for one utterance.
    pub fn frame_labels(&self, mel: Tensor<B, 3>) -> Result<Vec<u32>> {
        self.encoder.greedy_labels(mel)
    }
}

// ---------------------------------------------------------------------------
// Chunked family
// ---------------------------------------------------------------------------

/// Fixed-chunk encoder + autoregressive decoder.
pub struct ChunkedModel<B: Backend> {
    encoder: AudioEncoder<B>,
    adapter: AudioAdapter<B>,
    pub decoder: LanguageDecoder<B>,
    reshape_factor: usize,
    pub bos_id: u32,
    pub eos_id: u32,
    pub audio_token_id: u32,
    pub max_new_tokens: usize,
}

impl<B: Backend> ChunkedModel<B> {
    fn from_tensors(config: &ModelConfig, map: &mut TensorMap, device: &B::Device) -> Result<Self> {
        let dec = config.decoder()?;
        let encoder = load_audio_encoder(config, map, device)?;
        let adapter = load_adapter(map, device)?;
        let decoder = load_decoder(dec, map, device)?;

        Ok(Self {
            encoder,
            adapter,
            decoder,
            reshape_factor: config.encoder.downsample_factor,
            bos_id: dec.bos_id,
            eos_id: dec.eos_id,
            audio_token_id: dec.audio_token_id,
            max_new_tokens: dec.max_new_tokens,
        })
    }

    /// Encode a mel chunk into decoder-space audio embeddings.
    pub fn encode_audio(&self, mel: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.encoder.forward(mel, 0);
        let reshaped = reshape_encoder_output(hidden, self.reshape_factor);
        self.adapter.forward(reshaped)
    }

    /// Build prompt embeddings: `[BOS, AUDIO x n]` token embeddings with
    /// the projected audio summed onto the audio placeholder positions.
    pub fn prompt_embeddings(&self, mel: Tensor<B, 3>) -> Tensor<B, 3> {
        let audio = self.encode_audio(mel);
        let n_audio = audio.dims()[1];
        let d = self.decoder.d_model();
        let device = audio.device();

        let mut prompt: Vec<i32> = Vec::with_capacity(n_audio + 1);
        prompt.push(self.bos_id as i32);
        prompt.extend(std::iter::repeat_n(self.audio_token_id as i32, n_audio));

        let ids = Tensor::<B, 2, Int>::from_data(
            TensorData::new(prompt, [1, n_audio + 1]),
            &device,
        );
        let text = self.decoder.embed_tokens(ids);

        let head = text.clone().slice([0..1, 0..1, 0..d]);
        let fused = text.slice([0..1, 1..n_audio + 1, 0..d]) + audio;
        Tensor::cat(vec![head, fused], 1)
    }

    /// Embedding for one generated token.
    pub fn token_embedding(&self, token: u32, device: &B::Device) -> Tensor<B, 3> {
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![token as i32], [1, 1]), device);
        self.decoder.embed_tokens(ids)
    }
}

// ---------------------------------------------------------------------------
// Streaming family
// ---------------------------------------------------------------------------

/// Streaming causal encoder + time-conditioned decoder.
pub struct StreamingModel<B: Backend> {
    encoder: AudioEncoder<B>,
    adapter: AudioAdapter<B>,
    pub decoder: LanguageDecoder<B>,
    time_embedding: TimeEmbedding,
    reshape_factor: usize,
    pub bos_id: u32,
    pub eos_id: u32,
    pub streaming_pad_id: u32,
    pub delay_tokens: usize,
    pub left_pad_tokens: usize,
    pub cache_capacity: usize,
}

impl<B: Backend> StreamingModel<B> {
    fn from_tensors(config: &ModelConfig, map: &mut TensorMap, device: &B::Device) -> Result<Self> {
        let dec = config.decoder()?;
        let encoder = load_audio_encoder(config, map, device)?;
        let adapter = load_adapter(map, device)?;
        let decoder = load_decoder(dec, map, device)?;

        Ok(Self {
            encoder,
            adapter,
            decoder,
            time_embedding: TimeEmbedding::new(dec.dim),
            reshape_factor: config.encoder.downsample_factor,
            bos_id: dec.bos_id,
            eos_id: dec.eos_id,
            streaming_pad_id: dec.streaming_pad_id,
            delay_tokens: dec.delay_tokens,
            left_pad_tokens: config.streaming.left_pad_tokens,
            cache_capacity: config.streaming.decoder_cache_capacity,
        })
    }

    /// Encode the padded waveform's mel into per-token audio embeddings.
    pub fn audio_embeddings(&self, mel: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.encoder.forward(mel, 0);
        let reshaped = reshape_encoder_output(hidden, self.reshape_factor);
        self.adapter.forward(reshaped)
    }

    /// Conditioning embedding for the configured transcription delay.
    pub fn t_embed(&self, device: &B::Device) -> Tensor<B, 3> {
        self.time_embedding.embed(self.delay_tokens as f32, device)
    }

    /// Decoder prefix: BOS followed by streaming-pad tokens covering the
    /// left padding plus the delay.
    pub fn prefix_tokens(&self) -> Vec<u32> {
        let len = self.prefix_len();
        let mut prefix = Vec::with_capacity(len);
        prefix.push(self.bos_id);
        prefix.extend(std::iter::repeat_n(self.streaming_pad_id, len - 1));
        prefix
    }

    pub fn prefix_len(&self) -> usize {
        self.left_pad_tokens + self.delay_tokens
    }

    /// Embedding for one generated token.
    pub fn token_embedding(&self, token: u32, device: &B::Device) -> Tensor<B, 3> {
        let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![token as i32], [1, 1]), device);
        self.decoder.embed_tokens(ids)
    }
}

// ---------------------------------------------------------------------------
// Shared loaders
// ---------------------------------------------------------------------------

fn load_linear<B: Backend>(
    map: &mut TensorMap,
    name: &str,
    with_bias: bool,
    device: &B::Device,
) -> Result<Linear<B>> {
    let weight = take(map, &format!("{name}.weight"))?;
    let bias = if with_bias {
        Some(take(map, &format!("{name}.bias"))?)
    } else {
        None
    };
    linear_from_raw(weight, bias, name, device)
}

fn load_norm<B: Backend>(
    map: &mut TensorMap,
    name: &str,
    eps: f64,
    device: &B::Device,
) -> Result<RmsNorm<B>> {
    let gamma = to_tensor1::<B>(take(map, name)?, name, device)?;
    Ok(RmsNorm::from_weight(gamma, eps))
}

fn load_downsampler<B: Backend>(
    map: &mut TensorMap,
    prefix: &str,
    device: &B::Device,
) -> Result<ConvDownsampler<B>> {
    let conv1 = conv1d_from_raw(
        take(map, &format!("{prefix}.conv1.weight"))?,
        Some(take(map, &format!("{prefix}.conv1.bias"))?),
        2,
        1,
        PaddingConfig1d::Explicit(1),
        prefix,
        device,
    )?;
    let conv2 = conv1d_from_raw(
        take(map, &format!("{prefix}.conv2.weight"))?,
        Some(take(map, &format!("{prefix}.conv2.bias"))?),
        2,
        1,
        PaddingConfig1d::Explicit(1),
        prefix,
        device,
    )?;
    Ok(ConvDownsampler::new(conv1, conv2))
}

fn load_audio_encoder<B: Backend>(
    config: &ModelConfig,
    map: &mut TensorMap,
    device: &B::Device,
) -> Result<AudioEncoder<B>> {
    let enc = &config.encoder;
    let conv = load_downsampler(map, "encoder", device)?;

    let rope = RopeConfig::new(enc.head_dim, enc.max_seq_len, enc.rope_style()?)
        .with_theta(enc.rope_theta)
        .init(device);

    let mut layers = Vec::with_capacity(enc.n_layers);
    for i in 0..enc.n_layers {
        let prefix = format!("encoder.layers.{i}");
        let attention_norm = load_norm(
            map,
            &format!("{prefix}.attention_norm.weight"),
            enc.norm_eps,
            device,
        )?;

        // K carries no bias in the reference encoder checkpoints; the rest
        // follow the config flag.
        let wq = load_linear(map, &format!("{prefix}.attention.wq"), enc.use_biases, device)?;
        let wk = load_linear(map, &format!("{prefix}.attention.wk"), false, device)?;
        let wv = load_linear(map, &format!("{prefix}.attention.wv"), enc.use_biases, device)?;
        let wo = load_linear(map, &format!("{prefix}.attention.wo"), enc.use_biases, device)?;
        let attention = Attention::new(
            wq,
            wk,
            wv,
            wo,
            enc.n_heads,
            enc.n_kv_heads.unwrap_or(enc.n_heads),
            enc.head_dim,
            enc.sliding_window,
            ScalePlacement::Scores,
        );

        let ffn_norm = load_norm(map, &format!("{prefix}.ffn_norm.weight"), enc.norm_eps, device)?;
        let w1 = load_linear(map, &format!("{prefix}.feed_forward.w1"), false, device)?;
        let w2 = load_linear(map, &format!("{prefix}.feed_forward.w2"), enc.use_biases, device)?;
        let w3 = load_linear(map, &format!("{prefix}.feed_forward.w3"), false, device)?;

        layers.push(EncoderLayer::new(
            attention_norm,
            attention,
            ffn_norm,
            SwiGlu::new(w1, w2, w3),
        ));
    }

    let norm = load_norm(map, "encoder.norm.weight", enc.norm_eps, device)?;
    Ok(AudioEncoder::new(conv, rope, layers, norm, enc.causal))
}

fn load_adapter<B: Backend>(map: &mut TensorMap, device: &B::Device) -> Result<AudioAdapter<B>> {
    let linear1 = load_linear(map, "adapter.linear1", false, device)?;
    let linear2 = load_linear(map, "adapter.linear2", false, device)?;
    Ok(AudioAdapter::new(linear1, linear2))
}

fn load_decoder<B: Backend>(
    dec: &DecoderConfig,
    map: &mut TensorMap,
    device: &B::Device,
) -> Result<LanguageDecoder<B>> {
    let tok_name = "decoder.tok_embeddings.weight";
    let tok = to_tensor2::<B>(take(map, tok_name)?, tok_name, device)?;

    let rope = RopeConfig::new(dec.head_dim, dec.max_seq_len, dec.rope_style()?)
        .with_theta(dec.rope_theta)
        .init(device);

    let mut layers = Vec::with_capacity(dec.n_layers);
    for i in 0..dec.n_layers {
        let prefix = format!("decoder.layers.{i}");

        let ada = if dec.t_cond_dim > 0 {
            let down = load_linear(map, &format!("{prefix}.ada_norm.down"), false, device)?;
            let up = load_linear(map, &format!("{prefix}.ada_norm.up"), false, device)?;
            Some(crate::models::layers::AdaRmsNorm::new(down, up))
        } else {
            None
        };

        let attention_norm = load_norm(
            map,
            &format!("{prefix}.attention_norm.weight"),
            dec.norm_eps,
            device,
        )?;
        let wq = load_linear(map, &format!("{prefix}.attention.wq"), dec.use_biases, device)?;
        let wk = load_linear(map, &format!("{prefix}.attention.wk"), dec.use_biases, device)?;
        let wv = load_linear(map, &format!("{prefix}.attention.wv"), dec.use_biases, device)?;
        let wo = load_linear(map, &format!("{prefix}.attention.wo"), dec.use_biases, device)?;
        let attention = Attention::new(
            wq,
            wk,
            wv,
            wo,
            dec.n_heads,
            dec.n_kv_heads,
            dec.head_dim,
            dec.sliding_window,
            ScalePlacement::Scores,
        );

        let ffn_norm = load_norm(map, &format!("{prefix}.ffn_norm.weight"), dec.norm_eps, device)?;
        let w1 = load_linear(map, &format!("{prefix}.feed_forward.w1"), dec.use_biases, device)?;
        let w2 = load_linear(map, &format!("{prefix}.feed_forward.w2"), dec.use_biases, device)?;
        let w3 = load_linear(map, &format!("{prefix}.feed_forward.w3"), dec.use_biases, device)?;

        layers.push(DecoderLayer::new(
            ada,
            attention_norm,
            attention,
            ffn_norm,
            SwiGlu::new(w1, w2, w3),
        ));
    }

    let norm = load_norm(map, "decoder.norm.weight", dec.norm_eps, device)?;
    Ok(LanguageDecoder::new(tok, rope, layers, norm))
}

fn load_conformer_block<B: Backend>(
    enc: &EncoderConfig,
    map: &mut TensorMap,
    index: usize,
    device: &B::Device,
) -> Result<ConformerBlock<B>> {
    let prefix = format!("encoder.blocks.{index}");
    let d = enc.dim;

    let norm_ff1 = load_norm(map, &format!("{prefix}.norm_ff1.weight"), enc.norm_eps, device)?;
    let ff1 = Mlp::new(
        load_linear(map, &format!("{prefix}.ff1.w1"), true, device)?,
        load_linear(map, &format!("{prefix}.ff1.w2"), true, device)?,
    );

    let norm_attn = load_norm(map, &format!("{prefix}.norm_attn.weight"), enc.norm_eps, device)?;
    let attention = Attention::new(
        load_linear(map, &format!("{prefix}.attention.wq"), true, device)?,
        load_linear(map, &format!("{prefix}.attention.wk"), true, device)?,
        load_linear(map, &format!("{prefix}.attention.wv"), true, device)?,
        load_linear(map, &format!("{prefix}.attention.wo"), true, device)?,
        enc.n_heads,
        enc.n_kv_heads.unwrap_or(enc.n_heads),
        enc.head_dim,
        None,
        ScalePlacement::Query,
    );

    let norm_conv = load_norm(map, &format!("{prefix}.norm_conv.weight"), enc.norm_eps, device)?;
    let pointwise1 = conv1d_from_raw(
        take(map, &format!("{prefix}.conv.pointwise1.weight"))?,
        Some(take(map, &format!("{prefix}.conv.pointwise1.bias"))?),
        1,
        1,
        PaddingConfig1d::Valid,
        &prefix,
        device,
    )?;
    let depthwise = conv1d_from_raw(
        take(map, &format!("{prefix}.conv.depthwise.weight"))?,
        Some(take(map, &format!("{prefix}.conv.depthwise.bias"))?),
        1,
        d,
        PaddingConfig1d::Valid,
        &prefix,
        device,
    )?;
    let conv_norm = load_norm(map, &format!("{prefix}.conv.norm.weight"), enc.norm_eps, device)?;
    let pointwise2 = conv1d_from_raw(
        take(map, &format!("{prefix}.conv.pointwise2.weight"))?,
        Some(take(map, &format!("{prefix}.conv.pointwise2.bias"))?),
        1,
        1,
        PaddingConfig1d::Valid,
        &prefix,
        device,
    )?;
    let conv = CausalConvModule::new(
        pointwise1,
        depthwise,
        conv_norm,
        pointwise2,
        d,
        enc.conv_kernel_size,
    );

    let norm_ff2 = load_norm(map, &format!("{prefix}.norm_ff2.weight"), enc.norm_eps, device)?;
    let ff2 = Mlp::new(
        load_linear(map, &format!("{prefix}.ff2.w1"), true, device)?,
        load_linear(map, &format!("{prefix}.ff2.w2"), true, device)?,
    );
    let norm_final = load_norm(map, &format!("{prefix}.norm_final.weight"), enc.norm_eps, device)?;

    Ok(ConformerBlock::new(
        norm_ff1,
        ff1,
        norm_attn,
        attention,
        norm_conv,
        conv,
        norm_ff2,
        ff2,
        norm_final,
        enc.ff_residual_weight,
    ))
}

// ---------------------------------------------------------------------------
// Expected parameter sets
// ---------------------------------------------------------------------------

fn push(params: &mut Vec<(String, Vec<usize>)>, name: String, shape: Vec<usize>) {
    params.push((name, shape));
}

fn encoder_parameters(enc: &EncoderConfig, n_mels: usize) -> Vec<(String, Vec<usize>)> {
    let mut p = Vec::new();
    let d = enc.dim;
    let qkv = enc.n_heads * enc.head_dim;
    let kv = enc.n_kv_heads.unwrap_or(enc.n_heads) * enc.head_dim;

    push(&mut p, "encoder.conv1.weight".into(), vec![d, n_mels, 3]);
    push(&mut p, "encoder.conv1.bias".into(), vec![d]);
    push(&mut p, "encoder.conv2.weight".into(), vec![d, d, 3]);
    push(&mut p, "encoder.conv2.bias".into(), vec![d]);

    for i in 0..enc.n_layers {
        let prefix = format!("encoder.layers.{i}");
        push(&mut p, format!("{prefix}.attention_norm.weight"), vec![d]);
        push(&mut p, format!("{prefix}.attention.wq.weight"), vec![qkv, d]);
        push(&mut p, format!("{prefix}.attention.wk.weight"), vec![kv, d]);
        push(&mut p, format!("{prefix}.attention.wv.weight"), vec![kv, d]);
        push(&mut p, format!("{prefix}.attention.wo.weight"), vec![d, qkv]);
        if enc.use_biases {
            push(&mut p, format!("{prefix}.attention.wq.bias"), vec![qkv]);
            push(&mut p, format!("{prefix}.attention.wv.bias"), vec![kv]);
            push(&mut p, format!("{prefix}.attention.wo.bias"), vec![d]);
        }
        push(&mut p, format!("{prefix}.ffn_norm.weight"), vec![d]);
        push(&mut p, format!("{prefix}.feed_forward.w1.weight"), vec![enc.hidden_dim, d]);
        push(&mut p, format!("{prefix}.feed_forward.w2.weight"), vec![d, enc.hidden_dim]);
        push(&mut p, format!("{prefix}.feed_forward.w3.weight"), vec![enc.hidden_dim, d]);
        if enc.use_biases {
            push(&mut p, format!("{prefix}.feed_forward.w2.bias"), vec![d]);
        }
    }
    push(&mut p, "encoder.norm.weight".into(), vec![d]);
    p
}

fn adapter_parameters(config: &ModelConfig) -> Result<Vec<(String, Vec<usize>)>> {
    let dec = config.decoder()?;
    let in_dim = config.adapter_input_dim();
    Ok(vec![
        ("adapter.linear1.weight".to_string(), vec![dec.dim, in_dim]),
        ("adapter.linear2.weight".to_string(), vec![dec.dim, dec.dim]),
    ])
}

fn decoder_parameters(dec: &DecoderConfig) -> Vec<(String, Vec<usize>)> {
    let mut p = Vec::new();
    let d = dec.dim;
    let qkv = dec.n_heads * dec.head_dim;
    let kv = dec.n_kv_heads * dec.head_dim;

    push(&mut p, "decoder.tok_embeddings.weight".into(), vec![dec.vocab_size, d]);
    for i in 0..dec.n_layers {
        let prefix = format!("decoder.layers.{i}");
        if dec.t_cond_dim > 0 {
            push(&mut p, format!("{prefix}.ada_norm.down.weight"), vec![dec.t_cond_dim, d]);
            push(&mut p, format!("{prefix}.ada_norm.up.weight"), vec![d, dec.t_cond_dim]);
        }
        push(&mut p, format!("{prefix}.attention_norm.weight"), vec![d]);
        push(&mut p, format!("{prefix}.attention.wq.weight"), vec![qkv, d]);
        push(&mut p, format!("{prefix}.attention.wk.weight"), vec![kv, d]);
        push(&mut p, format!("{prefix}.attention.wv.weight"), vec![kv, d]);
        push(&mut p, format!("{prefix}.attention.wo.weight"), vec![d, qkv]);
        push(&mut p, format!("{prefix}.ffn_norm.weight"), vec![d]);
        push(&mut p, format!("{prefix}.feed_forward.w1.weight"), vec![dec.hidden_dim, d]);
        push(&mut p, format!("{prefix}.feed_forward.w2.weight"), vec![d, dec.hidden_dim]);
        push(&mut p, format!("{prefix}.feed_forward.w3.weight"), vec![dec.hidden_dim, d]);
        if dec.use_biases {
            push(&mut p, format!("{prefix}.attention.wq.bias"), vec![qkv]);
            push(&mut p, format!("{prefix}.attention.wk.bias"), vec![kv]);
            push(&mut p, format!("{prefix}.attention.wv.bias"), vec![kv]);
            push(&mut p, format!("{prefix}.attention.wo.bias"), vec![d]);
        }
    }
    push(&mut p, "decoder.norm.weight".into(), vec![d]);
    p
}

fn conformer_parameters(config: &ModelConfig) -> Result<Vec<(String, Vec<usize>)>> {
    let enc = &config.encoder;
    let ctc = config.ctc()?;
    let d = enc.dim;
    let qkv = enc.n_heads * enc.head_dim;
    let mut p = Vec::new();

    push(&mut p, "encoder.subsample.conv1.weight".into(), vec![d, config.audio.n_mels, 3]);
    push(&mut p, "encoder.subsample.conv1.bias".into(), vec![d]);
    push(&mut p, "encoder.subsample.conv2.weight".into(), vec![d, d, 3]);
    push(&mut p, "encoder.subsample.conv2.bias".into(), vec![d]);

    push(
        &mut p,
        "encoder.pos_conv.conv.weight".into(),
        vec![d, d / enc.pos_conv_groups, enc.pos_conv_kernel],
    );
    push(&mut p, "encoder.pos_conv.conv.bias".into(), vec![d]);

    for i in 0..enc.n_layers {
        let prefix = format!("encoder.blocks.{i}");
        push(&mut p, format!("{prefix}.norm_ff1.weight"), vec![d]);
        push(&mut p, format!("{prefix}.ff1.w1.weight"), vec![enc.hidden_dim, d]);
        push(&mut p, format!("{prefix}.ff1.w1.bias"), vec![enc.hidden_dim]);
        push(&mut p, format!("{prefix}.ff1.w2.weight"), vec![d, enc.hidden_dim]);
        push(&mut p, format!("{prefix}.ff1.w2.bias"), vec![d]);

        push(&mut p, format!("{prefix}.norm_attn.weight"), vec![d]);
        for name in ["wq", "wk", "wv"] {
            push(&mut p, format!("{prefix}.attention.{name}.weight"), vec![qkv, d]);
            push(&mut p, format!("{prefix}.attention.{name}.bias"), vec![qkv]);
        }
        push(&mut p, format!("{prefix}.attention.wo.weight"), vec![d, qkv]);
        push(&mut p, format!("{prefix}.attention.wo.bias"), vec![d]);

        push(&mut p, format!("{prefix}.norm_conv.weight"), vec![d]);
        push(&mut p, format!("{prefix}.conv.pointwise1.weight"), vec![2 * d, d, 1]);
        push(&mut p, format!("{prefix}.conv.pointwise1.bias"), vec![2 * d]);
        push(&mut p, format!("{prefix}.conv.depthwise.weight"), vec![d, 1, enc.conv_kernel_size]);
        push(&mut p, format!("{prefix}.conv.depthwise.bias"), vec![d]);
        push(&mut p, format!("{prefix}.conv.norm.weight"), vec![d]);
        push(&mut p, format!("{prefix}.conv.pointwise2.weight"), vec![d, d, 1]);
        push(&mut p, format!("{prefix}.conv.pointwise2.bias"), vec![d]);

        push(&mut p, format!("{prefix}.norm_ff2.weight"), vec![d]);
        push(&mut p, format!("{prefix}.ff2.w1.weight"), vec![enc.hidden_dim, d]);
        push(&mut p, format!("{prefix}.ff2.w1.bias"), vec![enc.hidden_dim]);
        push(&mut p, format!("{prefix}.ff2.w2.weight"), vec![d, enc.hidden_dim]);
        push(&mut p, format!("{prefix}.ff2.w2.bias"), vec![d]);

        push(&mut p, format!("{prefix}.norm_final.weight"), vec![d]);
    }

    push(&mut p, "encoder.ctc_head.weight".into(), vec![ctc.n_classes(), d]);
    push(&mut p, "encoder.ctc_head.bias".into(), vec![ctc.n_classes()]);
    Ok(p)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::weights::RawTensor;

    /// Build a deterministic tensor map matching a config's parameter set.
    pub fn synthetic_tensors(config: &ModelConfig) -> TensorMap {
        let params = SpeechModel::<burn::backend::NdArray>::expected_parameters(config).unwrap();
        params
            .into_iter()
            .map(|(name, shape)| {
                let numel: usize = shape.iter().product();
                let data: Vec<f32> = (0..numel)
                    .map(|i| ((i % 13) as f32 - 6.0) * 0.015)
                    .collect();
                (name, RawTensor::new(shape, data))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::test_configs;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_ctc_model_loads_and_runs() {
        let config = ModelConfig::from_json(test_configs::ctc_json()).unwrap();
        let mut tensors = test_fixtures::synthetic_tensors(&config);
        let device = Default::default();

        let model = SpeechModel::<TestBackend>::from_tensors(&config, &mut tensors, &device).unwrap();
        assert!(tensors.is_empty(), "loader must consume every tensor");

        let SpeechModel::Ctc(ctc) = model else {
            panic!("expected CTC variant")
        };
        let mel = Tensor::<TestBackend, 3>::zeros([1, 16, 40], &device);
        let labels = ctc.frame_labels(mel).unwrap();
        assert_eq!(labels.len(), 10);
    }

    #[test]
    fn test_chunked_model_prompt_embeddings() {
        let config = ModelConfig::from_json(test_configs::audio_lm_json()).unwrap();
        let mut tensors = test_fixtures::synthetic_tensors(&config);
        let device = Default::default();

        let model = SpeechModel::<TestBackend>::from_tensors(&config, &mut tensors, &device).unwrap();
        assert!(tensors.is_empty());

        let SpeechModel::Chunked(chunked) = model else {
            panic!("expected chunked variant")
        };
        // 40 mel frames -> 10 encoder frames -> 2 decoder tokens (factor 4)
        let mel = Tensor::<TestBackend, 3>::zeros([1, 16, 40], &device);
        let prompt = chunked.prompt_embeddings(mel);
        assert_eq!(prompt.dims(), [1, 3, 16]);
    }

    #[test]
    fn test_streaming_model_prefix_and_embeddings() {
        let config = ModelConfig::from_json(test_configs::streaming_json()).unwrap();
        let mut tensors = test_fixtures::synthetic_tensors(&config);
        let device = Default::default();

        let model = SpeechModel::<TestBackend>::from_tensors(&config, &mut tensors, &device).unwrap();
        assert!(tensors.is_empty());

        let SpeechModel::Streaming(streaming) = model else {
            panic!("expected streaming variant")
        };
        assert_eq!(streaming.prefix_len(), 6);
        let prefix = streaming.prefix_tokens();
        assert_eq!(prefix.len(), 6);
        assert_eq!(prefix[0], streaming.bos_id);
        assert!(prefix[1..].iter().all(|&t| t == streaming.streaming_pad_id));

        let mel = Tensor::<TestBackend, 3>::zeros([1, 16, 64], &device);
        let audio = streaming.audio_embeddings(mel);
        // 64 mel frames -> 16 encoder frames -> 4 decoder tokens
        assert_eq!(audio.dims(), [1, 4, 16]);
    }

    #[test]
    fn test_missing_tensor_is_weight_mismatch() {
        let config = ModelConfig::from_json(test_configs::streaming_json()).unwrap();
        let mut tensors = test_fixtures::synthetic_tensors(&config);
        tensors.remove("decoder.norm.weight");
        let device: <TestBackend as burn::tensor::backend::Backend>::Device = Default::default();

        let err = SpeechModel::<TestBackend>::from_tensors(&config, &mut tensors, &device).unwrap_err();
        assert!(matches!(err, EngineError::WeightMismatch(_)));
    }

    #[test]
    fn test_mel_to_tensor_requires_mel_major() {
        let features = MelFeatures {
            data: vec![0.0; 8],
            n_mels: 2,
            n_frames: 4,
            layout: MelLayout::FrameMajor,
        };
        let device: <TestBackend as burn::tensor::backend::Backend>::Device = Default::default();
        assert!(mel_to_tensor::<TestBackend>(&features, &device).is_err());
    }
}
