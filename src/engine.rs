//! Engine facade.
//!
//! Loads a resolved model package (config + tokenizer + tensor shards)
//! once, then serves any number of concurrent transcription sessions over
//! the immutable module tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::info;

use crate::audio::mel::{MelConfig, MelExtractor, MelLayout};
use crate::audio::pad::{pad_fixed_length, pad_streaming, StreamPadConfig};
use crate::audio::AudioBuffer;
use crate::error::{EngineError, Result};
use crate::generation::sampling::{Sampler, SamplingConfig};
use crate::generation::session::CancellationToken;
use crate::generation::stream::{Transcription, TranscriptionStream};
use crate::models::config::Architecture;
use crate::models::variants::mel_to_tensor;
use crate::models::{ModelConfig, SpeechModel};
use crate::tokenizer::BpeTokenizer;
use crate::weights::{self, quantize, sanitize};

/// Resolves a package identifier to an already-downloaded local directory.
///
/// Download and caching are collaborator concerns; resolution failures are
/// a distinct error category from inference failures.
pub trait ModelResolver {
    fn resolve(&self, id: &str) -> Result<PathBuf>;
}

/// A loaded speech-to-text engine.
///
/// Cheap to share: the module tree and tokenizer are `Arc`ed and read-only
/// after load, so concurrent sessions never contend.
pub struct SpeechEngine<B: Backend> {
    config: ModelConfig,
    model: Arc<SpeechModel<B>>,
    tokenizer: Arc<BpeTokenizer>,
    mel: MelExtractor,
    sampling: SamplingConfig,
    device: B::Device,
}

impl<B: Backend> SpeechEngine<B> {
    /// Load a model package from a local directory.
    ///
    /// Any failure here is fatal for this model instance: there is no
    /// partial or degraded load.
    pub fn from_dir<P: AsRef<Path>>(dir: P, device: &B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let started = Instant::now();

        let config = ModelConfig::from_model_dir(dir)?;
        let tokenizer = BpeTokenizer::from_model_dir(dir)?;

        let raw = weights::load_tensors(dir)?;
        let plan = sanitize::plan_for(config.architecture);
        let mut tensors = sanitize::sanitize(raw, &plan)?;

        if let Some(quant) = &config.quantization {
            quantize::apply(&mut tensors, quant)?;
        }

        let expected: Vec<String> = SpeechModel::<B>::expected_parameters(&config)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        sanitize::verify(&tensors, &expected)?;

        let model = SpeechModel::from_tensors(&config, &mut tensors, device)?;

        let mel = MelExtractor::new(MelConfig {
            sample_rate: config.audio.sample_rate,
            n_fft: config.audio.window_size,
            hop_length: config.audio.hop_length,
            n_mels: config.audio.n_mels,
            log_mel_max: config.audio.global_log_mel_max,
        });

        info!(
            dir = %dir.display(),
            architecture = ?config.architecture,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Self {
            config,
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            mel,
            sampling: SamplingConfig::default(),
            device: device.clone(),
        })
    }

    /// Resolve a package identifier through a collaborator, then load it.
    pub fn from_resolver(
        resolver: &dyn ModelResolver,
        id: &str,
        device: &B::Device,
    ) -> Result<Self> {
        let dir = resolver.resolve(id)?;
        Self::from_dir(dir, device)
    }

    /// Replace the sampling configuration (greedy by default).
    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Blocking single-shot transcription.
    pub fn transcribe(&self, audio: &AudioBuffer) -> Result<Transcription> {
        self.transcribe_stream(audio)?.finish()
    }

    /// Cancellable incremental transcription.
    ///
    /// Use [`TranscriptionStream::cancellation_token`] to stop the stream
    /// from another thread; cancellation is observed between decode steps.
    pub fn transcribe_stream(&self, audio: &AudioBuffer) -> Result<TranscriptionStream<B>> {
        let mel = self.features(audio)?;
        let sampler = Sampler::new(self.sampling.clone());
        let cancel = CancellationToken::new();

        match self.config.architecture {
            Architecture::ConformerCtc => TranscriptionStream::new_ctc(
                self.model.clone(),
                self.tokenizer.clone(),
                mel,
                sampler,
                cancel,
            ),
            Architecture::AudioLm => TranscriptionStream::new_chunked(
                self.model.clone(),
                self.tokenizer.clone(),
                mel,
                sampler,
                cancel,
            ),
            Architecture::StreamingAudioLm => TranscriptionStream::new_streaming(
                self.model.clone(),
                self.tokenizer.clone(),
                mel,
                sampler,
                cancel,
            ),
        }
    }

    /// Length-normalize the waveform for this architecture and extract
    /// mel features onto the device.
    fn features(&self, audio: &AudioBuffer) -> Result<Tensor<B, 3>> {
        audio.check(self.config.audio.sample_rate)?;

        let samples = match self.config.architecture {
            Architecture::ConformerCtc | Architecture::AudioLm => {
                let target = self.config.audio.chunk_samples().ok_or_else(|| {
                    EngineError::Configuration("fixed-chunk family without chunk_seconds".into())
                })?;
                pad_fixed_length(&audio.samples, target)
            }
            Architecture::StreamingAudioLm => {
                let pad_config = StreamPadConfig {
                    sample_rate: self.config.audio.sample_rate,
                    left_pad_tokens: self.config.streaming.left_pad_tokens,
                    frame_rate: self.config.audio.frame_rate,
                    right_pad_tokens: self.config.streaming.right_pad_tokens,
                };
                pad_streaming(audio, &pad_config).samples
            }
        };

        let features = self.mel.extract(&samples, MelLayout::MelMajor)?;
        mel_to_tensor(&features, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::stream::StreamEvent;
    use crate::models::config::test_configs;
    use crate::models::variants::test_fixtures;
    use crate::tokenizer::test_vocab;
    use crate::weights::RawTensor;
    use burn::backend::NdArray;
    use safetensors::tensor::{Dtype, TensorView};
    use std::collections::HashMap;
    use std::fs;

    type TestBackend = NdArray;

    /// Write a loadable package: config, tokenizer, and a safetensors file
    /// holding the synthetic parameters in their on-disk layout (conv
    /// kernels stored `[out, kernel, in]`).
    fn write_package(name: &str, config_json: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vox-engine-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        fs::write(dir.join("config.json"), config_json).unwrap();
        fs::write(dir.join("tokenizer.json"), test_vocab::vocab_json(&["he", "ll"])).unwrap();

        let config = ModelConfig::from_json(config_json).unwrap();
        let plan = sanitize::plan_for(config.architecture);
        let tensors = test_fixtures::synthetic_tensors(&config);

        // Invert the load-time conv permutation so sanitize restores it.
        let disk: HashMap<String, RawTensor> = tensors
            .into_iter()
            .map(|(tensor_name, raw)| {
                let is_conv = plan.conv_suffixes.iter().any(|s| tensor_name.ends_with(s));
                let raw = if is_conv { raw.permute_021().unwrap() } else { raw };
                (tensor_name, raw)
            })
            .collect();

        let bytes: HashMap<String, (Vec<usize>, Vec<u8>)> = disk
            .into_iter()
            .map(|(tensor_name, raw)| {
                let buf: Vec<u8> = raw.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                (tensor_name, (raw.shape, buf))
            })
            .collect();
        let views: Vec<(&String, TensorView)> = bytes
            .iter()
            .map(|(tensor_name, (shape, buf))| {
                (
                    tensor_name,
                    TensorView::new(Dtype::F32, shape.clone(), buf).unwrap(),
                )
            })
            .collect();
        let serialized = safetensors::serialize(views, &None).unwrap();
        fs::write(dir.join(weights::SINGLE_FILE), serialized).unwrap();

        dir
    }

    #[test]
    fn test_ctc_silence_is_near_empty() {
        let dir = write_package("ctc", test_configs::ctc_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        // Silent 2-second chunk: mel features are constant away from the
        // window edges, so frame labels are long constant runs and CTC
        // collapse leaves a near-empty transcript.
        let audio = AudioBuffer::new(vec![0.0; 32000], 16000);
        let result = engine.transcribe(&audio).unwrap();
        // 50 encoder frames of silence must collapse far below one token
        // per frame; only window-edge frames can contribute labels.
        assert!(
            result.telemetry.generated_tokens <= 20,
            "silence produced {} tokens",
            result.telemetry.generated_tokens
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_chunked_end_to_end_stops() {
        let dir = write_package("chunked", test_configs::audio_lm_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.01; 16000], 16000);
        let result = engine.transcribe(&audio).unwrap();
        // Bounded by max_new_tokens in the config.
        assert!(result.telemetry.generated_tokens <= 16);
        assert!(result.telemetry.prompt_tokens > 0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_streaming_event_order_and_counts() {
        let dir = write_package("streaming", test_configs::streaming_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.01; 16000], 16000);
        let events: Vec<StreamEvent> = engine
            .transcribe_stream(&audio)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        // Token* Telemetry Final, in that order.
        let n = events.len();
        assert!(n >= 2);
        assert!(matches!(events[n - 1], StreamEvent::Final(_)));
        assert!(matches!(events[n - 2], StreamEvent::Telemetry(_)));
        for event in &events[..n - 2] {
            assert!(matches!(event, StreamEvent::Token { .. }));
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cancel_mid_stream() {
        let dir = write_package("cancel", test_configs::streaming_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.01; 32000], 16000);
        let mut stream = engine.transcribe_stream(&audio).unwrap();
        let token = stream.cancellation_token();

        // Cancel before the first step: zero token events, then the
        // cancellation error, then nothing. Never a final result.
        token.cancel();
        let next = stream.next().unwrap();
        assert!(matches!(next, Err(EngineError::Cancelled)));
        assert!(stream.next().is_none(), "nothing after cancellation");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_sample_rate_rejected() {
        let dir = write_package("rate", test_configs::ctc_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.0; 1000], 8000);
        assert!(matches!(
            engine.transcribe(&audio),
            Err(EngineError::AudioInput(_))
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_concurrent_sessions_share_the_model() {
        let dir = write_package("concurrent", test_configs::streaming_json());
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.01; 16000], 16000);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let engine = &engine;
                    let audio = audio.clone();
                    scope.spawn(move || engine.transcribe(&audio).unwrap())
                })
                .collect();
            let results: Vec<Transcription> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            // Greedy decoding over a shared immutable model is identical
            // across sessions.
            for r in &results[1..] {
                assert_eq!(r.text, results[0].text);
            }
        });
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resolver_failure_is_distinct() {
        struct FailingResolver;
        impl ModelResolver for FailingResolver {
            fn resolve(&self, id: &str) -> Result<PathBuf> {
                Err(EngineError::ModelResolve {
                    id: id.into(),
                    reason: "not cached".into(),
                })
            }
        }

        let device: <TestBackend as burn::tensor::backend::Backend>::Device = Default::default();
        let err = SpeechEngine::<TestBackend>::from_resolver(&FailingResolver, "asr-small", &device)
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelResolve { .. }));
    }

    #[test]
    fn test_quantized_package_loads() {
        let json = test_configs::streaming_json().replace(
            r#""streaming": {"#,
            r#""quantization": {"group_size": 8, "bits": 8},
               "streaming": {"#,
        );
        let dir = write_package("quant", &json);
        let device = Default::default();
        let engine = SpeechEngine::<TestBackend>::from_dir(&dir, &device).unwrap();

        let audio = AudioBuffer::new(vec![0.01; 16000], 16000);
        let result = engine.transcribe(&audio).unwrap();
        // One token per audio position past the prefix, at most.
        assert!(result.telemetry.generated_tokens <= 3);
        fs::remove_dir_all(&dir).ok();
    }
}
