//! Cancellable transcription streams.
//!
//! A stream is a pull-based, single-producer sequence of events: zero or
//! more `Token`s, one `Telemetry`, then `Final`. Each `next()` performs at
//! most one decode step; the cancellation flag is observed between steps
//! only, so cache state is always coherent. A cancelled stream yields
//! `Err(Cancelled)` after any already-emitted tokens and never a partial
//! final result.

use std::collections::VecDeque;
use std::sync::Arc;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use super::sampling::Sampler;
use super::session::{CancellationToken, GenerationSession, SessionTelemetry};
use crate::error::{EngineError, Result};
use crate::models::decoder::LanguageDecoder;
use crate::models::variants::SpeechModel;
use crate::tokenizer::{ctc, BpeTokenizer};

/// Result of a completed transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub telemetry: SessionTelemetry,
}

/// One streamed event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A generated token, with its display piece when decodable.
    Token { id: u32, piece: Option<String> },
    /// Observational metrics, emitted once before the final result.
    Telemetry(SessionTelemetry),
    /// The completed transcription. Always the last event.
    Final(Transcription),
}

enum LmMode<B: Backend> {
    Chunked,
    Streaming {
        audio: Tensor<B, 3>,
        t_embed: Tensor<B, 3>,
        /// Next decoder position to fill.
        pos: usize,
        n_positions: usize,
    },
}

enum DriveState<B: Backend> {
    /// CTC labels are fully available after the encoder pass; the stream
    /// drains them one token per `next()`.
    Ctc { pending: VecDeque<u32> },
    /// Autoregressive decode, one step per `next()`.
    Lm {
        pending: Option<u32>,
        last: u32,
        generated: usize,
        max_new: usize,
        eos_id: u32,
        exhausted: bool,
        mode: LmMode<B>,
    },
}

/// Cancellable incremental transcription.
pub struct TranscriptionStream<B: Backend> {
    model: Arc<SpeechModel<B>>,
    tokenizer: Arc<BpeTokenizer>,
    session: GenerationSession<B>,
    drive: DriveState<B>,
    device: B::Device,
    telemetry_sent: bool,
    finished: bool,
}

impl<B: Backend> TranscriptionStream<B> {
    /// CTC: run the encoder once, then drain collapsed labels.
    pub(crate) fn new_ctc(
        model: Arc<SpeechModel<B>>,
        tokenizer: Arc<BpeTokenizer>,
        mel: Tensor<B, 3>,
        sampler: Sampler,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let device = mel.device();
        let SpeechModel::Ctc(ctc_model) = &*model else {
            return Err(EngineError::Inference("expected a CTC model".into()));
        };

        let mut session = GenerationSession::new(
            crate::models::layers::LayerCaches::unbounded(0),
            sampler,
            cancel,
        );
        session.begin_prefill(mel.dims()[2]);
        let labels = ctc_model.frame_labels(mel)?;
        let collapsed = ctc::collapse(&labels, ctc_model.blank_id);
        session.begin_decode();

        Ok(Self {
            model,
            tokenizer,
            session,
            drive: DriveState::Ctc {
                pending: collapsed.into(),
            },
            device,
            telemetry_sent: false,
            finished: false,
        })
    }

    /// Chunked: prefill the full prompt, then decode until EOS or the
    /// token budget runs out.
    pub(crate) fn new_chunked(
        model: Arc<SpeechModel<B>>,
        tokenizer: Arc<BpeTokenizer>,
        mel: Tensor<B, 3>,
        sampler: Sampler,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let device = mel.device();
        let SpeechModel::Chunked(m) = &*model else {
            return Err(EngineError::Inference("expected a chunked model".into()));
        };

        let mut session = GenerationSession::new(m.decoder.create_cache(), sampler, cancel);

        let prompt = m.prompt_embeddings(mel);
        session.begin_prefill(prompt.dims()[1]);
        let first = lm_step(&m.decoder, prompt, None, &mut session)?;
        session.begin_decode();

        let eos_id = m.eos_id;
        let drive = DriveState::Lm {
            pending: (first != eos_id).then_some(first),
            last: first,
            generated: 1,
            max_new: m.max_new_tokens,
            eos_id,
            exhausted: first == eos_id,
            mode: LmMode::Chunked,
        };

        Ok(Self {
            model,
            tokenizer,
            session,
            drive,
            device,
            telemetry_sent: false,
            finished: false,
        })
    }

    /// Streaming: prefill the BOS+pad prefix fused with the leading audio
    /// positions, then decode one token per remaining audio frame.
    pub(crate) fn new_streaming(
        model: Arc<SpeechModel<B>>,
        tokenizer: Arc<BpeTokenizer>,
        mel: Tensor<B, 3>,
        sampler: Sampler,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let device = mel.device();
        let SpeechModel::Streaming(m) = &*model else {
            return Err(EngineError::Inference("expected a streaming model".into()));
        };

        let audio = m.audio_embeddings(mel);
        let n_positions = audio.dims()[1];
        let d = m.decoder.d_model();

        let prefix = m.prefix_tokens();
        let prefix_len = prefix.len();
        if n_positions <= prefix_len {
            return Err(EngineError::AudioInput(format!(
                "audio covers {n_positions} decoder positions, prefix needs {prefix_len}"
            )));
        }

        let prefix_ids: Vec<i32> = prefix.iter().map(|&t| t as i32).collect();
        let prefix_ids = Tensor::<B, 2, Int>::from_data(
            TensorData::new(prefix_ids, [1, prefix_len]),
            &device,
        );
        let text_embeds = m.decoder.embed_tokens(prefix_ids);
        let audio_prefix = audio.clone().slice([0..1, 0..prefix_len, 0..d]);
        let prompt = audio_prefix + text_embeds;

        let t_embed = m.t_embed(&device);

        let mut session = GenerationSession::new(
            m.decoder.create_rotating_cache(m.cache_capacity),
            sampler,
            cancel,
        );
        session.begin_prefill(prefix_len);
        let first = lm_step(&m.decoder, prompt, Some(&t_embed), &mut session)?;
        session.begin_decode();

        let eos_id = m.eos_id;
        let drive = DriveState::Lm {
            pending: (first != eos_id).then_some(first),
            last: first,
            generated: 1,
            // One token per audio position past the prefix.
            max_new: n_positions - prefix_len,
            eos_id,
            exhausted: first == eos_id,
            mode: LmMode::Streaming {
                audio,
                t_embed,
                pos: prefix_len + 1,
                n_positions,
            },
        };

        Ok(Self {
            model,
            tokenizer,
            session,
            drive,
            device,
            telemetry_sent: false,
            finished: false,
        })
    }

    /// A handle the caller can use to cancel this stream from any thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancel_handle()
    }

    /// Run the stream to completion, returning the final transcription.
    pub fn finish(mut self) -> Result<Transcription> {
        for event in &mut self {
            if let StreamEvent::Final(result) = event? {
                return Ok(result);
            }
        }
        Err(EngineError::Inference(
            "stream ended without a final result".into(),
        ))
    }

    /// Produce the next token, or `None` when generation is over.
    fn advance(&mut self) -> Result<Option<u32>> {
        match &mut self.drive {
            DriveState::Ctc { pending } => Ok(pending.pop_front()),
            DriveState::Lm {
                pending,
                last,
                generated,
                max_new,
                eos_id,
                exhausted,
                mode,
            } => {
                if *exhausted {
                    return Ok(None);
                }
                if let Some(token) = pending.take() {
                    return Ok(Some(token));
                }
                if *generated >= *max_new {
                    *exhausted = true;
                    return Ok(None);
                }

                let token = match (&*self.model, mode) {
                    (SpeechModel::Chunked(m), LmMode::Chunked) => {
                        let input = m.token_embedding(*last, &self.device);
                        lm_step(&m.decoder, input, None, &mut self.session)?
                    }
                    (
                        SpeechModel::Streaming(m),
                        LmMode::Streaming {
                            audio,
                            t_embed,
                            pos,
                            n_positions,
                        },
                    ) => {
                        if *pos >= *n_positions {
                            *exhausted = true;
                            return Ok(None);
                        }
                        let d = m.decoder.d_model();
                        let frame = audio.clone().slice([0..1, *pos - 1..*pos, 0..d]);
                        let input = frame + m.token_embedding(*last, &self.device);
                        *pos += 1;
                        lm_step(&m.decoder, input, Some(t_embed), &mut self.session)?
                    }
                    _ => {
                        return Err(EngineError::Inference(
                            "stream state does not match model variant".into(),
                        ))
                    }
                };

                *generated += 1;
                if token == *eos_id {
                    *exhausted = true;
                    return Ok(None);
                }
                *last = token;
                Ok(Some(token))
            }
        }
    }
}

impl<B: Backend> Iterator for TranscriptionStream<B> {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.session.cancellation_requested() {
            self.session.mark_cancelled();
            self.finished = true;
            return Some(Err(EngineError::Cancelled));
        }

        if self.telemetry_sent {
            self.finished = true;
            let text = self.tokenizer.decode(&self.session.emitted, true);
            let result = Transcription {
                text,
                telemetry: self.session.telemetry().clone(),
            };
            self.session.release_buffers();
            return Some(Ok(StreamEvent::Final(result)));
        }

        match self.advance() {
            Ok(Some(token)) => {
                self.session.record_token(token);
                let piece = self.tokenizer.decode_token(token);
                Some(Ok(StreamEvent::Token { id: token, piece }))
            }
            Ok(None) => {
                self.session.complete();
                self.telemetry_sent = true;
                Some(Ok(StreamEvent::Telemetry(self.session.telemetry().clone())))
            }
            Err(e) => {
                self.finished = true;
                self.session.release_buffers();
                Some(Err(e))
            }
        }
    }
}

fn lm_step<B: Backend>(
    decoder: &LanguageDecoder<B>,
    input: Tensor<B, 3>,
    t_embed: Option<&Tensor<B, 3>>,
    session: &mut GenerationSession<B>,
) -> Result<u32> {
    let hidden = decoder.forward_hidden_with_cache(input, t_embed, session.caches_mut());
    let [_, seq, d] = hidden.dims();
    let last = hidden.slice([0..1, seq - 1..seq, 0..d]);
    session.sample_last(decoder.lm_head(last))
}
