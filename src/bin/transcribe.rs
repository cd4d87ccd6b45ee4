//! Transcribe a WAV file with a local model package.
//!
//! ```text
//! transcribe --model-dir models/asr-small input.wav
//! transcribe --model-dir models/asr-small --stream input.wav
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use vox_engine::{AudioBuffer, SamplingConfig, SpeechEngine, StreamEvent};

type Backend = burn::backend::NdArray;

#[derive(Parser, Debug)]
#[command(name = "transcribe", about = "Local speech-to-text inference")]
struct Args {
    /// Directory containing config.json, tokenizer.json and weights.
    #[arg(long)]
    model_dir: PathBuf,

    /// Input WAV file (mono, at the model's sample rate).
    wav: PathBuf,

    /// Emit tokens incrementally instead of one final result.
    #[arg(long)]
    stream: bool,

    /// Sampling temperature; 0 = greedy.
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let audio = load_wav(&args.wav)
        .with_context(|| format!("failed to read {}", args.wav.display()))?;

    let device = Default::default();
    let engine = SpeechEngine::<Backend>::from_dir(&args.model_dir, &device)
        .with_context(|| format!("failed to load model from {}", args.model_dir.display()))?
        .with_sampling(SamplingConfig {
            temperature: args.temperature,
            seed: None,
        });

    if args.stream {
        let stream = engine.transcribe_stream(&audio)?;
        for event in stream {
            match event? {
                StreamEvent::Token { piece, .. } => {
                    if let Some(piece) = piece {
                        print!("{piece}");
                        std::io::stdout().flush().ok();
                    }
                }
                StreamEvent::Telemetry(t) => {
                    eprintln!(
                        "\n[{} prompt, {} generated, {:.1} tok/s]",
                        t.prompt_tokens,
                        t.generated_tokens,
                        t.tokens_per_sec()
                    );
                }
                StreamEvent::Final(result) => {
                    println!("\n{}", result.text);
                }
            }
        }
    } else {
        let result = engine.transcribe(&audio)?;
        println!("{}", result.text);
        eprintln!(
            "[{} prompt, {} generated, prefill {:.0} ms, decode {:.0} ms]",
            result.telemetry.prompt_tokens,
            result.telemetry.generated_tokens,
            result.telemetry.prefill_ms,
            result.telemetry.decode_ms
        );
    }

    Ok(())
}

/// Read a WAV file into a mono f32 buffer.
fn load_wav(path: &std::path::Path) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = match spec.channels {
        1 => samples,
        2 => samples.chunks_exact(2).map(|c| (c[0] + c[1]) * 0.5).collect(),
        n => bail!("unsupported channel count: {n}"),
    };

    Ok(AudioBuffer::new(mono, spec.sample_rate))
}
