//! Generation: sampling, session state, and cancellable streams.

pub mod sampling;
pub mod session;
pub mod stream;

pub use sampling::{Sampler, SamplingConfig};
pub use session::{CancellationToken, SessionState, SessionTelemetry};
pub use stream::{StreamEvent, Transcription, TranscriptionStream};
