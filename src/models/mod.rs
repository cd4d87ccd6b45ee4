//! Model architectures and their building blocks.

pub mod adapter;
pub mod config;
pub mod conformer;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod time_embedding;
pub mod variants;

pub use config::{Architecture, ModelConfig};
pub use variants::SpeechModel;
