//! Text generation: the engine boundary, its async stream adapter, and the
//! Whisper engine that ships with the service.

pub mod engine;
pub mod stream;
pub mod whisper;

pub use engine::{EngineHandle, EngineOutput, InferenceEngine, InferenceRequest};
pub use stream::{InferenceChunk, InferenceStream};
pub use whisper::WhisperEngine;
