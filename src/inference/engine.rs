//! # Inference Engine Boundary
//!
//! The relay talks to its speech/response model through the [`InferenceEngine`]
//! trait: one blocking call that turns a request into a lazy sequence of outputs.
//! Engines are free to block the calling thread for as long as they like; the
//! stream adapter runs them on the blocking pool.
//!
//! The process owns exactly one engine slot ([`EngineHandle`]). It starts empty
//! and is filled once the model has loaded, so requests that arrive before (or
//! without) a successful load fail with `EngineUnavailable` instead of blocking.

use crate::relay::conversation::Turn;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::info;

/// One item produced by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// A piece of generated text, in generation order
    Text(String),
    /// A non-text marker (special token, segment boundary); carries no text
    Marker,
}

/// Everything an engine needs to generate one response.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub audio: Arc<[u8]>,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub history: Arc<[Turn]>,
}

/// Lazy, blocking sequence of engine outputs. Borrowing the engine lets
/// implementations hold a lock on their model for the whole generation.
pub type EngineOutputs<'a> = Box<dyn Iterator<Item = anyhow::Result<EngineOutput>> + 'a>;

/// A (possibly blocking) text generation engine.
pub trait InferenceEngine: Send + Sync {
    /// Human-readable name used in logs and health output.
    fn name(&self) -> String;

    /// Start generating. Errors returned here happen before any output is produced.
    fn infer_stream(&self, request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>>;
}

/// Process-wide slot holding the loaded engine, if any.
#[derive(Clone, Default)]
pub struct EngineHandle {
    slot: Arc<RwLock<Option<Arc<dyn InferenceEngine>>>>,
    loaded_at: Arc<RwLock<Option<Instant>>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine_name())
            .finish()
    }
}

impl EngineHandle {
    /// An empty handle. Sessions fail with `EngineUnavailable` until [`install`](Self::install).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A handle that already holds `engine`.
    pub fn with_engine(engine: Arc<dyn InferenceEngine>) -> Self {
        let handle = Self::empty();
        handle.install(engine);
        handle
    }

    /// Install (or replace) the engine.
    pub fn install(&self, engine: Arc<dyn InferenceEngine>) {
        info!(engine = %engine.name(), "Inference engine installed");
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(engine);
        *self.loaded_at.write().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// The current engine, if one is installed.
    pub fn current(&self) -> Option<Arc<dyn InferenceEngine>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn engine_name(&self) -> Option<String> {
        self.current().map(|engine| engine.name())
    }

    /// Seconds since the engine was installed.
    pub fn loaded_for_seconds(&self) -> Option<u64> {
        self.loaded_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed().as_secs())
    }
}
