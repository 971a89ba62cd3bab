//! # Processing Orchestrator
//!
//! Owns the lifecycle of one upload, from acceptance to its terminal event.
//!
//! ## Session state machine:
//! ```text
//! Accepted -> Inferring -> Synthesizing -> Completed
//!     \___________\______________\-------> Failed
//! ```
//!
//! ## How a session runs:
//! 1. **submit** validates the upload synchronously, takes the single-session guard
//!    (or fails with `SessionBusy`) and spawns a supervisor task
//! 2. The **supervisor** starts the inference stream, spawns the worker and awaits
//!    its `JoinHandle`, so a worker that errors *or panics* still ends in exactly one
//!    terminal event. The inference pump is stopped before that event is pushed.
//! 3. The **worker** opens the synthesis session and relays text one way and audio
//!    the other until the provider's final marker
//!
//! ## Rust Concepts Used:
//! - **OwnedMutexGuard**: the guard moves into the supervisor task and is dropped
//!   only after the terminal event has been pushed
//! - **tokio::select!**: inference chunks and synthesis events are handled as they
//!   arrive, whichever comes first
//! - **JoinError::is_panic**: turns a crashed worker into a normal failure

use crate::config::{AppConfig, InferenceConfig, RelayConfig, SynthesisConfig};
use crate::error::{AppError, SessionError};
use crate::inference::engine::{EngineHandle, InferenceRequest};
use crate::inference::stream::{InferenceChunk, InferenceStream};
use crate::relay::channel::{ClientEvent, EventChannel};
use crate::relay::conversation::{ConversationState, HistorySnapshot, Turn};
use crate::synthesis::session::{SynthesisEvent, SynthesisSession};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw upload parameters as received from the client.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub audio: Vec<u8>,
    pub prompt: Option<String>,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
}

/// A validated upload. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub audio: Arc<[u8]>,
    pub prompt: String,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub created_at: DateTime<Utc>,
}

impl UploadRequest {
    /// Apply defaults and validation rules.
    ///
    /// ## Rules:
    /// - Audio must be non-empty
    /// - A missing or blank prompt is replaced by the default prompt, which must
    ///   itself be non-empty
    /// - The audio marker is prepended when configured and not already present
    /// - `max_new_tokens` must be positive, temperature finite and non-negative
    pub fn validate(submission: Submission, defaults: &InferenceConfig) -> Result<Self, AppError> {
        if submission.audio.is_empty() {
            return Err(AppError::ValidationError("Audio file is empty".to_string()));
        }

        let prompt = submission
            .prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| defaults.default_prompt.clone());
        if prompt.trim().is_empty() {
            return Err(AppError::ValidationError("Prompt is empty".to_string()));
        }

        let marker = defaults.audio_marker.as_str();
        let prompt = if defaults.prepend_audio_marker && !marker.is_empty() && !prompt.contains(marker) {
            format!("{}{}", marker, prompt)
        } else {
            prompt
        };

        let max_new_tokens = submission.max_new_tokens.unwrap_or(defaults.max_new_tokens as i64);
        if max_new_tokens <= 0 {
            return Err(AppError::ValidationError(format!(
                "max_new_tokens must be greater than 0, got {}",
                max_new_tokens
            )));
        }

        let temperature = submission.temperature.unwrap_or(defaults.temperature);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(AppError::ValidationError(format!(
                "temperature must be a non-negative number, got {}",
                temperature
            )));
        }

        Ok(Self {
            audio: Arc::from(submission.audio),
            prompt,
            max_new_tokens: max_new_tokens as usize,
            temperature,
            created_at: Utc::now(),
        })
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    Accepted,
    Inferring,
    Synthesizing,
    Completed,
    Failed(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed(_))
    }
}

/// Identifies one processing session. Clones observe the same status.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl SessionHandle {
    fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at,
            status: Arc::new(watch::Sender::new(SessionStatus::Accepted)),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: SessionStatus) {
        debug!(session_id = %self.id, ?status, "Session status changed");
        self.status.send_replace(status);
    }

    /// Wait until the session is terminal and the single-session guard is free.
    pub async fn finished(&self) -> SessionStatus {
        let mut updates = self.status.subscribe();
        let status = match updates.wait_for(SessionStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            status: self.status(),
            created_at: self.created_at,
            elapsed_ms: (Utc::now() - self.created_at).num_milliseconds(),
        }
    }
}

/// Serializable view of a session for health output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub elapsed_ms: i64,
}

#[derive(Debug, Default)]
struct SessionCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected_busy: AtomicU64,
}

/// Session statistics for the health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected_busy: u64,
    pub events_dropped: u64,
    pub history_turns: usize,
    pub active: Option<SessionSnapshot>,
}

struct Inner {
    engine: EngineHandle,
    conversation: ConversationState,
    channel: EventChannel,
    inference: InferenceConfig,
    synthesis: SynthesisConfig,
    relay: RelayConfig,
    guard: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<SessionHandle>>,
    counters: SessionCounters,
}

/// Cloneable entry point for uploads and conversation resets.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        engine: EngineHandle,
        conversation: ConversationState,
        channel: EventChannel,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                conversation,
                channel,
                inference: config.inference.clone(),
                synthesis: config.synthesis.clone(),
                relay: config.relay.clone(),
                guard: Arc::new(tokio::sync::Mutex::new(())),
                active: Mutex::new(None),
                counters: SessionCounters::default(),
            }),
        }
    }

    /// Validate an upload and start processing it in the background.
    ///
    /// Errors returned here are synchronous: nothing was started and nothing will
    /// appear on the event channel. Everything after this returns `Ok` is reported
    /// only through the channel.
    pub fn submit(&self, submission: Submission) -> Result<SessionHandle, AppError> {
        let request = UploadRequest::validate(submission, &self.inner.inference)?;

        let (handle, permit) = self.admit(request.created_at)?;

        let history = self.inner.conversation.snapshot();
        info!(
            session_id = %handle.id,
            audio_bytes = request.audio.len(),
            max_new_tokens = request.max_new_tokens,
            temperature = request.temperature,
            history_turns = history.turns.len(),
            "Session accepted"
        );

        tokio::spawn(supervise(self.inner.clone(), handle.clone(), request, history, permit));
        Ok(handle)
    }

    /// Take the single-session guard and register a new active session.
    fn admit(&self, created_at: DateTime<Utc>) -> Result<(SessionHandle, OwnedMutexGuard<()>), AppError> {
        let permit = match self.inner.guard.clone().try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.counters.rejected_busy.fetch_add(1, Ordering::Relaxed);
                let active = self
                    .current_session()
                    .map(|session| session.id.to_string())
                    .unwrap_or_else(|| "pending".to_string());
                warn!(active_session = %active, "Upload rejected, a session is already running");
                return Err(AppError::SessionBusy(active));
            }
        };

        let handle = SessionHandle::new(created_at);
        *self.inner.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
        Ok((handle, permit))
    }

    /// Clear the conversation history. A running session keeps the snapshot it
    /// started with and its completion will not be recorded.
    pub fn reset_conversation(&self) {
        self.inner.conversation.reset();
        info!("Conversation history reset");
    }

    pub fn current_session(&self) -> Option<SessionHandle> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn channel(&self) -> &EventChannel {
        &self.inner.channel
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.inner.engine
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.inner.counters;
        SessionStats {
            started: counters.started.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            rejected_busy: counters.rejected_busy.load(Ordering::Relaxed),
            events_dropped: self.inner.channel.dropped_count(),
            history_turns: self.inner.conversation.len(),
            active: self.current_session().map(|session| session.snapshot()),
        }
    }
}

/// Runs one session to its single terminal event.
///
/// Inference is started here rather than in the worker so that its blocking pump
/// can be stopped after the worker ends, however it ends, and before anything
/// terminal is reported.
async fn supervise(
    inner: Arc<Inner>,
    handle: SessionHandle,
    request: UploadRequest,
    history: HistorySnapshot,
    permit: OwnedMutexGuard<()>,
) {
    let started = Instant::now();
    handle.set_status(SessionStatus::Inferring);

    let engine_request = InferenceRequest {
        prompt: request.prompt.clone(),
        audio: request.audio.clone(),
        max_new_tokens: request.max_new_tokens,
        temperature: request.temperature,
        history: history.turns.clone(),
    };

    let outcome = match InferenceStream::start(inner.engine.current(), engine_request, inner.relay.chunk_buffer) {
        Ok((inference, pump)) => {
            let worker = tokio::spawn(run_session(inner.clone(), handle.clone(), inference));
            let outcome = join_worker(worker).await;
            pump.stop().await;
            outcome
        }
        Err(error) => Err(error),
    };

    conclude(&inner, &handle, &request, &history, permit, outcome, started);
}

/// Await the worker task, turning a panic or cancellation into a session error.
async fn join_worker(worker: JoinHandle<Result<String, SessionError>>) -> Result<String, SessionError> {
    match worker.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(SessionError::Aborted("session worker panicked".to_string())),
        Err(e) => Err(SessionError::Aborted(e.to_string())),
    }
}

/// Emit the terminal event, then free the single-session guard. The final status
/// is published last so `SessionHandle::finished` observes a free guard.
fn conclude(
    inner: &Inner,
    handle: &SessionHandle,
    request: &UploadRequest,
    history: &HistorySnapshot,
    permit: OwnedMutexGuard<()>,
    outcome: Result<String, SessionError>,
    started: Instant,
) {
    let status = match outcome {
        Ok(response) => {
            let user_text = request.prompt.replace(&inner.inference.audio_marker, " ");
            let recorded = inner.conversation.append(
                history.epoch,
                [Turn::user(user_text.trim()), Turn::assistant(response.trim())],
            );
            inner.channel.push(ClientEvent::Complete);
            inner.counters.completed.fetch_add(1, Ordering::Relaxed);
            info!(
                session_id = %handle.id,
                duration_ms = started.elapsed().as_millis() as u64,
                response_chars = response.len(),
                recorded,
                "Session completed"
            );
            SessionStatus::Completed
        }
        Err(error) => {
            inner.channel.push(ClientEvent::Error);
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %handle.id,
                duration_ms = started.elapsed().as_millis() as u64,
                kind = error.kind(),
                "Session failed: {}",
                error
            );
            SessionStatus::Failed(error.to_string())
        }
    };

    inner.active.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(permit);
    handle.set_status(status);
}

/// Relay inference output into synthesis and synthesized audio into the event
/// channel until the provider finishes. Returns the full response text.
async fn run_session(
    inner: Arc<Inner>,
    handle: SessionHandle,
    mut inference: InferenceStream,
) -> Result<String, SessionError> {
    let mut synthesis = SynthesisSession::open(&inner.synthesis, inner.relay.chunk_buffer).await?;

    let mut response = String::new();
    let mut inference_done = false;
    let mut fragments = 0usize;

    loop {
        tokio::select! {
            chunk = inference.next(), if !inference_done => match chunk {
                Some(Ok(chunk)) => {
                    match &chunk {
                        InferenceChunk::TextDelta(text) => response.push_str(text),
                        InferenceChunk::EndOfStream => inference_done = true,
                    }
                    synthesis.send(chunk).await?;
                }
                Some(Err(error)) => return Err(error),
                None => inference_done = true,
            },
            event = synthesis.next_event() => match event {
                Some(SynthesisEvent::AudioDelta(audio)) => {
                    if fragments == 0 {
                        handle.set_status(SessionStatus::Synthesizing);
                    }
                    fragments += 1;
                    inner.channel.push(ClientEvent::Data(STANDARD.encode(audio)));
                }
                Some(SynthesisEvent::SynthesisComplete) => {
                    if !inference_done {
                        debug!(session_id = %handle.id, "Provider finished before inference ended");
                    }
                    debug!(session_id = %handle.id, fragments, "Synthesis complete");
                    return Ok(response);
                }
                Some(SynthesisEvent::SynthesisError(reason)) => return Err(SessionError::Synthesis(reason)),
                None => {
                    return Err(SessionError::Synthesis("session ended without a final marker".to_string()))
                }
            },
        }
    }
}
