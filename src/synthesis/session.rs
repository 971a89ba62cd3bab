//! # Speech Synthesis Session
//!
//! One duplex WebSocket connection to the text-to-speech provider, driven by two
//! independent tasks:
//!
//! - **Writer**: forwards every `TextDelta` it is handed as a text increment and,
//!   on `EndOfStream`, sends the flush message and stops. Stopping the writer does
//!   not end the session.
//! - **Reader**: turns inbound messages into [`SynthesisEvent`]s. It stops after the
//!   provider's final marker (`SynthesisComplete`) or on any abnormal close or
//!   socket error (`SynthesisError`). Its termination is the session's completion.
//!
//! Events from both tasks arrive on one queue in the order they happened. The
//! connection is attempted once; nothing here retries. Dropping the session aborts
//! both tasks and with them the socket.

use crate::config::SynthesisConfig;
use crate::error::SessionError;
use crate::inference::stream::InferenceChunk;
use crate::synthesis::messages::{InitMessage, ProviderMessage, TextMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the provider side of a session reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// One decoded audio fragment, in provider order
    AudioDelta(Vec<u8>),
    SynthesisComplete,
    SynthesisError(String),
}

impl SynthesisEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SynthesisEvent::AudioDelta(_))
    }
}

/// A live provider connection.
pub struct SynthesisSession {
    text: Option<mpsc::Sender<InferenceChunk>>,
    events: mpsc::UnboundedReceiver<SynthesisEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SynthesisSession {
    /// Connect, send the initialization message and start the writer and reader.
    ///
    /// `buffer` bounds how many text chunks may wait for the writer.
    pub async fn open(config: &SynthesisConfig, buffer: usize) -> Result<Self, SessionError> {
        let endpoint = config.resolved_endpoint();
        debug!(endpoint = %endpoint, "Connecting to speech provider");

        let (socket, _response) = tokio::time::timeout(config.connect_timeout(), connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                SessionError::Synthesis(format!(
                    "connection timed out after {}ms",
                    config.connect_timeout_ms
                ))
            })?
            .map_err(|e| SessionError::Synthesis(format!("connection failed: {}", e)))?;

        let (mut sink, stream) = socket.split();
        send_json(&mut sink, &InitMessage::new(config))
            .await
            .map_err(|e| SessionError::Synthesis(format!("failed to send initialization: {}", e)))?;
        info!(voice_id = %config.voice_id, model_id = %config.model_id, "Speech provider session opened");

        let (text_tx, text_rx) = mpsc::channel(buffer.max(1));
        let (event_tx, events) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_text(sink, text_rx, event_tx.clone()));
        let reader = tokio::spawn(read_audio(stream, event_tx));

        Ok(Self {
            text: Some(text_tx),
            events,
            writer,
            reader,
        })
    }

    /// Hand one chunk to the writer. After `EndOfStream` no more text is accepted.
    pub async fn send(&mut self, chunk: InferenceChunk) -> Result<(), SessionError> {
        let finished = chunk == InferenceChunk::EndOfStream;
        let text = self
            .text
            .as_ref()
            .ok_or_else(|| SessionError::Synthesis("text input already finished".to_string()))?;
        text.send(chunk)
            .await
            .map_err(|_| SessionError::Synthesis("synthesis writer stopped".to_string()))?;
        if finished {
            self.text = None;
        }
        Ok(())
    }

    /// Next event from either task. `None` means both tasks are gone and the
    /// queue is drained.
    pub async fn next_event(&mut self) -> Option<SynthesisEvent> {
        self.events.recv().await
    }
}

impl Drop for SynthesisSession {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn send_json<T: Serialize>(
    sink: &mut SplitSink<Socket, Message>,
    message: &T,
) -> Result<(), String> {
    let payload = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(Message::Text(payload)).await.map_err(|e| e.to_string())
}

async fn write_text(
    mut sink: SplitSink<Socket, Message>,
    mut text: mpsc::Receiver<InferenceChunk>,
    events: mpsc::UnboundedSender<SynthesisEvent>,
) {
    let mut increments = 0usize;
    while let Some(chunk) = text.recv().await {
        let result = match &chunk {
            InferenceChunk::TextDelta(delta) => send_json(&mut sink, &TextMessage::increment(delta)).await,
            InferenceChunk::EndOfStream => send_json(&mut sink, &TextMessage::flush()).await,
        };

        if let Err(e) = result {
            warn!(increments, "Failed to send text to speech provider: {}", e);
            let _ = events.send(SynthesisEvent::SynthesisError(format!("send failed: {}", e)));
            return;
        }

        if chunk == InferenceChunk::EndOfStream {
            debug!(increments, "Speech provider input flushed");
            return;
        }
        increments += 1;
    }
    debug!(increments, "Text source dropped before end of stream");
}

async fn read_audio(mut stream: SplitStream<Socket>, events: mpsc::UnboundedSender<SynthesisEvent>) {
    let mut fragments = 0usize;

    let outcome = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break SynthesisEvent::SynthesisError(format!("receive failed: {}", e)),
            None => {
                break SynthesisEvent::SynthesisError("connection ended before the final marker".to_string())
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!(" ({} {})", u16::from(f.code), f.reason))
                    .unwrap_or_default();
                break SynthesisEvent::SynthesisError(format!(
                    "provider closed the connection before the final marker{}",
                    reason
                ));
            }
            _ => continue,
        };

        let inbound = match ProviderMessage::parse(&text) {
            Ok(inbound) => inbound,
            Err(e) => break SynthesisEvent::SynthesisError(format!("malformed provider message: {}", e)),
        };

        if let Some(reason) = inbound.error_reason() {
            break SynthesisEvent::SynthesisError(reason);
        }

        match inbound.audio_bytes() {
            Ok(Some(audio)) => {
                fragments += 1;
                if events.send(SynthesisEvent::AudioDelta(audio)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => break SynthesisEvent::SynthesisError(format!("invalid audio payload: {}", e)),
        }

        if inbound.is_final() {
            break SynthesisEvent::SynthesisComplete;
        }
    };

    match &outcome {
        SynthesisEvent::SynthesisComplete => debug!(fragments, "Speech provider finished"),
        other => warn!(fragments, ?other, "Speech provider session failed"),
    }
    let _ = events.send(outcome);
}
