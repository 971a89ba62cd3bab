//! Local stand-in for the speech provider, used by the synthesis and orchestrator
//! tests. It speaks the provider's JSON protocol over a plain `ws://` socket on
//! 127.0.0.1 and "synthesizes" each text increment by echoing its bytes back as
//! the audio fragment.

use crate::config::{AppConfig, SynthesisConfig};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Echo every increment as audio, answer the flush with the final marker
    Echo,
    /// Like `Echo`, but wait this many milliseconds before the final marker
    FinalAfterDelay(u64),
    /// Echo this many increments, then drop the TCP connection without a close frame
    DropAfterAudio(usize),
    /// Answer the initialization message with a provider error
    RejectCredential,
}

pub struct ProviderStandIn {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    server: JoinHandle<()>,
}

impl ProviderStandIn {
    /// Synthesis settings pointing at this stand-in.
    pub fn config(&self) -> SynthesisConfig {
        SynthesisConfig {
            endpoint: format!(
                "ws://{}/v1/text-to-speech/{{voice_id}}/stream-input?model_id={{model_id}}",
                self.addr
            ),
            api_key: "test-key".to_string(),
            connect_timeout_ms: 2_000,
            ..AppConfig::default().synthesis
        }
    }

    /// Every JSON message received so far, across all connections.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Number of connections that sent an initialization message.
    pub fn sessions(&self) -> usize {
        self.received()
            .iter()
            .filter(|message| message.get("xi_api_key").is_some())
            .count()
    }
}

impl Drop for ProviderStandIn {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn spawn_provider(script: Script) -> ProviderStandIn {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    let server = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, script, log.clone()));
        }
    });

    ProviderStandIn { addr, received, server }
}

/// A `ws://` endpoint nothing is listening on.
pub async fn unused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/stream-input", addr)
}

async fn serve(stream: TcpStream, script: Script, log: Arc<Mutex<Vec<Value>>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let mut audio_sent = 0usize;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        log.lock().unwrap().push(value.clone());

        if value.get("xi_api_key").is_some() {
            if let Script::RejectCredential = script {
                let reply = json!({"error": "auth_error", "message": "invalid key"});
                let _ = ws.send(Message::Text(reply.to_string())).await;
                let _ = ws.close(None).await;
                return;
            }
            continue;
        }

        let text = value["text"].as_str().unwrap_or_default().to_string();
        if text.is_empty() {
            if let Script::FinalAfterDelay(ms) = script {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let _ = ws.send(Message::Text(json!({"audio": null, "isFinal": true}).to_string())).await;
            return;
        }

        if let Script::DropAfterAudio(limit) = script {
            if audio_sent == limit {
                return;
            }
        }

        let reply = json!({"audio": STANDARD.encode(text.as_bytes()), "isFinal": null});
        if ws.send(Message::Text(reply.to_string())).await.is_err() {
            return;
        }
        audio_sent += 1;
    }
}
