//! # Upload Handler
//!
//! `POST /upload-audio` accepts a multipart form:
//!
//! | field            | kind    | default                      |
//! |------------------|---------|------------------------------|
//! | `audio`          | file    | required                     |
//! | `prompt`         | text    | `inference.default_prompt`   |
//! | `max_new_tokens` | integer | `inference.max_new_tokens`   |
//! | `temperature`    | float   | `inference.temperature`      |
//!
//! The response is `{"status": "processing"}` as soon as the session has been
//! accepted; results arrive on `/response-events`. Validation failures (400) and an
//! already running session (409) are the only errors reported here.

use crate::error::{AppError, AppResult};
use crate::relay::orchestrator::Submission;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use serde_json::json;
use std::str::FromStr;
use tracing::{debug, info};

/// Uploads larger than this are refused while they are being read.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub async fn upload_audio(state: web::Data<AppState>, mut payload: Multipart) -> AppResult<HttpResponse> {
    let mut submission = Submission::default();
    let mut has_audio = false;

    while let Some(mut field) = payload.try_next().await? {
        let name = field.name().unwrap_or_default().to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::ValidationError(format!(
                    "Field '{}' exceeds the {} byte upload limit",
                    name, MAX_UPLOAD_BYTES
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "audio" => {
                has_audio = true;
                submission.audio = bytes;
            }
            "prompt" => submission.prompt = Some(text_field(&name, bytes)?),
            "max_new_tokens" => submission.max_new_tokens = number_field(&name, bytes)?,
            "temperature" => submission.temperature = number_field(&name, bytes)?,
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    if !has_audio {
        return Err(AppError::ValidationError("Missing 'audio' file field".to_string()));
    }

    let handle = state.orchestrator.submit(submission)?;
    info!(session_id = %handle.id, "Upload accepted");

    Ok(HttpResponse::Ok().json(json!({ "status": "processing" })))
}

fn text_field(name: &str, bytes: Vec<u8>) -> AppResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| AppError::BadRequest(format!("Field '{}' is not valid UTF-8", name)))
}

/// A blank numeric field means "use the default".
fn number_field<T: FromStr>(name: &str, bytes: Vec<u8>) -> AppResult<Option<T>> {
    let text = text_field(name, bytes)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| AppError::ValidationError(format!("Field '{}' must be a number, got '{}'", name, text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::inference::engine::{EngineHandle, EngineOutput, EngineOutputs, InferenceEngine, InferenceRequest};
    use crate::relay::channel::{ClientEvent, EventChannel};
    use crate::relay::conversation::ConversationState;
    use crate::relay::orchestrator::Orchestrator;
    use crate::synthesis::test_provider::{spawn_provider, Script};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::sync::{mpsc, Arc, Mutex};

    const BOUNDARY: &str = "relay-test-boundary";

    fn multipart(audio: Option<&[u8]>, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(audio) = audio {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            body.extend_from_slice(b"Content-Disposition: form-data; name=\"audio\"; filename=\"clip.wav\"\r\n");
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(audio);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in fields {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes());
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload(audio: Option<&[u8]>, fields: &[(&str, &str)]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/upload-audio")
            .insert_header(("content-type", format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(multipart(audio, fields))
    }

    fn app_state(config: AppConfig, engine: EngineHandle) -> AppState {
        let orchestrator = Orchestrator::new(&config, engine, ConversationState::new(), EventChannel::new(16));
        AppState::new(config, orchestrator)
    }

    struct Gated(Mutex<mpsc::Receiver<()>>);

    impl InferenceEngine for Gated {
        fn name(&self) -> String {
            "gated".to_string()
        }

        fn infer_stream(&self, _request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>> {
            self.0.lock().unwrap().recv()?;
            Ok(Box::new(std::iter::once(Ok(EngineOutput::Text("ok".to_string())))))
        }
    }

    #[actix_web::test]
    async fn test_upload_without_engine_returns_processing_then_error_event() {
        let state = app_state(AppConfig::default(), EngineHandle::empty());
        let channel = state.orchestrator.channel().clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/upload-audio", web::post().to(upload_audio)),
        )
        .await;

        let audio = [0u8; 1024];
        let request = upload(
            Some(&audio),
            &[("prompt", "<|audio|>hello"), ("max_new_tokens", "10"), ("temperature", "0")],
        );
        let body: serde_json::Value = test::call_and_read_body_json(&app, request.to_request()).await;
        assert_eq!(body, json!({"status": "processing"}));

        let mut subscriber = channel.subscribe().unwrap();
        assert_eq!(subscriber.pull().await, Some(ClientEvent::Error));
    }

    #[actix_web::test]
    async fn test_missing_audio_and_bad_numbers_are_validation_errors() {
        let state = app_state(AppConfig::default(), EngineHandle::empty());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/upload-audio", web::post().to(upload_audio)),
        )
        .await;

        let response = test::call_service(&app, upload(None, &[("prompt", "hello")]).to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let audio = [1u8; 64];
        let response = test::call_service(
            &app,
            upload(Some(&audio), &[("max_new_tokens", "lots")]).to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = test::call_service(
            &app,
            upload(Some(&audio), &[("max_new_tokens", "0")]).to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "validation_error");
    }

    #[actix_web::test]
    async fn test_second_upload_while_busy_is_conflict() {
        let provider = spawn_provider(Script::Echo).await;
        let mut config = AppConfig::default();
        config.synthesis = provider.config();
        let (open_gate, gate) = mpsc::channel();
        let state = app_state(config, EngineHandle::with_engine(Arc::new(Gated(Mutex::new(gate)))));
        let orchestrator = state.orchestrator.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/upload-audio", web::post().to(upload_audio)),
        )
        .await;

        let audio = [0u8; 256];
        let first = test::call_service(&app, upload(Some(&audio), &[]).to_request()).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = test::call_service(&app, upload(Some(&audio), &[]).to_request()).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = test::read_body_json(second).await;
        assert_eq!(body["error"]["type"], "session_busy");

        let active = orchestrator.current_session().unwrap();
        open_gate.send(()).unwrap();
        active.finished().await;
    }
}
