//! # Response Event Stream
//!
//! `GET /response-events` drains the event channel as `text/event-stream`.
//!
//! ## Frames:
//! - `data: <base64 audio>\n\n` for every audio fragment
//! - `event: close\ndata: audio processing complete\n\n` when a session completes
//! - `event: error\ndata: audio processing error\n\n` when a session fails
//! - `: keep-alive\n\n` whenever nothing arrived for one poll interval
//!
//! The response ends after the first terminal frame. A vanished client is noticed
//! when a keep-alive write fails, so within one poll interval; actix then drops
//! the stream and with it the subscription.

use crate::error::AppResult;
use crate::relay::channel::{Pull, KEEP_ALIVE_FRAME};
use crate::state::AppState;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::HttpResponse;
use futures_util::stream;
use tracing::debug;

pub async fn response_events(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let subscriber = state.orchestrator.channel().subscribe()?;
    let poll_interval = state.config.relay.poll_interval();
    debug!(poll_interval_ms = poll_interval.as_millis() as u64, "Event stream opened");

    let frames = stream::unfold(Some(subscriber), move |subscriber| async move {
        let mut subscriber = subscriber?;
        match subscriber.pull_within(poll_interval).await {
            Pull::Event(event) => {
                let frame = Bytes::from(event.to_sse());
                // The terminal frame is the last one; dropping the subscriber detaches it.
                let next = if event.is_terminal() { None } else { Some(subscriber) };
                Some((Ok::<_, actix_web::Error>(frame), next))
            }
            Pull::Idle => Some((Ok(Bytes::from_static(KEEP_ALIVE_FRAME.as_bytes())), Some(subscriber))),
            Pull::Closed => None,
        }
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::inference::engine::EngineHandle;
    use crate::relay::channel::{ClientEvent, EventChannel};
    use crate::relay::conversation::ConversationState;
    use crate::relay::orchestrator::Orchestrator;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use std::time::Duration;

    fn app_state(poll_interval_ms: u64) -> AppState {
        let mut config = AppConfig::default();
        config.relay.poll_interval_ms = poll_interval_ms;
        let orchestrator = Orchestrator::new(
            &config,
            EngineHandle::empty(),
            ConversationState::new(),
            EventChannel::new(16),
        );
        AppState::new(config, orchestrator)
    }

    #[actix_web::test]
    async fn test_buffered_events_are_framed_and_stream_ends_after_terminal() {
        let state = app_state(1000);
        let channel = state.orchestrator.channel().clone();
        channel.push(ClientEvent::Data("AAEC".to_string()));
        channel.push(ClientEvent::Data("AwQF".to_string()));
        channel.push(ClientEvent::Complete);
        channel.push(ClientEvent::Data("next-session".to_string()));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/response-events", web::get().to(response_events)),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/response-events").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/event-stream");

        let body = test::read_body(response).await;
        assert_eq!(
            body,
            Bytes::from_static(b"data: AAEC\n\ndata: AwQF\n\nevent: close\ndata: audio processing complete\n\n")
        );
        // The next session's events stay queued for the next subscriber.
        assert_eq!(channel.backlog_len(), 1);
        assert!(!channel.has_subscriber());
    }

    #[actix_web::test]
    async fn test_keep_alive_while_idle_then_error_frame() {
        let state = app_state(10);
        let channel = state.orchestrator.channel().clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/response-events", web::get().to(response_events)),
        )
        .await;

        let producer = channel.clone();
        actix_web::rt::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            producer.push(ClientEvent::Error);
        });

        let response = test::call_service(&app, test::TestRequest::get().uri("/response-events").to_request()).await;
        let body = test::read_body(response).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with(KEEP_ALIVE_FRAME));
        assert!(text.ends_with("event: error\ndata: audio processing error\n\n"));
    }

    #[actix_web::test]
    async fn test_second_subscriber_is_conflict() {
        let state = app_state(1000);
        let _first = state.orchestrator.channel().subscribe().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/response-events", web::get().to(response_events)),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/response-events").to_request()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
