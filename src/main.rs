//! # Speech Relay Backend - Main Application Entry Point
//!
//! An HTTP service that runs an uploaded audio clip through an inference engine,
//! turns the generated text into speech and streams that speech back to the
//! browser. The bundled engine is Whisper, so out of the box the generated text is
//! the clip's transcript:
//!
//! ```text
//! POST /upload-audio ─► inference engine ─► text deltas ─► TTS WebSocket
//!                                                              │
//! GET /response-events ◄── event channel ◄── audio fragments ◄─┘
//! ```
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The HTTP server, the synthesis socket and the relay all run on tokio
//! - **spawn_blocking**: Model inference is CPU-bound and runs on the blocking pool
//! - **Arc & locks**: Shared state handed to every request handler
//! - **static AtomicBool**: Process-wide shutdown flag set from the signal handler
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **state**: Shared application state and request metrics
//! - **relay**: Event channel, conversation history and the session orchestrator
//! - **inference**: Engine boundary, streaming adapter and the Whisper engine
//! - **synthesis**: Text-to-speech provider client
//! - **audio / device**: Upload decoding and compute device selection
//! - **handlers / health / middleware**: HTTP surface
//! - **error**: HTTP and session error types

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod inference;
mod middleware;
mod relay;
mod state;
mod synthesis;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use inference::{EngineHandle, WhisperEngine};
use relay::{ConversationState, EventChannel, Orchestrator};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Starts loading the model** in the background; uploads that arrive before it
///    is ready fail through the event stream instead of blocking
/// 4. **Builds the orchestrator** and the shared application state
/// 5. **Runs the HTTP server** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.synthesis.api_key.is_empty() {
        warn!("No speech provider API key configured (set ELEVENLABS_API_KEY)");
    }

    let engine = EngineHandle::empty();
    spawn_engine_loader(&config, engine.clone());

    let channel = EventChannel::new(config.relay.event_capacity);
    let orchestrator = Orchestrator::new(&config, engine, ConversationState::new(), channel.clone());
    let app_state = AppState::new(config.clone(), orchestrator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order of registration for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Relay endpoints used by the browser client
            .route("/upload-audio", web::post().to(handlers::upload_audio))
            .route("/upload-audio/", web::post().to(handlers::upload_audio))
            .route("/reset-conversation", web::post().to(handlers::reset_conversation))
            .route("/response-events", web::get().to(handlers::response_events))
            .route("/status", web::get().to(health::status))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Ends open event streams once their backlog is drained.
            channel.close();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "speech_relay_backend=trace")
/// - If not set, defaults to "speech_relay_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Load the configured model off the request path and install it when ready.
///
/// A failed load is logged and leaves the engine slot empty; the server keeps
/// running and sessions fail with an engine-unavailable error.
fn spawn_engine_loader(config: &AppConfig, engine: EngineHandle) {
    let inference = config.inference.clone();
    tokio::spawn(async move {
        match WhisperEngine::load(&inference).await {
            Ok(whisper) => engine.install(Arc::new(whisper)),
            Err(e) => error!(model = %inference.model, "Failed to load inference engine: {:#}", e),
        }
    });
}

/// Listen for SIGTERM and SIGINT and set the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
