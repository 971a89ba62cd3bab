//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_INFERENCE_MODEL, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The speech provider credential is additionally read from `ELEVENLABS_API_KEY`
//! when neither the file nor an `APP_` variable sets it.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

use crate::device::{DevicePreference, Precision};

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one part of the relay pipeline (HTTP server, inference
/// engine, speech synthesis provider, event relay), so a deployment can override
/// a single concern without touching the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub synthesis: SynthesisConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on (1-65535)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Inference engine configuration.
///
/// ## Fields:
/// - `model`: HuggingFace hub repository id (e.g. "openai/whisper-tiny") or a local directory
/// - `device`: Compute device preference ("auto", "cpu", "cuda", "metal")
/// - `dtype`: Numeric precision for model weights ("f32", "f16", "bf16")
/// - `default_prompt`: Prompt used when an upload does not carry one
/// - `max_new_tokens` / `temperature`: Default generation parameters
/// - `audio_marker`: Placeholder token that marks where the audio sits in the prompt
/// - `prepend_audio_marker`: Whether prompts lacking the marker get it prepended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model: String,
    pub device: String,
    pub dtype: String,
    pub default_prompt: String,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub audio_marker: String,
    pub prepend_audio_marker: bool,
    pub language: String,
    pub seed: u64,
}

/// Speech synthesis provider configuration.
///
/// ## Endpoint template:
/// `{voice_id}` and `{model_id}` inside `endpoint` are replaced before connecting,
/// so the same template works for any voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub endpoint: String,
    pub voice_id: String,
    pub model_id: String,
    pub api_key: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub connect_timeout_ms: u64,
}

/// Event relay tuning.
///
/// ## Fields:
/// - `event_capacity`: Maximum number of undelivered client events kept in memory
/// - `poll_interval_ms`: How often an idle event stream checks that its client is still there
/// - `chunk_buffer`: Text chunks buffered between the inference pump and the synthesis writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub event_capacity: usize,
    pub poll_interval_ms: u64,
    pub chunk_buffer: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7799,
            },
            inference: InferenceConfig {
                model: "openai/whisper-tiny".to_string(),
                device: "auto".to_string(),
                dtype: "f32".to_string(),
                default_prompt: "<|audio|>respond briefly and conversationally".to_string(),
                max_new_tokens: 50,
                temperature: 0.0,          // Deterministic output by default
                audio_marker: "<|audio|>".to_string(),
                prepend_audio_marker: true,
                language: "en".to_string(),
                seed: 299792458,
            },
            synthesis: SynthesisConfig {
                endpoint: "wss://api.elevenlabs.io/v1/text-to-speech/{voice_id}/stream-input?model_id={model_id}".to_string(),
                voice_id: "7NsaqHdLuKNFvEfjpUno".to_string(),
                model_id: "eleven_turbo_v2_5".to_string(),
                api_key: String::new(),
                stability: 0.5,
                similarity_boost: 0.8,
                connect_timeout_ms: 10_000,
            },
            relay: RelayConfig {
                event_capacity: 1024,
                poll_interval_ms: 1000,
                chunk_buffer: 64,
            },
        }
    }
}

impl SynthesisConfig {
    /// The provider URL with the voice and model placeholders filled in.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .replace("{voice_id}", &self.voice_id)
            .replace("{model_id}", &self.model_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and the provider API key
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_INFERENCE_MODEL=openai/whisper-base`: Override the model
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    /// - `ELEVENLABS_API_KEY=...`: Provider credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if config.synthesis.api_key.is_empty() {
            if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
                config.synthesis.api_key = key;
            }
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Generation defaults are usable (positive token budget, finite non-negative temperature)
    /// - Device and precision strings are recognised
    /// - The provider endpoint is a WebSocket URL
    /// - Relay buffers and intervals are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.inference.max_new_tokens == 0 {
            return Err(anyhow::anyhow!("Default max_new_tokens must be greater than 0"));
        }

        if !self.inference.temperature.is_finite() || self.inference.temperature < 0.0 {
            return Err(anyhow::anyhow!("Default temperature must be a non-negative number"));
        }

        self.inference.device.parse::<DevicePreference>().map_err(anyhow::Error::msg)?;
        self.inference.dtype.parse::<Precision>().map_err(anyhow::Error::msg)?;

        let endpoint = self.synthesis.resolved_endpoint();
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!("Synthesis endpoint must be a ws:// or wss:// URL, got {}", endpoint));
        }

        if self.relay.event_capacity == 0 {
            return Err(anyhow::anyhow!("Event capacity must be greater than 0"));
        }

        if self.relay.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        if self.relay.chunk_buffer == 0 {
            return Err(anyhow::anyhow!("Chunk buffer must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// A copy of the configuration that is safe to show to API clients.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.synthesis.api_key.is_empty() {
            copy.synthesis.api_key = "***".to_string();
        }
        copy
    }
}
