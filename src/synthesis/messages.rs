//! JSON messages exchanged with the streaming text-to-speech provider.
//!
//! Outbound: one initialization message carrying the voice settings and the
//! credential, then one `{"text": ...}` per text increment, then `{"text": ""}`
//! to flush. Inbound: objects with a base64 `audio` fragment, an `isFinal`
//! marker, or both. Unknown fields (alignment data and so on) are ignored.

use crate::config::SynthesisConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

/// First message on a new connection.
#[derive(Debug, Clone, Serialize)]
pub struct InitMessage<'a> {
    /// The provider requires a single space here to open the stream
    pub text: &'static str,
    pub voice_settings: VoiceSettings,
    pub xi_api_key: &'a str,
}

impl<'a> InitMessage<'a> {
    pub fn new(config: &'a SynthesisConfig) -> Self {
        Self {
            text: " ",
            voice_settings: VoiceSettings {
                stability: config.stability,
                similarity_boost: config.similarity_boost,
            },
            xi_api_key: &config.api_key,
        }
    }
}

/// A text increment. An empty text tells the provider to flush and finish.
#[derive(Debug, Clone, Serialize)]
pub struct TextMessage<'a> {
    pub text: &'a str,
}

impl<'a> TextMessage<'a> {
    pub fn increment(text: &'a str) -> Self {
        Self { text }
    }

    pub fn flush() -> Self {
        Self { text: "" }
    }
}

/// Anything the provider sends us.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProviderMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The decoded audio fragment, if this message carries a non-empty one.
    pub fn audio_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        match self.audio.as_deref() {
            Some(encoded) if !encoded.is_empty() => STANDARD.decode(encoded).map(Some),
            _ => Ok(None),
        }
    }

    pub fn is_final(&self) -> bool {
        self.is_final.unwrap_or(false)
    }

    /// Provider-reported failure, if any.
    pub fn error_reason(&self) -> Option<String> {
        self.error.as_ref().map(|error| match &self.message {
            Some(message) => format!("{}: {}", error, message),
            None => error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::{json, Value};

    #[test]
    fn test_init_message_shape() {
        let mut config = AppConfig::default().synthesis;
        config.api_key = "secret".to_string();
        // Through a string so the f32 settings are compared as written on the wire.
        let wire = serde_json::to_string(&InitMessage::new(&config)).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            value,
            json!({
                "text": " ",
                "voice_settings": {"stability": 0.5, "similarity_boost": 0.8},
                "xi_api_key": "secret"
            })
        );
    }

    #[test]
    fn test_text_and_flush_messages() {
        assert_eq!(serde_json::to_string(&TextMessage::increment("Hi there")).unwrap(), r#"{"text":"Hi there"}"#);
        assert_eq!(serde_json::to_string(&TextMessage::flush()).unwrap(), r#"{"text":""}"#);
    }

    #[test]
    fn test_inbound_audio_and_final() {
        let audio = ProviderMessage::parse(r#"{"audio":"AAEC","isFinal":null,"normalizedAlignment":{}}"#).unwrap();
        assert_eq!(audio.audio_bytes().unwrap(), Some(vec![0, 1, 2]));
        assert!(!audio.is_final());

        let last = ProviderMessage::parse(r#"{"audio":null,"isFinal":true}"#).unwrap();
        assert_eq!(last.audio_bytes().unwrap(), None);
        assert!(last.is_final());
    }

    #[test]
    fn test_inbound_error_and_bad_audio() {
        let error = ProviderMessage::parse(r#"{"error":"auth_error","message":"invalid key"}"#).unwrap();
        assert_eq!(error.error_reason().as_deref(), Some("auth_error: invalid key"));

        let bad = ProviderMessage::parse(r#"{"audio":"not base64!"}"#).unwrap();
        assert!(bad.audio_bytes().is_err());
    }
}
