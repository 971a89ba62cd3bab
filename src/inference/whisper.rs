//! # Whisper Inference Engine
//!
//! The engine shipped with the relay: a Candle Whisper model that transcribes the
//! uploaded clip one decoder step at a time. Whisper is a speech recognizer, so the
//! "response" it streams is the transcript of what was said; the relay speaks the
//! user's own words back and records that transcript as the assistant turn. A
//! conversational model plugs in behind the same [`InferenceEngine`] trait.
//!
//! ## Loading Process:
//! 1. Resolve `config.json`, `tokenizer.json` and `model.safetensors`, either from a
//!    local directory or from the HuggingFace hub (cached locally by `hf-hub`)
//! 2. Pick the device and precision from configuration
//! 3. Memory-map the weights and build the model on the blocking pool
//!
//! ## Generation:
//! - Conversation history and the prompt text (audio marker removed) are supplied as
//!   `<|startofprev|>` context, so earlier turns steer the output
//! - Each `next()` on the output iterator runs exactly one decoder step and yields
//!   the newly completed text, or a marker for special tokens
//! - Temperature 0 decodes greedily; higher temperatures sample

use crate::config::InferenceConfig;
use crate::device::{DeviceManager, DevicePreference, Precision};
use crate::inference::engine::{EngineOutput, EngineOutputs, InferenceEngine, InferenceRequest};
use crate::audio::decode::decode_upload;
use crate::relay::conversation::Turn;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Paths to the three files a Whisper checkpoint needs.
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    /// Resolve the model reference: an existing directory is used as-is, anything
    /// else is treated as a HuggingFace hub repository id.
    async fn resolve(reference: &str) -> Result<Self> {
        let local = Path::new(reference);
        if local.is_dir() {
            debug!(path = %local.display(), "Using local model directory");
            return Ok(Self {
                config: local.join("config.json"),
                tokenizer: local.join("tokenizer.json"),
                weights: local.join("model.safetensors"),
            });
        }

        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }
        let api = builder.build().context("Failed to create HuggingFace API client")?;

        info!(repo = reference, "Fetching model files from the HuggingFace hub");
        let repo = api.model(reference.to_string());
        let config = repo
            .get("config.json")
            .await
            .with_context(|| format!("Failed to download config.json from {}", reference))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("Failed to download tokenizer.json from {}", reference))?;
        let weights = repo
            .get("model.safetensors")
            .await
            .with_context(|| format!("Failed to download model.safetensors from {}", reference))?;

        Ok(Self { config, tokenizer, weights })
    }
}

/// Ids of the control tokens the decoder prompt is built from.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    start_of_prev: Option<u32>,
    language: Option<u32>,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer, language: &str) -> Result<Self> {
        let required = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer is missing the {} token", token))
        };
        Ok(Self {
            sot: required("<|startoftranscript|>")?,
            eot: required("<|endoftext|>")?,
            transcribe: required("<|transcribe|>")?,
            no_timestamps: required("<|notimestamps|>")?,
            start_of_prev: tokenizer.token_to_id("<|startofprev|>"),
            language: tokenizer.token_to_id(&format!("<|{}|>", language)),
        })
    }
}

/// Everything that has to stay together while decoding.
struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
    device: Device,
    dtype: DType,
}

/// The Candle Whisper engine.
pub struct WhisperEngine {
    inner: Mutex<WhisperModel>,
    name: String,
    seed: u64,
    audio_marker: String,
}

impl WhisperEngine {
    /// Fetch and load the configured model.
    pub async fn load(config: &InferenceConfig) -> Result<Self> {
        let start_time = Instant::now();
        let preference: DevicePreference = config.device.parse().map_err(anyhow::Error::msg)?;
        let precision: Precision = config.dtype.parse().map_err(anyhow::Error::msg)?;
        let device = DeviceManager::get_device(preference);
        let dtype = precision.dtype_for(&device);

        info!(
            model = %config.model,
            device = DeviceManager::describe(&device),
            ?dtype,
            "Loading Whisper model"
        );

        let files = ModelFiles::resolve(&config.model).await?;
        let language = config.language.clone();
        let load_device = device.clone();

        let inner = tokio::task::spawn_blocking(move || -> Result<WhisperModel> {
            let model_config: Config = serde_json::from_reader(
                std::fs::File::open(&files.config)
                    .with_context(|| format!("Failed to open {}", files.config.display()))?,
            )?;
            let tokenizer = Tokenizer::from_file(&files.tokenizer)
                .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
            let special = SpecialTokens::from_tokenizer(&tokenizer, &language)?;
            let mel_filters = mel_filter_bank(model_config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

            // SAFETY: the weights file is not modified while it is mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &load_device)? };
            let model = m::model::Whisper::load(&vb, model_config.clone())?;

            Ok(WhisperModel {
                model,
                config: model_config,
                tokenizer,
                mel_filters,
                special,
                device: load_device,
                dtype,
            })
        })
        .await
        .context("Model loading task failed")??;

        info!(
            model = %config.model,
            load_time_s = format!("{:.2}", start_time.elapsed().as_secs_f64()),
            "Whisper model loaded"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            name: format!("whisper:{} ({})", config.model, DeviceManager::describe(&device)),
            seed: config.seed,
            audio_marker: config.audio_marker.clone(),
        })
    }
}

impl InferenceEngine for WhisperEngine {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn infer_stream(&self, request: InferenceRequest) -> Result<EngineOutputs<'_>> {
        let mut model = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let audio = decode_upload(&request.audio)?;
        debug!(
            seconds = format!("{:.2}", audio.duration_seconds()),
            source_rate = audio.source_rate,
            source_channels = audio.source_channels,
            "Decoded upload"
        );

        let context = previous_context(&request.history, &request.prompt, &self.audio_marker);
        let prompt_tokens = model.prompt_tokens(&context)?;
        let audio_features = model.encode(&audio.samples)?;

        let budget = model.config.max_target_positions.saturating_sub(prompt_tokens.len());
        let max_new_tokens = request.max_new_tokens.min(budget);
        let temperature = (request.temperature > 0.0).then_some(request.temperature);

        Ok(Box::new(WhisperTokens {
            logits: LogitsProcessor::new(self.seed, temperature, None),
            model,
            audio_features,
            tokens: prompt_tokens,
            text_tokens: Vec::new(),
            emitted_len: 0,
            steps: 0,
            max_new_tokens,
            done: false,
        }))
    }
}

impl WhisperModel {
    /// Decoder prompt: optional previous-text context, then the task tokens.
    fn prompt_tokens(&self, context: &str) -> Result<Vec<u32>> {
        let mut tokens = Vec::new();

        if let (Some(start_of_prev), false) = (self.special.start_of_prev, context.is_empty()) {
            let encoding = self
                .tokenizer
                .encode(context, false)
                .map_err(|e| anyhow!("Failed to tokenize prompt context: {}", e))?;
            let ids = encoding.get_ids();
            // Whisper only attends to the most recent half-context of previous text.
            let keep = (self.config.max_target_positions / 2).saturating_sub(1);
            let start = ids.len().saturating_sub(keep);
            tokens.push(start_of_prev);
            tokens.extend_from_slice(&ids[start..]);
        }

        tokens.push(self.special.sot);
        if let Some(language) = self.special.language {
            tokens.push(language);
        }
        tokens.push(self.special.transcribe);
        tokens.push(self.special.no_timestamps);
        Ok(tokens)
    }

    /// Log-mel front end plus encoder over the first 30 second window.
    fn encode(&mut self, samples: &[f32]) -> Result<Tensor> {
        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        let mel = mel.narrow(2, 0, frames.min(m::N_FRAMES))?.to_dtype(self.dtype)?;
        Ok(self.model.encoder.forward(&mel, true)?)
    }

    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
    }
}

/// Lazily decodes one token per `next()` call while holding the model lock.
struct WhisperTokens<'a> {
    model: MutexGuard<'a, WhisperModel>,
    logits: LogitsProcessor,
    audio_features: Tensor,
    tokens: Vec<u32>,
    text_tokens: Vec<u32>,
    emitted_len: usize,
    steps: usize,
    max_new_tokens: usize,
    done: bool,
}

impl WhisperTokens<'_> {
    fn step(&mut self) -> Result<Option<EngineOutput>> {
        if self.steps >= self.max_new_tokens {
            return Ok(None);
        }

        let tokens_t = Tensor::new(self.tokens.as_slice(), &self.model.device)?.unsqueeze(0)?;
        let flush = self.steps == 0;
        let ys = self.model.model.decoder.forward(&tokens_t, &self.audio_features, flush)?;
        let (_, seq_len, _) = ys.dims3()?;
        let logits = self
            .model
            .model
            .decoder
            .final_linear(&ys.i((..1, seq_len - 1..))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;
        let next = self.logits.sample(&logits)?;
        self.steps += 1;

        if next == self.model.special.eot {
            return Ok(None);
        }
        self.tokens.push(next);

        if next >= self.model.special.eot {
            return Ok(Some(EngineOutput::Marker));
        }

        self.text_tokens.push(next);
        let full = self.model.decode_text(&self.text_tokens)?;
        match text_delta(&full, self.emitted_len) {
            Some(delta) => {
                self.emitted_len = full.len();
                Ok(Some(EngineOutput::Text(delta.to_string())))
            }
            // Partial multi-byte character; wait for the next token.
            None => Ok(Some(EngineOutput::Marker)),
        }
    }
}

impl Iterator for WhisperTokens<'_> {
    type Item = Result<EngineOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(output)) => Some(Ok(output)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The not-yet-emitted tail of `full`, once it ends on a complete character.
fn text_delta(full: &str, emitted_len: usize) -> Option<&str> {
    if full.len() <= emitted_len || !full.is_char_boundary(emitted_len) {
        return None;
    }
    let delta = &full[emitted_len..];
    if delta.ends_with('\u{FFFD}') {
        return None;
    }
    Some(delta)
}

/// Previous-text context: earlier turns followed by the prompt instructions.
fn previous_context(history: &[Turn], prompt: &str, audio_marker: &str) -> String {
    let instructions = prompt.replace(audio_marker, " ");
    history
        .iter()
        .map(|turn| turn.content.as_str())
        .chain(std::iter::once(instructions.as_str()))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Slaney-normalised mel filter bank laid out as `[n_mels][n_fft / 2 + 1]`,
/// matching the filters Whisper was trained with.
fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;

    let hz_to_mel = |hz: f64| {
        if hz >= MIN_LOG_HZ {
            min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
        } else {
            hz / F_SP
        }
    };
    let mel_to_hz = |mel: f64| {
        if mel >= min_log_mel {
            MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
        } else {
            F_SP * mel
        }
    };

    let n_freqs = n_fft / 2 + 1;
    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (edges[band], edges[band + 1], edges[band + 2]);
        let norm = 2.0 / (upper - lower);
        for bin in 0..n_freqs {
            let freq = bin as f64 * sample_rate as f64 / n_fft as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0) * norm;
            filters[band * n_freqs + bin] = weight as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_filter_bank_shape_and_coverage() {
        let filters = mel_filter_bank(80, 400, 16_000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
        for band in filters.chunks(201) {
            assert!(band.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_text_delta_waits_for_complete_characters() {
        assert_eq!(text_delta("Hello", 0), Some("Hello"));
        assert_eq!(text_delta("Hello world", 5), Some(" world"));
        assert_eq!(text_delta("Hello", 5), None);
        assert_eq!(text_delta("caf\u{FFFD}", 3), None);
        assert_eq!(text_delta("café", 3), Some("é"));
    }

    #[test]
    fn test_previous_context_strips_marker_and_joins_history() {
        let history = vec![Turn::user("what time is it"), Turn::assistant("It is noon.")];
        assert_eq!(
            previous_context(&history, "<|audio|>answer politely", "<|audio|>"),
            "what time is it It is noon. answer politely"
        );
        assert_eq!(previous_context(&[], "<|audio|>", "<|audio|>"), "");
    }
}
