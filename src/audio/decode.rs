//! # Upload Decoding
//!
//! Converts an uploaded clip into the 16 kHz mono `f32` samples the inference
//! engine consumes.
//!
//! ## Accepted inputs:
//! - **RIFF/WAV**: 8, 16 or 24-bit integer PCM and 32-bit float, any channel count and rate
//! - **Anything else**: treated as raw 16-bit little-endian mono PCM at 16 kHz
//!   (the format browser recorders stream by default)
//!
//! Multi-channel audio is averaged down to mono and other sample rates are
//! linearly resampled to 16 kHz.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Sample rate expected by the inference engine.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decoded, engine-ready audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    /// Sample rate and channel count of the upload before conversion
    pub source_rate: u32,
    pub source_channels: u16,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / TARGET_SAMPLE_RATE as f64
    }
}

/// Decode an upload into 16 kHz mono samples in `[-1.0, 1.0]`.
pub fn decode_upload(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(anyhow!("Audio data is empty"));
    }

    if is_riff_wave(bytes) {
        decode_wav(bytes)
    } else {
        decode_raw_pcm(bytes)
    }
}

fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).context("Failed to parse WAV upload")?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => return Err(anyhow!("WAV upload contains no samples")),
    };

    let channels = header.channel_count.max(1);
    let mono = downmix(&interleaved, channels as usize);
    let samples = resample_linear(&mono, header.sampling_rate, TARGET_SAMPLE_RATE);

    if samples.is_empty() {
        return Err(anyhow!("WAV upload contains no samples"));
    }

    Ok(DecodedAudio {
        samples,
        source_rate: header.sampling_rate,
        source_channels: channels,
    })
}

fn decode_raw_pcm(bytes: &[u8]) -> Result<DecodedAudio> {
    // A trailing odd byte cannot form a sample.
    let usable = bytes.len() - bytes.len() % 2;
    if usable == 0 {
        return Err(anyhow!("Audio data too short to contain a 16-bit sample"));
    }

    let mut pcm = vec![0i16; usable / 2];
    LittleEndian::read_i16_into(&bytes[..usable], &mut pcm);

    Ok(DecodedAudio {
        samples: pcm.into_iter().map(|s| s as f32 / 32768.0).collect(),
        source_rate: TARGET_SAMPLE_RATE,
        source_channels: 1,
    })
}

/// Average interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear interpolation resampler. Good enough for speech going into a
/// log-mel front end.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            let a = samples[index.min(last)];
            let b = samples[(index + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
