//! Agent audio decoding
//!
//! Agent audio arrives as base64 raw little-endian PCM with a mime hint such
//! as `audio/pcm;rate=16000`. Decoding wraps the payload in a canonical
//! 44-byte WAV header so it can be played or written out unchanged.

use std::sync::LazyLock;

use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sample rate assumed when the mime hint does not carry one
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Size of the synthesized RIFF/WAVE header
pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

static RATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"rate=(\d+)").unwrap_or_else(|e| unreachable!("invalid rate pattern: {e}"))
});

/// One fragment of agent audio, consumed exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub base64_payload: String,
    pub mime_hint: String,
}

impl AudioChunk {
    #[must_use]
    pub fn new(base64_payload: impl Into<String>, mime_hint: impl Into<String>) -> Self {
        Self {
            base64_payload: base64_payload.into(),
            mime_hint: mime_hint.into(),
        }
    }
}

/// A decoded chunk wrapped in a playable WAV container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayableAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Header followed by the raw payload
    pub container: Vec<u8>,
}

impl PlayableAudio {
    /// The PCM payload after the header
    #[must_use]
    pub fn pcm(&self) -> &[u8] {
        &self.container[WAV_HEADER_LEN..]
    }

    /// Payload length in bytes, as declared in the header
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.container.len() - WAV_HEADER_LEN
    }

    /// Playback duration of the payload
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        let bytes_per_sec = u64::from(self.sample_rate) * u64::from(self.channels) * 2;
        if bytes_per_sec == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_millis(self.data_len() as u64 * 1000 / bytes_per_sec)
    }

    /// Samples as normalized `f32`, ignoring a trailing odd byte
    #[must_use]
    pub fn samples_f32(&self) -> Vec<f32> {
        self.pcm()
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect()
    }
}

/// Extract the sample rate from a mime hint, defaulting to 24 kHz
#[must_use]
pub fn parse_sample_rate(mime_hint: &str) -> u32 {
    parse_sample_rate_or(mime_hint, DEFAULT_SAMPLE_RATE)
}

/// Extract the sample rate from a mime hint, or `fallback` if absent
#[must_use]
pub fn parse_sample_rate_or(mime_hint: &str, fallback: u32) -> u32 {
    RATE_PATTERN
        .captures(mime_hint)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|rate| *rate > 0)
        .unwrap_or(fallback)
}

/// Decode an agent audio chunk into a WAV container
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid base64 or too large
/// for a WAV header
pub fn decode(chunk: &AudioChunk) -> Result<PlayableAudio> {
    decode_with_default(chunk, DEFAULT_SAMPLE_RATE)
}

/// Like [`decode`], with a configurable rate for hints that carry none
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid base64, or if the
/// payload or sample rate is too large for a WAV header
pub fn decode_with_default(chunk: &AudioChunk, default_rate: u32) -> Result<PlayableAudio> {
    let sample_rate = parse_sample_rate_or(&chunk.mime_hint, default_rate);
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(chunk.base64_payload.trim())
        .map_err(|e| Error::Decode(format!("invalid base64 payload: {e}")))?;

    let container = wrap_pcm(&pcm, sample_rate)?;

    tracing::trace!(sample_rate, bytes = pcm.len(), "decoded agent audio chunk");

    Ok(PlayableAudio {
        sample_rate,
        channels: CHANNELS,
        container,
    })
}

/// Prefix raw mono 16-bit PCM with a WAV header
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload exceeds the 32-bit RIFF size limit
/// or the sample rate does not fit the header's byte rate field
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let data_len = u32::try_from(pcm.len())
        .ok()
        .filter(|len| *len <= u32::MAX - 36)
        .ok_or_else(|| Error::Decode(format!("payload too large: {} bytes", pcm.len())))?;

    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| Error::Decode(format!("sample rate out of range: {sample_rate}")))?;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&CHANNELS.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);

    Ok(out)
}
