//! 16-bit PCM codec for the live-session wire format.
//!
//! Outbound microphone frames are `f32` samples in `[-1.0, 1.0]`; the remote
//! session expects base64-encoded **16-bit signed little-endian PCM** at
//! 16 kHz mono.  Inbound response audio arrives the same way at 24 kHz mono.
//! This module converts both directions:
//!
//! ```text
//! f32 frame ──frame_to_payload──▶ AudioPayload { base64, mime }   (send)
//! base64    ──decode_base64────▶ bytes ──bytes_to_chunk──▶ DecodedChunk
//! ```
//!
//! Samples outside `[-1.0, 1.0]` are clamped (saturated) to the i16 range
//! rather than wrapped.

use base64::Engine;
use thiserror::Error;

/// Sample rate of outbound microphone audio in Hz.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound response audio in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME descriptor attached to every outbound audio payload.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

// ---------------------------------------------------------------------------
// PcmError
// ---------------------------------------------------------------------------

/// Errors from decoding inbound audio payloads.
#[derive(Debug, Clone, Error)]
pub enum PcmError {
    /// The base64 text could not be decoded.
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),

    /// The byte stream does not divide evenly into 16-bit frames for the
    /// declared channel count.  Truncating silently could mask upstream
    /// corruption, so this fails loudly instead.
    #[error("PCM byte length {len} is not a whole number of {channels}-channel 16-bit frames")]
    RaggedFrame { len: usize, channels: u16 },

    /// Channel count of zero makes the frame count undefined.
    #[error("PCM payload declared zero channels")]
    NoChannels,
}

// ---------------------------------------------------------------------------
// base64
// ---------------------------------------------------------------------------

/// Encode raw bytes with the standard base64 alphabet.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard-alphabet base64 text back to bytes.
///
/// Round-trips any byte sequence produced by [`encode_base64`], including
/// zero-length input.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, PcmError> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| PcmError::Base64(e.to_string()))
}

// ---------------------------------------------------------------------------
// AudioPayload
// ---------------------------------------------------------------------------

/// One encoded microphone frame, ready for transmission.
///
/// Immutable once created; the send path owns it and discards it after the
/// frame has been handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    /// Base64 of 16-bit signed little-endian PCM samples.
    pub data: String,
    /// Always [`INPUT_MIME_TYPE`] for microphone frames.
    pub mime_type: String,
}

/// Convert a mono `f32` frame into an [`AudioPayload`].
///
/// Each sample is scaled by 32 768 and clamped to the i16 range, so values
/// outside `[-1.0, 1.0]` saturate instead of wrapping.
pub fn frame_to_payload(samples: &[f32]) -> AudioPayload {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * 32_768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    AudioPayload {
        data: encode_base64(&bytes),
        mime_type: INPUT_MIME_TYPE.to_string(),
    }
}

// ---------------------------------------------------------------------------
// DecodedChunk
// ---------------------------------------------------------------------------

/// One decoded unit of response audio, owned by the playback scheduler until
/// its source finishes playing.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// De-interleaved samples, one `Vec<f32>` per channel, all the same
    /// length.
    pub channels: Vec<Vec<f32>>,
    /// Declared sample rate of the chunk in Hz.
    pub sample_rate: u32,
}

impl DecodedChunk {
    /// Build a mono chunk directly from samples (used by the non-streaming
    /// playback entry point and by tests).
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Number of sample frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Playback duration in seconds at the declared sample rate.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Interpret `bytes` as interleaved 16-bit signed little-endian PCM and
/// de-interleave into per-channel `f32` sample arrays normalized to
/// `[-1.0, 1.0)`.
///
/// # Errors
///
/// - [`PcmError::NoChannels`] when `channels == 0`.
/// - [`PcmError::RaggedFrame`] when `bytes.len()` is not divisible by
///   `2 * channels` — partial frames are rejected, never truncated.
pub fn bytes_to_chunk(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedChunk, PcmError> {
    if channels == 0 {
        return Err(PcmError::NoChannels);
    }
    let bytes_per_frame = 2 * channels as usize;
    if bytes.len() % bytes_per_frame != 0 {
        return Err(PcmError::RaggedFrame {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / bytes_per_frame;
    let mut out = vec![Vec::with_capacity(frames); channels as usize];

    for frame in bytes.chunks_exact(bytes_per_frame) {
        for (ch, sample) in frame.chunks_exact(2).enumerate() {
            let v = i16::from_le_bytes([sample[0], sample[1]]);
            out[ch].push(v as f32 / 32_768.0);
        }
    }

    Ok(DecodedChunk {
        channels: out,
        sample_rate,
    })
}

/// Decode a base64 payload straight into a [`DecodedChunk`].
pub fn payload_to_chunk(
    data: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedChunk, PcmError> {
    let bytes = decode_base64(data)?;
    bytes_to_chunk(&bytes, sample_rate, channels)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
