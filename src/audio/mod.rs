//! Audio pipeline — capture → PCM codec → duplex session → playback.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → mix_to_mono → resample(16 kHz) → FrameTap
//!           → frame_to_payload → session send
//!
//! session receive → decode_base64 → bytes_to_chunk (24 kHz)
//!                → Scheduler::enqueue → cpal output callback
//! ```
//!
//! The seams ([`InputDevice`], [`OutputDevice`]) keep the hardware at arm's
//! length; everything between them is pure and unit-tested.

pub mod capture;
pub mod frame;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod resample;

pub use capture::{CaptureError, CpalInput, InputDevice, InputHandle};
pub use frame::{FrameTap, FRAME_SAMPLES};
pub use output::{CpalOutput, OutputDevice, OutputHandle, OutputSession, PlaybackError};
pub use pcm::{
    bytes_to_chunk, decode_base64, encode_base64, frame_to_payload, payload_to_chunk,
    AudioPayload, DecodedChunk, PcmError, INPUT_MIME_TYPE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use playback::{new_shared_scheduler, Scheduler, SharedScheduler};
pub use resample::{mix_to_mono, resample};
