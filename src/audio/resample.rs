//! Channel mixing and sample-rate conversion utilities.
//!
//! The live session pins both wire rates: microphone audio goes out at
//! **16 kHz mono** and response audio arrives at **24 kHz mono**, while real
//! devices run at whatever rate cpal negotiated (commonly 44.1 or 48 kHz).
//! This module bridges the gap in both directions:
//!
//! 1. [`mix_to_mono`] — downmix interleaved capture buffers to mono.
//! 2. [`resample`] — linear-interpolation conversion between any two rates,
//!    used capture-side (device → 16 kHz) and playback-side (24 kHz →
//!    device).

// ---------------------------------------------------------------------------
// mix_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging channels.
///
/// The output length is `samples.len() / channels`.
///
/// * `channels == 1` returns the input as an owned `Vec` unchanged.
/// * `channels == 0` returns an empty vector.
///
/// # Example
///
/// ```rust
/// use voice_live::audio::mix_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, -0.2]; // L R L R
/// let mono = mix_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// assert!((mono[1] - 0.0).abs() < 1e-6);
/// ```
pub fn mix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `source_rate` Hz to `target_rate` Hz using
/// linear interpolation.
///
/// * Equal rates return the input unchanged (no interpolation performed).
/// * Empty input, or a zero rate on either side, returns an empty vector.
///
/// The output length is approximately
/// `samples.len() * target_rate / source_rate`.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return samples.to_vec();
    }

    if samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            // Linear interpolation between adjacent samples
            samples[idx] * (1.0 - frac as f32) + samples[idx + 1] * frac as f32
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
