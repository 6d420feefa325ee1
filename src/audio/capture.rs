//! Microphone capture via `cpal`.
//!
//! [`InputDevice`] is the seam the session manager talks to: probe for a
//! usable microphone, then open it and receive **16 kHz mono frames** of
//! [`FRAME_SAMPLES`] samples over a tokio channel until the returned
//! [`InputHandle`] is closed.
//!
//! [`CpalInput`] is the production implementation.  cpal streams are not
//! `Send`, so the stream lives on a dedicated `audio-capture` OS thread that
//! drains the hardware callback, downmixes and resamples to the wire rate,
//! and runs the [`FrameTap`].  The handle owns a stop flag; closing it (or
//! dropping it) detaches the thread synchronously, after which no further
//! frames are produced.
//!
//! [`FRAME_SAMPLES`]: super::frame::FRAME_SAMPLES

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::mpsc;

use super::frame::FrameTap;
use super::pcm::INPUT_SAMPLE_RATE;
use super::resample::{mix_to_mono, resample};

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while probing or opening the microphone.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No input device found on the default audio host.  Surfaces as a
    /// capability error before any connection attempt.
    #[error("no input device found on the default audio host")]
    NoDevice,

    /// The device exists but refused to report a stream configuration,
    /// typically a permission or device-busy condition.
    #[error("failed to query input config: {0}")]
    DeviceConfig(String),

    /// The platform rejected the stream (permission denied, device busy,
    /// unsupported format).
    #[error("failed to start input stream: {0}")]
    Stream(String),
}

// ---------------------------------------------------------------------------
// InputHandle
// ---------------------------------------------------------------------------

/// Handle to a running capture thread.
///
/// [`close`](Self::close) (or drop) sets the stop flag and joins the thread;
/// the underlying cpal stream is dropped when the thread exits, releasing
/// the microphone.  Closing twice is a no-op.
pub struct InputHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl InputHandle {
    /// Stop the capture thread and release the microphone.  Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("audio-capture thread panicked during shutdown");
            }
        }
    }

    /// Handle with no backing thread, for test doubles.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl Drop for InputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHandle")
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .field("running", &self.thread.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// InputDevice trait
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe microphone seam.
///
/// Implementations must be `Send + Sync` so the session manager can hold
/// one behind an `Arc<dyn InputDevice>`.
pub trait InputDevice: Send + Sync {
    /// Cheap capability check: succeeds when a usable input device exists,
    /// without opening a stream.
    fn probe(&self) -> Result<(), CaptureError>;

    /// Acquire the microphone and deliver 16 kHz mono frames of
    /// `frame_samples` samples on `frame_tx` until the handle is closed.
    ///
    /// Blocking (waits for the stream to start); call from
    /// `tokio::task::spawn_blocking` in async contexts.
    fn open(
        &self,
        frame_samples: usize,
        frame_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<InputHandle, CaptureError>;
}

// Compile-time assertion: Box<dyn InputDevice> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn InputDevice>) {}
};

// ---------------------------------------------------------------------------
// CpalInput
// ---------------------------------------------------------------------------

/// One buffer of raw audio as delivered by the cpal callback, forwarded to
/// the capture thread for conversion.
struct RawBuffer {
    samples: Vec<f32>,
}

/// Production microphone implementation on the system default input device.
#[derive(Debug, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl InputDevice for CpalInput {
    fn probe(&self) -> Result<(), CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        device
            .default_input_config()
            .map_err(|e| CaptureError::DeviceConfig(e.to_string()))?;
        Ok(())
    }

    fn open(
        &self,
        frame_samples: usize,
        frame_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<InputHandle, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        // The thread reports stream startup success/failure back once.
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread(frame_samples, frame_tx, stop_thread, ready_tx);
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(InputHandle {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::Stream(
                    "capture thread exited before reporting readiness".into(),
                ))
            }
        }
    }
}

/// Body of the `audio-capture` thread: owns the cpal stream, converts raw
/// buffers to wire-rate frames, exits when the stop flag is set or the frame
/// receiver goes away.
fn capture_thread(
    frame_samples: usize,
    frame_tx: mpsc::Sender<Vec<f32>>,
    stop: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<(), CaptureError>>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(CaptureError::NoDevice));
            return;
        }
    };

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(CaptureError::DeviceConfig(e.to_string())));
            return;
        }
    };
    let channels = supported.channels();
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let (raw_tx, raw_rx) = std_mpsc::channel::<RawBuffer>();

    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            // Ignore send errors; the drain loop may already have exited.
            let _ = raw_tx.send(RawBuffer {
                samples: data.to_vec(),
            });
        },
        |err: cpal::StreamError| {
            log::error!("cpal input stream error: {err}");
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    log::info!("microphone capture started ({sample_rate} Hz, {channels} ch)");

    let mut tap = FrameTap::new(frame_samples);
    while !stop.load(Ordering::Relaxed) {
        match raw_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(raw) => {
                let mono = mix_to_mono(&raw.samples, channels);
                let converted = resample(&mono, sample_rate, INPUT_SAMPLE_RATE);
                for frame in tap.push(&converted) {
                    // blocking_send is safe from this non-async thread; a
                    // closed receiver means the session is gone.
                    if frame_tx.blocking_send(frame).is_err() {
                        log::debug!("frame receiver dropped, stopping capture");
                        return;
                    }
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("microphone capture stopped");
    // `stream` drops here, releasing the device and the OS mic indicator.
}

// ---------------------------------------------------------------------------
// MockInput  (test-only)
// ---------------------------------------------------------------------------

/// Test double implementing [`InputDevice`] without hardware.
///
/// `ok()` hands the frame sender back through `taken_tx` so the test can
/// inject frames; `denied(..)` simulates a permission failure.
#[cfg(test)]
pub(crate) struct MockInput {
    fail: Option<fn() -> CaptureError>,
    pub(crate) taken_tx: std::sync::Mutex<Option<mpsc::Sender<Vec<f32>>>>,
}

#[cfg(test)]
impl MockInput {
    pub(crate) fn ok() -> Self {
        Self {
            fail: None,
            taken_tx: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn denied(make: fn() -> CaptureError) -> Self {
        Self {
            fail: Some(make),
            taken_tx: std::sync::Mutex::new(None),
        }
    }
}

#[cfg(test)]
impl InputDevice for MockInput {
    fn probe(&self) -> Result<(), CaptureError> {
        match self.fail {
            // Probe passes even for `denied` mocks: permission failures only
            // show up when the stream is actually opened.
            Some(make) if matches!(make(), CaptureError::NoDevice) => Err(make()),
            _ => Ok(()),
        }
    }

    fn open(
        &self,
        _frame_samples: usize,
        frame_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<InputHandle, CaptureError> {
        if let Some(make) = self.fail {
            return Err(make());
        }
        *self.taken_tx.lock().unwrap() = Some(frame_tx);
        Ok(InputHandle::detached())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
