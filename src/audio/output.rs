//! Speaker output via `cpal`, pulling from the [`Scheduler`].
//!
//! [`OutputDevice`] mirrors the capture seam on the playback side: probe for
//! a usable output device, then open it and get back an [`OutputSession`] —
//! the RAII handle plus a [`SharedScheduler`] created at the device's native
//! rate.  The session event loop enqueues decoded chunks into the scheduler;
//! the device callback drains it.
//!
//! As with capture, the cpal stream is not `Send` and lives on a dedicated
//! `audio-playback` OS thread.  The callback asks the scheduler for mono
//! samples and fans them out across the device's interleaved channels.
//!
//! [`Scheduler`]: super::playback::Scheduler

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

use super::playback::{new_shared_scheduler, SharedScheduler};

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Errors that can occur while probing or opening the speaker.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// No output device found on the default audio host.
    #[error("no output device found on the default audio host")]
    NoDevice,

    /// The device refused to report a stream configuration.
    #[error("failed to query output config: {0}")]
    DeviceConfig(String),

    /// The platform rejected the stream.
    #[error("failed to start output stream: {0}")]
    Stream(String),
}

// ---------------------------------------------------------------------------
// OutputHandle / OutputSession
// ---------------------------------------------------------------------------

/// Handle to a running playback thread.  Closing (or dropping) stops the
/// thread and releases the device.  Closing twice is a no-op.
pub struct OutputHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl OutputHandle {
    /// Stop the playback thread and release the output device.  Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("audio-playback thread panicked during shutdown");
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

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandle")
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .field("running", &self.thread.is_some())
            .finish()
    }
}

/// An open playback path: the device handle and the scheduler feeding it.
pub struct OutputSession {
    pub handle: OutputHandle,
    pub scheduler: SharedScheduler,
}

// ---------------------------------------------------------------------------
// OutputDevice trait
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe speaker seam.
pub trait OutputDevice: Send + Sync {
    /// Cheap capability check: succeeds when a usable output device exists.
    fn probe(&self) -> Result<(), PlaybackError>;

    /// Open the device and return an [`OutputSession`] whose scheduler runs
    /// at the device's native rate.
    ///
    /// Blocking (waits for the stream to start); call from
    /// `tokio::task::spawn_blocking` in async contexts.
    fn open(&self) -> Result<OutputSession, PlaybackError>;
}

const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn OutputDevice>) {}
};

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

/// Production speaker implementation on the system default output device.
#[derive(Debug, Default)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl OutputDevice for CpalOutput {
    fn probe(&self) -> Result<(), PlaybackError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;
        device
            .default_output_config()
            .map_err(|e| PlaybackError::DeviceConfig(e.to_string()))?;
        Ok(())
    }

    fn open(&self) -> Result<OutputSession, PlaybackError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        // Thread reports (scheduler, or error) once the stream is up.
        let (ready_tx, ready_rx) =
            std_mpsc::channel::<Result<SharedScheduler, PlaybackError>>();

        let thread = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                playback_thread(stop_thread, ready_tx);
            })
            .map_err(|e| PlaybackError::Stream(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(scheduler)) => Ok(OutputSession {
                handle: OutputHandle {
                    stop,
                    thread: Some(thread),
                },
                scheduler,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(PlaybackError::Stream(
                    "playback thread exited before reporting readiness".into(),
                ))
            }
        }
    }
}

/// Body of the `audio-playback` thread: owns the cpal stream whose callback
/// drains the scheduler; parks until the stop flag is set.
fn playback_thread(
    stop: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<SharedScheduler, PlaybackError>>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(PlaybackError::NoDevice));
            return;
        }
    };

    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::DeviceConfig(e.to_string())));
            return;
        }
    };
    let channels = supported.channels() as usize;
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let scheduler = new_shared_scheduler(sample_rate);
    let scheduler_cb = Arc::clone(&scheduler);
    let mut mono = Vec::new();

    let stream = match device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            mono.resize(frames, 0.0);
            match scheduler_cb.lock() {
                Ok(mut sched) => sched.fill(&mut mono),
                // A poisoned lock means a panic elsewhere; emit silence.
                Err(_) => mono.fill(0.0),
            }
            for (i, frame) in data.chunks_exact_mut(channels).enumerate() {
                frame.fill(mono[i]);
            }
        },
        |err: cpal::StreamError| {
            log::error!("cpal output stream error: {err}");
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::Stream(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(PlaybackError::Stream(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(scheduler));
    log::info!("audio playback started ({sample_rate} Hz, {channels} ch)");

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("audio playback stopped");
    // `stream` drops here, releasing the device.
}

// ---------------------------------------------------------------------------
// MockOutput  (test-only)
// ---------------------------------------------------------------------------

/// Test double implementing [`OutputDevice`] without hardware.  The
/// scheduler it returns is driven manually by tests calling `fill`.
#[cfg(test)]
pub(crate) struct MockOutput {
    fail: bool,
    pub(crate) scheduler: SharedScheduler,
}

#[cfg(test)]
impl MockOutput {
    pub(crate) fn ok(sample_rate: u32) -> Self {
        Self {
            fail: false,
            scheduler: new_shared_scheduler(sample_rate),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            fail: true,
            scheduler: new_shared_scheduler(24_000),
        }
    }
}

#[cfg(test)]
impl OutputDevice for MockOutput {
    fn probe(&self) -> Result<(), PlaybackError> {
        if self.fail {
            Err(PlaybackError::NoDevice)
        } else {
            Ok(())
        }
    }

    fn open(&self) -> Result<OutputSession, PlaybackError> {
        if self.fail {
            return Err(PlaybackError::NoDevice);
        }
        Ok(OutputSession {
            handle: OutputHandle::detached(),
            scheduler: Arc::clone(&self.scheduler),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_handle_close_is_idempotent() {
        let mut handle = OutputHandle::detached();
        handle.close();
        handle.close();
        assert!(handle.stop.load(Ordering::Relaxed));
    }

    #[test]
    fn mock_unavailable_fails_probe_and_open() {
        let mock = MockOutput::unavailable();
        assert!(matches!(mock.probe(), Err(PlaybackError::NoDevice)));
        assert!(matches!(mock.open(), Err(PlaybackError::NoDevice)));
    }

    #[test]
    fn mock_ok_shares_one_scheduler() {
        let mock = MockOutput::ok(24_000);
        let session = mock.open().unwrap();
        assert_eq!(session.scheduler.lock().unwrap().sample_rate(), 24_000);
        // The mock keeps a handle to the same scheduler for test assertions.
        session.scheduler.lock().unwrap().stop_all();
        assert_eq!(mock.scheduler.lock().unwrap().active_sources(), 0);
    }

    #[test]
    fn playback_error_display() {
        assert!(PlaybackError::NoDevice.to_string().contains("no output device"));
    }
}
