//! Session manager — owns the full lifecycle of a live conversation.
//!
//! [`SessionManager`] is the one object behind the whole pipeline: it holds
//! the device seams, the transport, the shared observable state, and the
//! single active session (if any).  All control flow funnels through two
//! operations:
//!
//! - [`start`] — capability probe → acquire microphone and speaker → connect
//!   the duplex session → spawn the frame pump and the event loop.
//! - [`stop`] — ordered, idempotent teardown, shared by user stop, remote
//!   close, transport error, and [`Drop`].
//!
//! # Teardown order
//!
//! The active session handle is cleared **first**, so any send racing the
//! teardown finds no session and silently drops its frame instead of
//! erroring into user-visible state.  Then: best-effort remote close →
//! pump/event tasks aborted → microphone released → playback stopped and
//! speaker released → transcripts and flags cleared.
//!
//! # Stale continuations
//!
//! Every asynchronous step captures the manager's epoch counter; teardown
//! increments it.  A continuation that resumes with a stale epoch (a connect
//! resolving after the user pressed stop, a frame arriving mid-teardown)
//! releases whatever it holds and exits without touching shared state.
//!
//! [`start`]: SessionManager::start
//! [`stop`]: SessionManager::stop

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{
    frame_to_payload, payload_to_chunk, AudioPayload, DecodedChunk, InputDevice, InputHandle,
    OutputDevice, OutputHandle, SharedScheduler,
};
use crate::config::{AudioSettings, SessionConfig};

use super::error::{is_credential_signature, SessionError};
use super::protocol::{build_setup_message, LiveEvent};
use super::state::{new_shared_state, SessionPhase, SessionState, SharedState};
use super::transport::{ClientMessage, LiveTransport};

/// Capacity of the capture-frame channel between the input device thread and
/// the frame pump.
const FRAME_CHANNEL_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// ActiveSession
// ---------------------------------------------------------------------------

/// Everything owned by one established (or establishing) session.  Taking
/// this out of the manager *is* the teardown trigger; each field then
/// releases exactly once.
struct ActiveSession {
    outbound: mpsc::Sender<ClientMessage>,
    input_handle: InputHandle,
    output_handle: OutputHandle,
    scheduler: SharedScheduler,
    pump_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Lifecycle owner of the streaming pipeline.
///
/// Construct once with the device and transport seams, share as
/// `Arc<SessionManager>`.  At most one session is active at a time.
pub struct SessionManager {
    session_config: SessionConfig,
    audio_settings: AudioSettings,
    input: Arc<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    transport: Arc<dyn LiveTransport>,
    state: SharedState,
    /// Incremented on every teardown; async continuations compare against
    /// their captured value and discard themselves when stale.
    epoch: Arc<AtomicU64>,
    active: Mutex<Option<ActiveSession>>,
    /// Back-reference handed to the pipeline tasks at spawn time.
    me: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        session_config: SessionConfig,
        audio_settings: AudioSettings,
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
        transport: Arc<dyn LiveTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            session_config,
            audio_settings,
            input,
            output,
            transport,
            state: new_shared_state(),
            epoch: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Shared observable state for UIs and the demo binary.
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Snapshot of the current observable state.
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// `true` while response audio is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.scheduler.lock().unwrap().is_speaking())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Start a live conversation.
    ///
    /// Probes capture and playback capability before acquiring anything,
    /// then acquires the speaker and microphone, connects the duplex
    /// session, and wires the pipeline.  On any failure the resources
    /// acquired so far are released, the error is recorded in the shared
    /// state, and the same error is returned.
    ///
    /// A stop that lands while `start` is still in flight wins: the late
    /// continuation releases everything quietly and `start` returns `Ok`.
    pub async fn start(&self) -> Result<(), SessionError> {
        // `self` is borrowed from a live Arc, so the upgrade succeeds.
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Ok(()),
        };
        {
            let st = self.state.lock().unwrap();
            if st.phase.is_active() {
                log::warn!("start requested while session is {}", st.phase.label());
                return Ok(());
            }
        }

        // Capability check: both ends must exist before anything is acquired
        // or any connection attempted.
        if let Err(e) = self.input.probe() {
            return Err(self.fail_start(SessionError::Unsupported(e.to_string())));
        }
        if let Err(e) = self.output.probe() {
            return Err(self.fail_start(SessionError::Unsupported(e.to_string())));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut st = self.state.lock().unwrap();
            st.phase = SessionPhase::Connecting;
            st.error = None;
            st.transcripts.clear();
            st.turn_active = false;
        }
        log::info!("session connecting");

        // Speaker first: scheduling must be ready before the first response
        // chunk can arrive.
        let output = Arc::clone(&self.output);
        let output_session = match tokio::task::spawn_blocking(move || output.open()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(self.fail_start(e.into())),
            Err(e) => {
                return Err(self.fail_start(SessionError::Unsupported(format!(
                    "playback open task failed: {e}"
                ))))
            }
        };
        if self.is_stale(epoch) {
            log::debug!("stopped during playback open; releasing");
            return Ok(());
        }

        // Microphone. A denial here surfaces as a session-establishment
        // failure and no connection is attempted.
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(FRAME_CHANNEL_CAPACITY);
        let input = Arc::clone(&self.input);
        let frame_samples = self.audio_settings.frame_samples;
        let input_handle =
            match tokio::task::spawn_blocking(move || input.open(frame_samples, frame_tx)).await {
                Ok(Ok(h)) => h,
                Ok(Err(e)) => return Err(self.fail_start(e.into())),
                Err(e) => {
                    return Err(self.fail_start(SessionError::Microphone(format!(
                        "capture open task failed: {e}"
                    ))))
                }
            };
        if self.is_stale(epoch) {
            log::debug!("stopped during microphone open; releasing");
            return Ok(());
        }

        // Duplex connection. No timeout: a hung attempt stays Connecting
        // until the remote responds or the user stops.
        let setup = build_setup_message(&self.session_config);
        let live = match self.transport.connect(setup).await {
            Ok(live) => live,
            Err(e) => return Err(self.fail_start(e)),
        };
        if self.is_stale(epoch) {
            log::debug!("stopped during connect; closing fresh session");
            let _ = live.outbound.try_send(ClientMessage::Close);
            return Ok(());
        }

        // The live path claims the shared output: whatever one-shot playback
        // was running stops here.
        let scheduler = Arc::clone(&output_session.scheduler);
        scheduler.lock().unwrap().stop_all();

        {
            let mut active = self.active.lock().unwrap();
            *active = Some(ActiveSession {
                outbound: live.outbound,
                input_handle,
                output_handle: output_session.handle,
                scheduler: Arc::clone(&scheduler),
                pump_task: None,
                event_task: None,
            });
        }

        let pump_task = tokio::spawn(pump_frames(Arc::clone(&me), frame_rx, epoch));
        let event_task = tokio::spawn(run_event_loop(me, live.events, scheduler, epoch));

        {
            let mut active = self.active.lock().unwrap();
            match active.as_mut() {
                Some(a) if !self.is_stale(epoch) => {
                    a.pump_task = Some(pump_task);
                    a.event_task = Some(event_task);
                }
                _ => {
                    // Torn down in the gap between install and spawn.
                    pump_task.abort();
                    event_task.abort();
                }
            }
        }

        Ok(())
    }

    /// Record a start failure, reset to idle, and hand the error back.
    /// Resources acquired before the failure are released by their RAII
    /// handles going out of scope in `start`.
    fn fail_start(&self, error: SessionError) -> SessionError {
        log::error!("session start failed: {error}");
        let mut st = self.state.lock().unwrap();
        st.error = Some(error.to_string());
        st.reset_to_idle();
        error
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    // -----------------------------------------------------------------------
    // stop / teardown
    // -----------------------------------------------------------------------

    /// Stop the session.  Idempotent; never an error.
    ///
    /// Synchronous: by the time this returns, the session handle is cleared,
    /// the microphone and speaker are released, playback is silent, and the
    /// state reads idle.  (Releasing the device threads can block for up to
    /// ~100 ms; avoid calling from a latency-critical callback.)
    pub fn stop(&self) {
        self.shutdown_with(None);
    }

    /// The single teardown path.  `error` is recorded as the user-visible
    /// message; `None` means a clean stop and clears any stale error from
    /// the session being stopped.
    fn shutdown_with(&self, error: Option<SessionError>) {
        // Invalidate in-flight continuations before anything else.
        self.epoch.fetch_add(1, Ordering::SeqCst);

        // (a) Clear the session handle first: sends racing this teardown
        // become silent no-ops from here on.
        let active = self.active.lock().unwrap().take();

        let was_active = {
            let mut st = self.state.lock().unwrap();
            let was = st.phase.is_active() || active.is_some();
            if was {
                st.phase = SessionPhase::Closing;
            }
            was
        };

        if let Some(mut a) = active {
            // (b) Best-effort remote close; failures are logged, not surfaced.
            if a.outbound.try_send(ClientMessage::Close).is_err() {
                log::debug!("remote close request not delivered (transport already gone)");
            }

            // Stop the pipeline tasks before joining device threads so the
            // capture thread's frame sends fail fast instead of backing up.
            if let Some(t) = a.pump_task.take() {
                t.abort();
            }
            if let Some(t) = a.event_task.take() {
                t.abort();
            }

            // (c)+(d) Release the microphone; the capture thread and its
            // callback are gone when this returns.
            a.input_handle.close();

            // (e) Silence and release playback.
            a.scheduler.lock().unwrap().stop_all();
            a.output_handle.close();
        }

        // (f)+(g) Transcripts and flags.
        let mut st = self.state.lock().unwrap();
        match error {
            Some(e) => st.error = Some(e.to_string()),
            None if was_active => st.error = None,
            None => {}
        }
        st.reset_to_idle();

        if was_active {
            log::info!("session stopped");
        }
    }

    // -----------------------------------------------------------------------
    // send / playback entry points
    // -----------------------------------------------------------------------

    /// Send one encoded microphone frame to the remote session.
    ///
    /// A no-op when no session is active — a capture callback firing during
    /// teardown lands here harmlessly.
    pub async fn send_audio(&self, payload: AudioPayload) {
        let outbound = self
            .active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.outbound.clone());

        match outbound {
            Some(tx) => {
                if tx.send(ClientMessage::Audio(payload)).await.is_err() {
                    log::debug!("frame dropped: transport closed");
                }
            }
            None => log::trace!("frame dropped: no active session"),
        }
    }

    /// Play one decoded chunk immediately, preempting the live stream
    /// (one-shot speech playback shares the output with the stream;
    /// last call wins).
    ///
    /// Returns `false` when no session (and therefore no output) is active.
    pub fn play_once(&self, chunk: &DecodedChunk) -> bool {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(a) => {
                a.scheduler.lock().unwrap().play_now(chunk);
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown_with(None);
    }
}

// ---------------------------------------------------------------------------
// Frame pump
// ---------------------------------------------------------------------------

/// Drain capture frames, encode, and hand them to the send path.  Exits when
/// the capture side closes the channel or the epoch goes stale.
async fn pump_frames(
    manager: Arc<SessionManager>,
    mut frame_rx: mpsc::Receiver<Vec<f32>>,
    epoch: u64,
) {
    while let Some(frame) = frame_rx.recv().await {
        if manager.is_stale(epoch) {
            return;
        }
        manager.send_audio(frame_to_payload(&frame)).await;
    }
    log::debug!("frame pump terminated");
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// The single task driving every state transition from remote events.
///
/// Processes events in delivery order; the playback scheduler relies on that
/// to keep its cursor monotonic.  Any event that ends the session funnels
/// into [`SessionManager::shutdown_with`], the same path as a user stop.
async fn run_event_loop(
    manager: Arc<SessionManager>,
    mut events: mpsc::Receiver<LiveEvent>,
    scheduler: SharedScheduler,
    epoch: u64,
) {
    let output_rate = manager.audio_settings.output_sample_rate;
    let mut ended = false;

    while let Some(event) = events.recv().await {
        if manager.is_stale(epoch) {
            return;
        }

        match event {
            LiveEvent::Opened => {
                let mut st = manager.state.lock().unwrap();
                if st.phase == SessionPhase::Connecting {
                    st.phase = SessionPhase::Open;
                    log::info!("session open");
                } else {
                    log::debug!("ignoring opened event in phase {}", st.phase.label());
                }
            }

            LiveEvent::Audio { data } => {
                match payload_to_chunk(&data, output_rate, 1) {
                    Ok(chunk) => {
                        manager.state.lock().unwrap().turn_active = true;
                        scheduler.lock().unwrap().enqueue(&chunk);
                    }
                    Err(e) => {
                        // Non-fatal: this chunk's audio is lost, the
                        // conversation continues.
                        let err = SessionError::Decode(e.to_string());
                        log::error!("{err}");
                        manager.state.lock().unwrap().error = Some(err.to_string());
                    }
                }
            }

            LiveEvent::InputTranscript(text) => {
                let mut st = manager.state.lock().unwrap();
                st.turn_active = true;
                st.transcripts.push_user(&text);
            }

            LiveEvent::OutputTranscript(text) => {
                let mut st = manager.state.lock().unwrap();
                st.turn_active = true;
                st.transcripts.push_assistant(&text);
            }

            LiveEvent::TurnComplete => {
                let mut st = manager.state.lock().unwrap();
                st.transcripts.clear();
                st.turn_active = false;
                log::debug!("turn complete");
            }

            LiveEvent::Interrupted => {
                log::debug!("interrupted: stopping playback");
                scheduler.lock().unwrap().stop_all();
            }

            LiveEvent::ServerError(message) => {
                let err = if is_credential_signature(&message) {
                    SessionError::Credential(message)
                } else {
                    SessionError::Transport(message)
                };
                manager.shutdown_with(Some(err));
                ended = true;
                break;
            }

            LiveEvent::Closed { code, reason } => {
                // 1000 = normal close, 1005 = no status present.
                let err = if code == 1000 || code == 1005 {
                    None
                } else {
                    Some(SessionError::AbnormalClose { code, reason })
                };
                manager.shutdown_with(err);
                ended = true;
                break;
            }

            LiveEvent::TransportError(message) => {
                let err = if is_credential_signature(&message) {
                    SessionError::Credential(message)
                } else {
                    SessionError::Transport(message)
                };
                manager.shutdown_with(Some(err));
                ended = true;
                break;
            }
        }
    }

    if !ended && !manager.is_stale(epoch) {
        // Event channel closed without a terminal event: the transport died.
        manager.shutdown_with(Some(SessionError::Transport(
            "connection ended unexpectedly".into(),
        )));
    }
    log::debug!("event loop terminated");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::audio::capture::{CaptureError, MockInput};
    use crate::audio::output::MockOutput;
    use crate::audio::{encode_base64, INPUT_MIME_TYPE, OUTPUT_SAMPLE_RATE};
    use crate::session::transport::MockTransport;

    /// Harness bundling the manager with the test-side ends of the mocks.
    struct Harness {
        manager: Arc<SessionManager>,
        input: Arc<MockInput>,
        output: Arc<MockOutput>,
        outbound_rx: mpsc::Receiver<ClientMessage>,
        event_tx: mpsc::Sender<LiveEvent>,
    }

    fn harness() -> Harness {
        let (session, outbound_rx, event_tx) = MockTransport::channel_pair();
        harness_with(
            Arc::new(MockInput::ok()),
            Arc::new(MockTransport::ok(session)),
            outbound_rx,
            event_tx,
        )
    }

    fn harness_with(
        input: Arc<MockInput>,
        transport: Arc<MockTransport>,
        outbound_rx: mpsc::Receiver<ClientMessage>,
        event_tx: mpsc::Sender<LiveEvent>,
    ) -> Harness {
        let output = Arc::new(MockOutput::ok(OUTPUT_SAMPLE_RATE));
        let manager = SessionManager::new(
            SessionConfig::default(),
            AudioSettings::default(),
            Arc::clone(&input) as Arc<dyn InputDevice>,
            Arc::clone(&output) as Arc<dyn OutputDevice>,
            transport as Arc<dyn LiveTransport>,
        );
        Harness {
            manager,
            input,
            output,
            outbound_rx,
            event_tx,
        }
    }

    /// Poll until `check` passes or ~500 ms elapse.
    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    /// One valid base64 PCM chunk of `duration` seconds at the output rate.
    fn audio_event_secs(duration: f64) -> LiveEvent {
        let frames = (duration * OUTPUT_SAMPLE_RATE as f64).round() as usize;
        let mut bytes = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            bytes.extend_from_slice(&8192i16.to_le_bytes());
        }
        LiveEvent::Audio {
            data: encode_base64(&bytes),
        }
    }

    // ---- start / open ------------------------------------------------------

    #[tokio::test]
    async fn start_then_opened_reaches_open_phase() {
        let h = harness();
        h.manager.start().await.unwrap();
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Connecting);

        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Open).await;
        assert!(h.manager.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let h = harness();
        h.manager.start().await.unwrap();
        // Second start neither errors nor disturbs the connecting session.
        h.manager.start().await.unwrap();
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Connecting);
    }

    // ---- capture → encode → send ------------------------------------------

    #[tokio::test]
    async fn captured_frames_are_encoded_and_sent() {
        let mut h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();

        let frame_tx = h.input.taken_tx.lock().unwrap().take().unwrap();
        for _ in 0..3 {
            frame_tx.send(vec![0.25; 4096]).await.unwrap();
        }

        for _ in 0..3 {
            let sent = tokio::time::timeout(Duration::from_secs(1), h.outbound_rx.recv())
                .await
                .expect("frame not forwarded")
                .expect("outbound channel closed");

            match sent {
                ClientMessage::Audio(payload) => {
                    assert_eq!(payload.mime_type, INPUT_MIME_TYPE);
                    // 4096 samples × 2 bytes, base64 = ceil(8192/3)×4
                    assert_eq!(payload.data.len(), 8192usize.div_ceil(3) * 4);
                }
                other => panic!("expected audio frame, got {other:?}"),
            }
        }
    }

    // ---- transcripts -------------------------------------------------------

    #[tokio::test]
    async fn transcripts_accumulate_and_clear_on_turn_complete() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();

        h.event_tx
            .send(LiveEvent::InputTranscript("how do you say ".into()))
            .await
            .unwrap();
        h.event_tx
            .send(LiveEvent::InputTranscript("jaguar?".into()))
            .await
            .unwrap();
        h.event_tx
            .send(LiveEvent::OutputTranscript("kaikusi".into()))
            .await
            .unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().transcripts.assistant == "kaikusi").await;

        let st = h.manager.snapshot();
        assert_eq!(st.transcripts.user, "how do you say jaguar?");
        assert!(st.turn_active);

        h.event_tx.send(LiveEvent::TurnComplete).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().transcripts.is_empty()).await;
        assert!(!h.manager.snapshot().turn_active);
        // The session itself stays open.
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Open);
    }

    // ---- response audio ----------------------------------------------------

    #[tokio::test]
    async fn response_audio_is_scheduled_for_playback() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();

        h.event_tx.send(audio_event_secs(0.05)).await.unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.is_speaking()).await;
        assert_eq!(h.output.scheduler.lock().unwrap().active_sources(), 1);
        assert!(h.manager.snapshot().turn_active);
    }

    #[tokio::test]
    async fn undecodable_chunk_is_non_fatal() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Open).await;

        h.event_tx
            .send(LiveEvent::Audio {
                data: "@@not-base64@@".into(),
            })
            .await
            .unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().error.is_some()).await;

        // Session still open and still processing events.
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Open);
        h.event_tx.send(audio_event_secs(0.02)).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.is_speaking()).await;
    }

    // ---- interruption ------------------------------------------------------

    #[tokio::test]
    async fn interruption_stops_playback_but_keeps_session() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        h.event_tx.send(audio_event_secs(0.5)).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.is_speaking()).await;

        h.event_tx.send(LiveEvent::Interrupted).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || !m.is_speaking()).await;

        assert_eq!(h.output.scheduler.lock().unwrap().active_sources(), 0);
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Open);
    }

    // ---- one-shot playback (shared output) ---------------------------------

    #[tokio::test]
    async fn play_once_preempts_stream_audio() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        h.event_tx.send(audio_event_secs(0.5)).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.is_speaking()).await;

        let one_shot = DecodedChunk::mono(vec![0.1; 2400], OUTPUT_SAMPLE_RATE);
        assert!(h.manager.play_once(&one_shot));

        // The stream source is gone; only the one-shot remains.
        assert_eq!(h.output.scheduler.lock().unwrap().active_sources(), 1);
        assert!(h.manager.is_speaking());
    }

    #[tokio::test]
    async fn play_once_without_session_is_refused() {
        let h = harness();
        let one_shot = DecodedChunk::mono(vec![0.1; 240], OUTPUT_SAMPLE_RATE);
        assert!(!h.manager.play_once(&one_shot));
    }

    // ---- closes and errors -------------------------------------------------

    #[tokio::test]
    async fn abnormal_close_sets_error_with_code_and_releases() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        h.event_tx.send(audio_event_secs(0.5)).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.is_speaking()).await;

        h.event_tx
            .send(LiveEvent::Closed {
                code: 1006,
                reason: "abnormal closure".into(),
            })
            .await
            .unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Idle).await;

        let st = h.manager.snapshot();
        let error = st.error.expect("abnormal close must surface an error");
        assert!(error.contains("1006"), "error missing close code: {error}");
        assert!(!h.manager.is_speaking());
        assert_eq!(h.output.scheduler.lock().unwrap().active_sources(), 0);
        assert!(st.transcripts.is_empty());
    }

    #[tokio::test]
    async fn normal_close_sets_no_error() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();

        h.event_tx
            .send(LiveEvent::Closed {
                code: 1000,
                reason: String::new(),
            })
            .await
            .unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Idle).await;
        assert!(h.manager.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn server_credential_error_is_classified() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();

        h.event_tx
            .send(LiveEvent::ServerError(
                "API key not valid. Please pass a valid API key.".into(),
            ))
            .await
            .unwrap();

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Idle).await;
        let error = h.manager.snapshot().error.unwrap();
        assert!(error.contains("credential"), "got: {error}");
    }

    // ---- teardown ----------------------------------------------------------

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Open).await;

        h.manager.stop();
        let after_first = h.manager.snapshot();
        h.manager.stop();
        let after_second = h.manager.snapshot();

        assert_eq!(after_first.phase, SessionPhase::Idle);
        assert_eq!(after_second.phase, SessionPhase::Idle);
        assert!(after_first.error.is_none());
        assert!(after_second.error.is_none());
    }

    #[tokio::test]
    async fn user_stop_produces_no_error() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.manager.stop();

        let st = h.manager.snapshot();
        assert_eq!(st.phase, SessionPhase::Idle);
        assert!(st.error.is_none());
    }

    #[tokio::test]
    async fn send_after_teardown_is_a_noop() {
        let h = harness();
        h.manager.start().await.unwrap();
        h.manager.stop();

        // Must neither panic nor reach a live transport.
        h.manager
            .send_audio(frame_to_payload(&[0.1; 4096]))
            .await;
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn stop_then_restart_reaches_open_again() {
        let (session1, outbound_rx1, event_tx1) = MockTransport::channel_pair();
        let (session2, _outbound_rx2, event_tx2) = MockTransport::channel_pair();
        let h = harness_with(
            Arc::new(MockInput::ok()),
            Arc::new(MockTransport::queue(vec![session1, session2])),
            outbound_rx1,
            event_tx1,
        );

        h.manager.start().await.unwrap();
        h.event_tx.send(LiveEvent::Opened).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Open).await;

        h.manager.stop();
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Idle);

        // The same manager accepts a fresh session.
        h.manager.start().await.unwrap();
        event_tx2.send(LiveEvent::Opened).await.unwrap();
        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Open).await;
        assert!(h.manager.snapshot().error.is_none());
    }

    // ---- establishment failures --------------------------------------------

    #[tokio::test]
    async fn missing_device_fails_before_any_acquisition() {
        let (session, outbound_rx, event_tx) = MockTransport::channel_pair();
        let h = harness_with(
            Arc::new(MockInput::denied(|| CaptureError::NoDevice)),
            Arc::new(MockTransport::ok(session)),
            outbound_rx,
            event_tx,
        );

        let err = h.manager.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Unsupported(_)));
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Idle);
        assert!(h.manager.snapshot().error.is_some());
    }

    #[tokio::test]
    async fn microphone_denial_resolves_to_idle_without_connecting() {
        let (session, outbound_rx, event_tx) = MockTransport::channel_pair();
        let h = harness_with(
            Arc::new(MockInput::denied(|| {
                CaptureError::Stream("permission denied".into())
            })),
            // A connect attempt would consume the session and succeed;
            // asserting a Microphone error proves it was never reached.
            Arc::new(MockTransport::ok(session)),
            outbound_rx,
            event_tx,
        );

        let err = h.manager.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Microphone(_)));

        let st = h.manager.snapshot();
        assert_eq!(st.phase, SessionPhase::Idle);
        assert!(st.error.unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_releases() {
        let (_, outbound_rx, event_tx) = MockTransport::channel_pair();
        let h = harness_with(
            Arc::new(MockInput::ok()),
            Arc::new(MockTransport::failing(SessionError::ConnectFailed(
                "dns failure".into(),
            ))),
            outbound_rx,
            event_tx,
        );

        let err = h.manager.start().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed(_)));
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Idle);
    }

    // ---- stop racing a slow connect ----------------------------------------

    #[tokio::test]
    async fn stop_during_connect_discards_late_session() {
        let (session, outbound_rx, event_tx) = MockTransport::channel_pair();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel();
        let h = harness_with(
            Arc::new(MockInput::ok()),
            Arc::new(MockTransport::gated(session, gate_rx)),
            outbound_rx,
            event_tx,
        );

        let manager = Arc::clone(&h.manager);
        let start_task = tokio::spawn(async move { manager.start().await });

        let m = Arc::clone(&h.manager);
        wait_until(move || m.snapshot().phase == SessionPhase::Connecting).await;

        // User cancels while the connect hangs; observable state flips
        // immediately and silently.
        h.manager.stop();
        let st = h.manager.snapshot();
        assert_eq!(st.phase, SessionPhase::Idle);
        assert!(st.error.is_none());

        // The connect now resolves; the stale continuation must discard the
        // session rather than resurrect it.
        gate_tx.send(()).unwrap();
        let result = start_task.await.unwrap();
        assert!(result.is_ok(), "user abort is not an error");
        assert_eq!(h.manager.snapshot().phase, SessionPhase::Idle);
        assert!(!h.manager.is_speaking());
    }
}
