//! Session phases and shared observable state.
//!
//! [`SessionPhase`] is the connection lifecycle; [`SessionState`] is what a
//! caller (UI, demo binary) reads to render the conversation: phase, the
//! accumulating transcripts, whether a response turn is in flight, and the
//! last user-visible error.
//!
//! [`SharedState`] is `Arc<Mutex<SessionState>>` — cheap to clone, mutated
//! only by the session manager's event loop and teardown path.

use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

/// Connection lifecycle of the duplex session.
///
/// ```text
/// Idle ──start──▶ Connecting ──opened──▶ Open ──stop/close/error──▶ Closing ──▶ Idle
///                     └───────error───────────────────────────────────┘
/// ```
///
/// Within `Open`, response turns come and go (`turn_active` on
/// [`SessionState`]); they do not change the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session; ready to start.
    #[default]
    Idle,

    /// Microphone acquired (or being acquired) and the connection attempt is
    /// in flight.
    Connecting,

    /// The remote acknowledged setup; audio is streaming both ways.
    Open,

    /// Teardown in progress; transient.
    Closing,
}

impl SessionPhase {
    /// `true` while a session is being established or running.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Connecting | SessionPhase::Open)
    }

    /// Short human-readable label for a status line.
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Connecting => "Connecting",
            SessionPhase::Open => "Live",
            SessionPhase::Closing => "Closing",
        }
    }
}

// ---------------------------------------------------------------------------
// TranscriptBuffers
// ---------------------------------------------------------------------------

/// The two accumulating transcript strings of the current turn.
///
/// Fragments append as transcription events arrive; both clear together when
/// a turn completes or the session closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBuffers {
    /// What the user has said (input transcription).
    pub user: String,
    /// What the assistant has said (output transcription).
    pub assistant: String,
}

impl TranscriptBuffers {
    /// Append a fragment of the user transcript.
    pub fn push_user(&mut self, fragment: &str) {
        self.user.push_str(fragment);
    }

    /// Append a fragment of the assistant transcript.
    pub fn push_assistant(&mut self, fragment: &str) {
        self.assistant.push_str(fragment);
    }

    /// Clear both buffers as a unit.
    pub fn clear(&mut self) {
        self.user.clear();
        self.assistant.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.assistant.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Observable session state — the single source of truth for callers.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Current connection phase.
    pub phase: SessionPhase,

    /// `true` between the first event of a response turn and its
    /// `turn complete` signal.
    pub turn_active: bool,

    /// Accumulating transcripts of the current turn.
    pub transcripts: TranscriptBuffers,

    /// Last user-visible error message.
    ///
    /// `None` after a clean stop — a user-initiated stop never produces an
    /// error.  Decode failures land here without ending the session.
    pub error: Option<String>,
}

impl SessionState {
    /// Reset everything except the error message to the idle baseline.
    ///
    /// The error survives so the caller can still display what ended the
    /// previous session.
    pub fn reset_to_idle(&mut self) {
        self.phase = SessionPhase::Idle;
        self.turn_active = false;
        self.transcripts.clear();
    }
}

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// Thread-safe handle to [`SessionState`].
///
/// Lock for short critical sections only; never hold across `.await`.
pub type SharedState = Arc<Mutex<SessionState>>;

/// Construct a new [`SharedState`] in the idle phase.
pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(SessionState::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
