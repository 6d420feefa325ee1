//! Session error taxonomy.
//!
//! Every failure inside the streaming pipeline is caught at the boundary of
//! the asynchronous operation that produced it and converted to one of the
//! kinds below; none propagate as panics.  A user-initiated stop is not an
//! error and never appears here.
//!
//! Nothing is retried automatically — retry is the user pressing start
//! again.

use thiserror::Error;

use crate::audio::{CaptureError, PlaybackError};

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// All errors a live session can surface to the caller.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// A required audio capability (capture or playback device/API) is
    /// missing.  Raised before any resource is acquired; not retryable in
    /// the same environment.
    #[error("audio is not supported in this environment: {0}")]
    Unsupported(String),

    /// Microphone access was denied or the device failed to open.  Raised
    /// during session establishment; retryable after the user grants
    /// access.
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    /// The duplex connection could not be established.
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    /// The established connection reported an error.
    #[error("connection error: {0}")]
    Transport(String),

    /// The connection closed with a non-normal close code.  The code and
    /// reason are preserved for display.
    #[error("session closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    /// The remote service rejected the credentials.  Callers should prompt
    /// for key reselection rather than display a generic failure.
    #[error("credential rejected: {0}")]
    Credential(String),

    /// A received audio chunk failed to decode.  Non-fatal: the session
    /// continues and only that chunk's audio is lost.
    #[error("audio chunk could not be decoded: {0}")]
    Decode(String),
}

impl SessionError {
    /// `true` for errors that end the session when they occur.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Decode(_))
    }
}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::NoDevice => SessionError::Unsupported(e.to_string()),
            CaptureError::DeviceConfig(_) | CaptureError::Stream(_) => {
                SessionError::Microphone(e.to_string())
            }
        }
    }
}

impl From<PlaybackError> for SessionError {
    fn from(e: PlaybackError) -> Self {
        SessionError::Unsupported(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Credential signature detection
// ---------------------------------------------------------------------------

/// Recognize the remote error signatures that mean "bad credentials" rather
/// than a generic transport failure, so the caller can prompt for key
/// reselection.
pub fn is_credential_signature(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("api key")
        || lower.contains("api_key_invalid")
        || lower.contains("unauthenticated")
        || lower.contains("permission_denied")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
