//! Duplex live-session layer — protocol, transport, state machine.
//!
//! # Lifecycle
//!
//! ```text
//! SessionManager::start
//!   ├─ probe capture + playback capability
//!   ├─ open speaker  (Scheduler at device rate)
//!   ├─ open microphone (16 kHz mono frames)
//!   ├─ LiveTransport::connect → LiveSession
//!   ├─ spawn frame pump   (frames → payloads → sendRealtimeInput)
//!   └─ spawn event loop   (LiveEvents → state machine + playback)
//!
//! SessionManager::stop   ←  user stop / remote close / error / Drop
//! ```

pub mod error;
pub mod manager;
pub mod protocol;
pub mod state;
pub mod transport;

pub use error::{is_credential_signature, SessionError};
pub use manager::SessionManager;
pub use protocol::{build_audio_message, build_setup_message, parse_server_message, LiveEvent};
pub use state::{
    new_shared_state, SessionPhase, SessionState, SharedState, TranscriptBuffers,
};
pub use transport::{ClientMessage, LiveSession, LiveTransport, WsTransport};
