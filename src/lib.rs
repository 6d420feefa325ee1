//! voice-live — real-time voice conversation pipeline.
//!
//! The streaming core of a voice assistant client: it captures microphone
//! audio, encodes it for a duplex "live" session with a generative-AI
//! service, and plays the streamed response audio back gaplessly, under a
//! small state machine that survives interruptions, remote closes, and
//! errors without leaking a single device handle.
//!
//! # Layers
//!
//! - [`audio`] — PCM codec, capture chain, playback scheduler, device seams.
//! - [`session`] — wire protocol, WebSocket transport, session manager.
//! - [`config`] — TOML settings and platform paths.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_live::audio::{CpalInput, CpalOutput};
//! use voice_live::config::AppConfig;
//! use voice_live::session::{SessionManager, WsTransport};
//!
//! # async fn example() -> Result<(), voice_live::session::SessionError> {
//! let config = AppConfig::default();
//! let transport = WsTransport::new(config.session.endpoint.clone(), "api-key");
//!
//! let manager = SessionManager::new(
//!     config.session,
//!     config.audio,
//!     Arc::new(CpalInput::new()),
//!     Arc::new(CpalOutput::new()),
//!     Arc::new(transport),
//! );
//!
//! manager.start().await?;
//! // ... conversation runs; read manager.state() to render transcripts ...
//! manager.stop();
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod session;
