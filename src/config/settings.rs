//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across
//! threads.  The API key itself is never persisted — only the name of the
//! environment variable holding it.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

/// Default WebSocket endpoint of the bidirectional streaming service.
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Settings for the duplex live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Prebuilt voice name used for spoken responses.
    pub voice: String,
    /// System instructions framing the conversation.  `None` omits the
    /// field from setup entirely.
    pub system_instruction: Option<String>,
    /// Request transcription of the user's speech.
    pub input_transcription: bool,
    /// Request transcription of the assistant's speech.
    pub output_transcription: bool,
    /// WebSocket endpoint of the streaming service.
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-preview-native-audio-dialog".into(),
            voice: "Aoede".into(),
            system_instruction: Some(
                "You are a friendly guide to the indigenous languages of Guyana. \
                 Answer questions about Lokono, Makushi, Wapishana, Warrau, Akawaio \
                 and related languages and cultures, speaking clearly and briefly."
                    .into(),
            ),
            input_transcription: true,
            output_transcription: true,
            endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            api_key_env: "GEMINI_API_KEY".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioSettings
// ---------------------------------------------------------------------------

/// Settings for the audio pipeline.
///
/// The sample rates are part of the wire contract (16 kHz out, 24 kHz in)
/// and exist here so the numbers live in one place, not because other values
/// would work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Samples per outbound frame (one payload per frame).
    pub frame_samples: usize,
    /// Outbound microphone rate in Hz (must be 16 000).
    pub input_sample_rate: u32,
    /// Inbound response audio rate in Hz (must be 24 000).
    pub output_sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            frame_samples: 4096,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_live::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Live session settings.
    pub session: SessionConfig,
    /// Audio pipeline settings.
    pub audio: AudioSettings,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
