//! Console demo — a live voice conversation from the terminal.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Read the API key from the configured environment variable.
//! 4. Build the [`SessionManager`] over the real devices and transport.
//! 5. Start the session and print transcript updates until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use voice_live::audio::{CpalInput, CpalOutput};
use voice_live::config::AppConfig;
use voice_live::session::{SessionManager, SessionPhase, WsTransport};

/// Print transcript lines as they grow, without repeating what has already
/// been shown.  Buffers reset every turn, so track the printed prefix.
#[derive(Default)]
struct TranscriptPrinter {
    user_shown: usize,
    assistant_shown: usize,
}

impl TranscriptPrinter {
    fn update(&mut self, user: &str, assistant: &str) {
        if user.len() < self.user_shown || assistant.len() < self.assistant_shown {
            // Turn completed: buffers were cleared.
            self.user_shown = 0;
            self.assistant_shown = 0;
            println!("---");
        }
        if user.len() > self.user_shown {
            print!("{}", &user[self.user_shown..]);
            self.user_shown = user.len();
            flush();
        }
        if assistant.len() > self.assistant_shown {
            print!("{}", &assistant[self.assistant_shown..]);
            self.assistant_shown = assistant.len();
            flush();
        }
    }
}

fn flush() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-live starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. API key
    let api_key = std::env::var(&config.session.api_key_env).map_err(|_| {
        anyhow::anyhow!(
            "API key not found — set the {} environment variable",
            config.session.api_key_env
        )
    })?;

    // 4. Pipeline
    let transport = WsTransport::new(config.session.endpoint.clone(), api_key);
    let manager = SessionManager::new(
        config.session,
        config.audio,
        Arc::new(CpalInput::new()),
        Arc::new(CpalOutput::new()),
        Arc::new(transport),
    );

    // 5. Run until Ctrl-C or the session ends.
    manager.start().await?;
    println!("Listening — speak into the microphone. Ctrl-C to quit.");

    let state = manager.state();
    let mut printer = TranscriptPrinter::default();
    let mut last_phase = SessionPhase::Idle;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                log::info!("Ctrl-C — stopping session");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                let snapshot = state.lock().unwrap().clone();
                printer.update(&snapshot.transcripts.user, &snapshot.transcripts.assistant);

                if snapshot.phase != last_phase {
                    log::info!("session phase: {}", snapshot.phase.label());
                    last_phase = snapshot.phase;
                }
                if snapshot.phase == SessionPhase::Idle {
                    // Remote close or error ended the session.
                    if let Some(error) = &snapshot.error {
                        eprintln!("session ended: {error}");
                    }
                    break;
                }
            }
        }
    }

    manager.stop();
    Ok(())
}
