//! Wire types for the live bidirectional streaming protocol.
//!
//! The remote endpoint speaks JSON over a WebSocket:
//!
//! 1. the client opens the socket and sends one **setup** message (model,
//!    response modality, voice, system instruction, transcription toggles),
//! 2. the server answers `setupComplete`,
//! 3. the client streams microphone frames as `realtimeInput` audio blobs,
//! 4. the server streams `serverContent` messages carrying transcription
//!    fragments, response audio parts, turn-completion and interruption
//!    flags.
//!
//! [`parse_server_message`] flattens one inbound JSON frame into the
//! [`LiveEvent`]s it carries — a single frame can hold several (audio plus a
//! transcription fragment, for example).

use serde::Serialize;

use crate::audio::AudioPayload;
use crate::config::SessionConfig;

// ---------------------------------------------------------------------------
// Setup message (first frame on the wire)
// ---------------------------------------------------------------------------

/// Top-level session setup message.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(rename = "inputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(rename = "outputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty marker object; presence enables the corresponding transcription.
#[derive(Debug, Serialize)]
pub struct TranscriptionConfig {}

/// Build the setup message for a live audio conversation.
pub fn build_setup_message(config: &SessionConfig) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: config.system_instruction.as_ref().map(|text| {
                SystemInstruction {
                    parts: vec![TextPart { text: text.clone() }],
                }
            }),
            input_audio_transcription: config.input_transcription.then_some(TranscriptionConfig {}),
            output_audio_transcription: config
                .output_transcription
                .then_some(TranscriptionConfig {}),
        },
    }
}

// ---------------------------------------------------------------------------
// Realtime input (outbound audio)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: AudioBlob,
}

/// One audio blob: MIME descriptor plus base64 PCM.
#[derive(Debug, Serialize)]
pub struct AudioBlob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Wrap an encoded microphone frame for transmission.
pub fn build_audio_message(payload: &AudioPayload) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: AudioBlob {
                mime_type: payload.mime_type.clone(),
                data: payload.data.clone(),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// LiveEvent (inbound)
// ---------------------------------------------------------------------------

/// One event delivered by the remote session.
///
/// `Closed` and `TransportError` are synthesized by the transport layer when
/// the socket ends; everything else is parsed out of server frames.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Setup acknowledged — the session is open and streaming may begin.
    Opened,
    /// One chunk of response audio, still base64-encoded.
    Audio { data: String },
    /// Transcription fragment of the user's speech.
    InputTranscript(String),
    /// Transcription fragment of the assistant's speech.
    OutputTranscript(String),
    /// The assistant finished its response turn.
    TurnComplete,
    /// The user started speaking over the assistant; playback must stop.
    Interrupted,
    /// An error object from the server.
    ServerError(String),
    /// The socket closed.  Code 1000 is a normal close; anything else is
    /// abnormal and user-visible.
    Closed { code: u16, reason: String },
    /// The socket failed before closing cleanly.
    TransportError(String),
}

/// Parse one server JSON frame into the events it carries.
///
/// Unknown fields are ignored; a frame that is not valid JSON yields a
/// single [`LiveEvent::TransportError`].
pub fn parse_server_message(json_text: &str) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(LiveEvent::TransportError(format!(
                "unparseable server message: {e}"
            )));
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(LiveEvent::Opened);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(LiveEvent::InputTranscript(text.to_string()));
            }
        }
        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(LiveEvent::OutputTranscript(text.to_string()));
            }
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    events.push(LiveEvent::Audio {
                        data: data.to_string(),
                    });
                }
            }
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error");
        events.push(LiveEvent::ServerError(message.to_string()));
    }

    events
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{encode_base64, frame_to_payload};

    fn test_config() -> SessionConfig {
        SessionConfig::default()
    }

    // ---- setup message -----------------------------------------------------

    #[test]
    fn setup_message_carries_model_and_modality() {
        let msg = build_setup_message(&test_config());
        assert!(!msg.setup.model.is_empty());
        assert_eq!(msg.setup.generation_config.response_modalities, vec!["AUDIO"]);
    }

    #[test]
    fn setup_message_serializes_with_camel_case_keys() {
        let json = serde_json::to_string(&build_setup_message(&test_config())).unwrap();
        assert!(json.contains("\"setup\""));
        assert!(json.contains("generationConfig"));
        assert!(json.contains("responseModalities"));
        assert!(json.contains("prebuiltVoiceConfig"));
        assert!(json.contains("voiceName"));
    }

    #[test]
    fn transcription_toggles_control_presence() {
        let mut config = test_config();
        config.input_transcription = true;
        config.output_transcription = false;

        let json = serde_json::to_string(&build_setup_message(&config)).unwrap();
        assert!(json.contains("inputAudioTranscription"));
        assert!(!json.contains("outputAudioTranscription"));
    }

    #[test]
    fn missing_system_instruction_is_omitted() {
        let mut config = test_config();
        config.system_instruction = None;
        let json = serde_json::to_string(&build_setup_message(&config)).unwrap();
        assert!(!json.contains("systemInstruction"));
    }

    // ---- realtime input ----------------------------------------------------

    #[test]
    fn audio_message_wraps_payload() {
        let payload = frame_to_payload(&[0.0, 0.5, -0.5]);
        let json = serde_json::to_string(&build_audio_message(&payload)).unwrap();

        assert!(json.contains("realtimeInput"));
        assert!(json.contains("\"audio\""));
        assert!(json.contains("audio/pcm;rate=16000"));
        assert!(json.contains(&payload.data));
    }

    // ---- parse_server_message ----------------------------------------------

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert_eq!(events, vec![LiveEvent::Opened]);
    }

    #[test]
    fn parse_turn_complete() {
        let events = parse_server_message(r#"{"serverContent": {"turnComplete": true}}"#);
        assert_eq!(events, vec![LiveEvent::TurnComplete]);
    }

    #[test]
    fn parse_interrupted() {
        let events = parse_server_message(r#"{"serverContent": {"interrupted": true}}"#);
        assert_eq!(events, vec![LiveEvent::Interrupted]);
    }

    #[test]
    fn parse_audio_part() {
        let b64 = encode_base64(&[10u8, 20, 30, 40]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_message(&json);
        assert_eq!(events, vec![LiveEvent::Audio { data: b64 }]);
    }

    #[test]
    fn parse_multiple_audio_parts_in_order() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"data": "AAAA"}},
            {"inlineData": {"data": "BBBB"}}
        ]}}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![
                LiveEvent::Audio { data: "AAAA".into() },
                LiveEvent::Audio { data: "BBBB".into() },
            ]
        );
    }

    #[test]
    fn parse_input_transcription() {
        let events =
            parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": "wakaba"}}}"#);
        assert_eq!(events, vec![LiveEvent::InputTranscript("wakaba".into())]);
    }

    #[test]
    fn parse_output_transcription() {
        let events = parse_server_message(
            r#"{"serverContent": {"outputTranscription": {"text": "kaimen"}}}"#,
        );
        assert_eq!(events, vec![LiveEvent::OutputTranscript("kaimen".into())]);
    }

    #[test]
    fn parse_combined_frame_preserves_order() {
        let json = r#"{"serverContent": {
            "outputTranscription": {"text": "hello"},
            "modelTurn": {"parts": [{"inlineData": {"data": "AAAA"}}]},
            "turnComplete": true
        }}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![
                LiveEvent::OutputTranscript("hello".into()),
                LiveEvent::Audio { data: "AAAA".into() },
                LiveEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn parse_server_error() {
        let events = parse_server_message(r#"{"error": {"message": "quota exceeded"}}"#);
        assert_eq!(events, vec![LiveEvent::ServerError("quota exceeded".into())]);
    }

    #[test]
    fn parse_invalid_json_is_transport_error() {
        let events = parse_server_message("definitely not json");
        assert!(matches!(events[0], LiveEvent::TransportError(_)));
    }

    #[test]
    fn empty_transcription_fragments_are_dropped() {
        let events =
            parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": ""}}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let events = parse_server_message(r#"{"usageMetadata": {"totalTokenCount": 42}}"#);
        assert!(events.is_empty());
    }
}
