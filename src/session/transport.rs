//! Duplex transport over WebSocket.
//!
//! [`LiveTransport`] is the seam between the session manager and the
//! network.  `connect` resolves to a [`LiveSession`]: a sender for outbound
//! [`ClientMessage`]s and a receiver of inbound [`LiveEvent`]s.  The manager
//! never touches the socket; the transport owns two loops:
//!
//! - **outbound** — drains the client channel, serializes frames, writes to
//!   the socket sink; a `Close` request sends a WebSocket close and exits.
//! - **inbound** — reads socket frames, parses them into events, forwards
//!   them; socket close and failure are themselves delivered as events
//!   ([`LiveEvent::Closed`] / [`LiveEvent::TransportError`]) so the state
//!   machine sees every ending uniformly.
//!
//! The endpoint sends JSON in **Binary** WebSocket frames as well as Text;
//! binary frames starting with `{` are parsed as server messages.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::audio::AudioPayload;

use super::error::{is_credential_signature, SessionError};
use super::protocol::{build_audio_message, parse_server_message, LiveEvent, SetupMessage};

/// Capacity of the outbound frame channel.  At one 4096-sample frame per
/// 256 ms, 64 slots hold roughly 16 s of audio; the pump awaits capacity
/// beyond that rather than dropping frames.
const OUTBOUND_CAPACITY: usize = 64;

/// Capacity of the inbound event channel.
const INBOUND_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// ClientMessage / LiveSession
// ---------------------------------------------------------------------------

/// Outbound message from the client side of the session.
#[derive(Debug)]
pub enum ClientMessage {
    /// One encoded microphone frame.
    Audio(AudioPayload),
    /// Request a graceful close of the connection.
    Close,
}

/// An established duplex session: send [`ClientMessage`]s, receive
/// [`LiveEvent`]s.  Dropping both ends tears the socket down.
pub struct LiveSession {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub events: mpsc::Receiver<LiveEvent>,
}

// ---------------------------------------------------------------------------
// LiveTransport trait
// ---------------------------------------------------------------------------

/// Async seam for establishing duplex sessions.
///
/// Implementations must be `Send + Sync` so the manager can hold one behind
/// an `Arc<dyn LiveTransport>`.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a connection, deliver `setup`, and return the live channel pair.
    ///
    /// No timeout is applied here: a hung attempt stays pending until the
    /// remote responds or the caller abandons the future.
    async fn connect(&self, setup: SetupMessage) -> Result<LiveSession, SessionError>;
}

// ---------------------------------------------------------------------------
// WsTransport
// ---------------------------------------------------------------------------

/// Production transport over `tokio-tungstenite`.
pub struct WsTransport {
    endpoint: String,
    api_key: String,
}

impl WsTransport {
    /// `endpoint` is the wss URL of the bidirectional streaming service;
    /// `api_key` is appended as the `key` query parameter.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LiveTransport for WsTransport {
    async fn connect(&self, setup: SetupMessage) -> Result<LiveSession, SessionError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        let (mut ws, _response) = connect_async(&url).await.map_err(classify_connect_error)?;

        let setup_json = serde_json::to_string(&setup)
            .map_err(|e| SessionError::ConnectFailed(format!("setup serialization: {e}")))?;
        ws.send(WsMessage::Text(setup_json))
            .await
            .map_err(|e| SessionError::ConnectFailed(format!("setup send: {e}")))?;

        log::info!("duplex session connecting (model {})", setup.setup.model);

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(INBOUND_CAPACITY);

        tokio::spawn(outbound_loop(outbound_rx, sink));
        tokio::spawn(inbound_loop(stream, event_tx));

        Ok(LiveSession {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}

/// Distinguish credential rejections from plain connection failures.
fn classify_connect_error(e: tokio_tungstenite::tungstenite::Error) -> SessionError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    if let WsError::Http(ref response) = e {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return SessionError::Credential(format!("handshake rejected with HTTP {status}"));
        }
    }
    let text = e.to_string();
    if is_credential_signature(&text) {
        SessionError::Credential(text)
    } else {
        SessionError::ConnectFailed(text)
    }
}

type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Drain the client channel into the socket.
async fn outbound_loop(mut rx: mpsc::Receiver<ClientMessage>, mut sink: WsSink) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ClientMessage::Audio(payload) => {
                let frame = build_audio_message(&payload);
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sink.send(WsMessage::Text(json)).await.is_err() {
                            log::warn!("socket send failed, closing outbound loop");
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to serialize audio frame: {e}"),
                }
            }
            ClientMessage::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    log::debug!("outbound loop terminated");
}

/// Read socket frames and forward them as [`LiveEvent`]s.
async fn inbound_loop(mut stream: WsStream, event_tx: mpsc::Sender<LiveEvent>) {
    let mut ending_delivered = false;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if forward_events(&event_tx, parse_server_message(&text)).await.is_err() {
                    return;
                }
            }
            Ok(WsMessage::Binary(data)) => {
                // The service sends JSON in binary frames as well.
                if data.first() == Some(&b'{') {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if forward_events(&event_tx, parse_server_message(text)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                }
                log::warn!("skipping unexpected non-JSON binary frame ({} bytes)", data.len());
            }
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                log::info!("session closed by remote (code {code})");
                let _ = event_tx.send(LiveEvent::Closed { code, reason }).await;
                ending_delivered = true;
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
                // Handled by tungstenite.
            }
            Err(e) => {
                log::error!("socket error: {e}");
                let _ = event_tx.send(LiveEvent::TransportError(e.to_string())).await;
                ending_delivered = true;
                break;
            }
        }
    }

    if !ending_delivered {
        // Stream ended with neither a close frame nor an error.
        let _ = event_tx
            .send(LiveEvent::Closed {
                code: 1006,
                reason: "connection ended without close frame".into(),
            })
            .await;
    }
    log::debug!("inbound loop terminated");
}

/// Forward parsed events; `Err` means the receiver is gone and the loop
/// should exit.
async fn forward_events(
    event_tx: &mpsc::Sender<LiveEvent>,
    events: Vec<LiveEvent>,
) -> Result<(), ()> {
    for event in events {
        if event_tx.send(event).await.is_err() {
            log::debug!("event receiver dropped, closing inbound loop");
            return Err(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MockTransport  (test-only)
// ---------------------------------------------------------------------------

/// Test double that hands out a pre-built channel pair instead of opening a
/// socket, or fails with a configured error.
#[cfg(test)]
pub(crate) struct MockTransport {
    sessions: std::sync::Mutex<std::collections::VecDeque<LiveSession>>,
    fail: Option<SessionError>,
    gate: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

#[cfg(test)]
impl MockTransport {
    /// Transport whose single `connect` succeeds with `session`.
    pub(crate) fn ok(session: LiveSession) -> Self {
        Self::queue(vec![session])
    }

    /// Transport serving `sessions` to consecutive `connect` calls.
    pub(crate) fn queue(sessions: Vec<LiveSession>) -> Self {
        Self {
            sessions: std::sync::Mutex::new(sessions.into()),
            fail: None,
            gate: tokio::sync::Mutex::new(None),
        }
    }

    /// Transport whose `connect` always fails with `error`.
    pub(crate) fn failing(error: SessionError) -> Self {
        Self {
            sessions: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fail: Some(error),
            gate: tokio::sync::Mutex::new(None),
        }
    }

    /// Transport whose `connect` blocks until the paired sender fires,
    /// simulating a slow or hung connection attempt.
    pub(crate) fn gated(session: LiveSession, gate: tokio::sync::oneshot::Receiver<()>) -> Self {
        Self {
            sessions: std::sync::Mutex::new(vec![session].into()),
            fail: None,
            gate: tokio::sync::Mutex::new(Some(gate)),
        }
    }

    /// Build a mock session plus the test-side ends of its channels.
    pub(crate) fn channel_pair() -> (
        LiveSession,
        mpsc::Receiver<ClientMessage>,
        mpsc::Sender<LiveEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
        (
            LiveSession {
                outbound: outbound_tx,
                events: event_rx,
            },
            outbound_rx,
            event_tx,
        )
    }
}

#[cfg(test)]
#[async_trait]
impl LiveTransport for MockTransport {
    async fn connect(&self, _setup: SetupMessage) -> Result<LiveSession, SessionError> {
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SessionError::ConnectFailed("mock session already consumed".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_plain_failure_as_connect_failed() {
        let e = tokio_tungstenite::tungstenite::Error::ConnectionClosed;
        assert!(matches!(classify_connect_error(e), SessionError::ConnectFailed(_)));
    }

    #[tokio::test]
    async fn mock_transport_hands_out_session_once() {
        let (session, _out_rx, _ev_tx) = MockTransport::channel_pair();
        let transport = MockTransport::ok(session);
        let setup = super::super::protocol::build_setup_message(&crate::config::SessionConfig::default());

        assert!(transport.connect(setup).await.is_ok());

        let setup2 =
            super::super::protocol::build_setup_message(&crate::config::SessionConfig::default());
        assert!(matches!(
            transport.connect(setup2).await,
            Err(SessionError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn failing_transport_returns_configured_error() {
        let transport = MockTransport::failing(SessionError::Credential("bad key".into()));
        let setup = super::super::protocol::build_setup_message(&crate::config::SessionConfig::default());
        assert!(matches!(
            transport.connect(setup).await,
            Err(SessionError::Credential(_))
        ));
    }
}
