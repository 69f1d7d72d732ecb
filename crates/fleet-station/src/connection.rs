//! WebSocket connection to the CSMS
//!
//! Thin wrapper over tokio-tungstenite: connects with the OCPP sub-protocol
//! header, splits the stream, and exposes a send half the engine shares
//! between its timers and request paths. The read half is consumed by the
//! engine's reader task.

use crate::error::{StationError, StationResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// Underlying WebSocket stream type
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Read half handed to the engine's reader task
pub type WsReader = SplitStream<WsStream>;

/// Close code reported when the peer sent no close frame
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Whether a close code ends the connection lifecycle (no reconnect)
pub fn is_normal_close(code: u16) -> bool {
    code == 1000 || code == CLOSE_NO_STATUS
}

/// Shared send half of a station's WebSocket
pub struct WsConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    sub_protocol: Option<String>,
}

impl WsConnection {
    /// Connect to the CSMS with the given sub-protocol, bounded by
    /// `handshake_timeout`
    pub async fn connect(
        url: &Url,
        sub_protocol: &str,
        handshake_timeout: Duration,
    ) -> StationResult<(Self, WsReader)> {
        info!(%url, sub_protocol, "Connecting to CSMS");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StationError::connection(format!("Invalid URL: {}", e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(sub_protocol)
                .map_err(|e| StationError::connection(e.to_string()))?,
        );

        let (stream, response) = timeout(handshake_timeout, connect_async(request))
            .await
            .map_err(|_| {
                StationError::connection(format!(
                    "Handshake timed out after {}s",
                    handshake_timeout.as_secs()
                ))
            })?
            .map_err(|e| StationError::connection(e.to_string()))?;

        let negotiated = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        debug!(?negotiated, "WebSocket connection established");

        let (sink, reader) = stream.split();
        Ok((
            Self {
                sink: Mutex::new(sink),
                sub_protocol: negotiated,
            },
            reader,
        ))
    }

    /// Sub-protocol the server accepted, if any
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// Send one text frame
    pub async fn send_text(&self, text: String) -> StationResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| StationError::connection(e.to_string()))
    }

    /// Send a protocol-level ping
    pub async fn send_ping(&self) -> StationResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| StationError::connection(e.to_string()))
    }

    /// Reply to a peer ping
    pub async fn send_pong(&self, data: Vec<u8>) -> StationResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Pong(data))
            .await
            .map_err(|e| StationError::connection(e.to_string()))
    }

    /// Close with a normal status code
    pub async fn close(&self) -> StationResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .map_err(|e| StationError::connection(e.to_string()))
    }
}
