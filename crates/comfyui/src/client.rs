//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance.  Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket, then turn it into a
//! [`FrameStream`] of text frames.

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Text frames from one streaming connection.
///
/// The stream ends (`None`) after the socket is gone; a close handshake
/// is reported as [`StreamError::Closed`] first.
pub type FrameStream = BoxStream<'static, Result<String, StreamError>>;

/// Configuration handle for a ComfyUI instance.
///
/// Stores the WebSocket URL needed to open streaming connections.
/// Every call to [`connect`](Self::connect) yields an independent
/// connection.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
#[derive(Debug)]
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// Create a new client targeting a ComfyUI instance.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// `client_id` is appended as a query parameter; ComfyUI routes
    /// execution messages for prompts submitted under the same ID to
    /// this socket.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Convert the socket into a stream of text frames.
    ///
    /// Binary frames (preview images) and control frames are dropped.
    pub fn into_frames(self) -> FrameStream {
        let client_id = self.client_id;
        self.ws_stream
            .filter_map(move |msg| {
                let item = match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Binary(_)) => {
                        tracing::trace!(client_id = %client_id, "Ignoring binary message (preview image)");
                        None
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                    Ok(Message::Close(frame)) => {
                        tracing::info!(client_id = %client_id, ?frame, "ComfyUI WebSocket closed");
                        Some(Err(StreamError::Closed(format!("close frame: {frame:?}"))))
                    }
                    Err(e) => Some(Err(classify_ws_error(e))),
                };
                futures::future::ready(item)
            })
            .boxed()
    }
}

/// Map a receive error onto the recovery classes the consumer acts on.
fn classify_ws_error(e: tungstenite::Error) -> StreamError {
    match e {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_)
        | tungstenite::Error::Protocol(_) => StreamError::Closed(e.to_string()),
        tungstenite::Error::Capacity(_) => StreamError::Malformed(e.to_string()),
        other => StreamError::Fatal(other.to_string()),
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Errors yielded while reading a [`FrameStream`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The connection went away; reopen and resume.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// One frame could not be read; skip it and keep reading.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Anything else; the consumer should give up.
    #[error("Stream failure: {0}")]
    Fatal(String),
}
