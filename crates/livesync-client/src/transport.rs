//! Live channel transports.
//!
//! [`Transport`] opens a [`LiveChannel`] to an address; the channel yields
//! text messages in arrival order until the peer closes it. [`WsTransport`]
//! is the WebSocket implementation used against a real backend.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::TransportError;

/// An open live channel.
#[async_trait]
pub trait LiveChannel: Send {
    /// Next text message. `None` once the peer closed the channel.
    async fn next_message(&mut self) -> Option<Result<String, TransportError>>;

    /// Ask the peer to close and wait for it to confirm.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Something that can open live channels.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Box<dyn LiveChannel>, TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    token: Option<String>,
}

impl WsTransport {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn LiveChannel>, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            address: address.to_string(),
            reason,
        };

        let mut request = address
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| connect_error(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        info!(address, status = ?response.status(), "connected to live channel");

        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveChannel for WsChannel {
    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    let len = data.len();
                    return Some(
                        String::from_utf8(data).map_err(|_| TransportError::UnexpectedFrame { len }),
                    );
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "peer closed live channel");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        }
        // Drain until the peer acknowledges the close frame.
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
