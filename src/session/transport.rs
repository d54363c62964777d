// Websocket transport seam: the engine only sees text frames
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::TransportError;

/// One open connection carrying JSON text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame, `None` once the peer closed the connection.
    /// Must be cancel-safe: the engine races it against timers.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// `tokio-tungstenite` client.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(%url, status = %response.status(), "websocket connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                None => return Ok(None),
            };
            match msg {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => return Err(TransportError::Receive(e.to_string())),
                },
                Message::Ping(payload) => {
                    trace!("ping frame, answering");
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                }
                Message::Close(frame) => {
                    debug!(?frame, "close frame");
                    return Ok(None);
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// `initial * 2^attempt` capped at `max`, plus 0-50% jitter.
pub(crate) fn calculate_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let base = initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(max);
    let jitter_frac = rand::random::<f64>() * 0.5;
    base + Duration::from_secs_f64(base.as_secs_f64() * jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        for attempt in 0..4 {
            let base = initial * 2u32.pow(attempt);
            let d = calculate_backoff(initial, max, attempt);
            assert!(d >= base && d <= base + base / 2, "attempt {attempt}: {d:?}");
        }
        let capped = calculate_backoff(initial, max, 30);
        assert!(capped >= max && capped <= max + max / 2);
    }
}
