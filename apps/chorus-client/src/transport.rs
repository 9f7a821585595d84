//! `tokio-tungstenite`-backed [`Transport`] implementation.
//!
//! The core only defines the `Transport` trait; a concrete WebSocket
//! transport is out of the core's scope and lives here instead. A spawned
//! reader task forwards frames to the session coordinator over a channel
//! of [`TransportEvent`]s rather than a multi-method callback interface.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::{ChorusError, Transport, TransportEvent, NORMAL_CLOSURE_CODE};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Live WebSocket transport. Holds only the send half directly; the
/// receive half is driven by a spawned task that forwards frames onto the
/// `TransportEvent` channel returned by [`TungsteniteConnector::connect`].
pub struct TungsteniteTransport {
    sink: Mutex<WsSink>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send_text(&self, text: String) -> bool {
        self.sink.lock().await.send(Message::Text(text)).await.is_ok()
    }

    async fn send_binary(&self, bytes: Bytes) -> bool {
        self.sink.lock().await.send(Message::Binary(bytes.to_vec())).await.is_ok()
    }

    async fn close(&self, code: u16, reason: String) {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
        let _ = self.sink.lock().await.send(Message::Close(Some(frame))).await;
    }
}

/// Establishes a fresh WebSocket connection for each connect/reconnect
/// attempt, per [`chorus_core::session::TransportConnector`].
pub struct TungsteniteConnector;

#[async_trait]
impl chorus_core::session::TransportConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), ChorusError> {
        let full_url = with_default_path_and_port(url);

        let (stream, _response) = tokio_tungstenite::connect_async(&full_url)
            .await
            .map_err(|error| ChorusError::TransportFailure {
                recoverable: is_recoverable_connect_error(&error),
                message: error.to_string(),
            })?;

        let (sink, mut stream) = stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let _ = event_tx.send(TransportEvent::Open);

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Text(text),
                    Ok(Message::Binary(bytes)) => TransportEvent::Binary(Bytes::from(bytes)),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NORMAL_CLOSURE_CODE, String::new()));
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(error) => {
                        let recoverable = is_recoverable_stream_error(&error);
                        let _ = event_tx.send(TransportEvent::Failure { recoverable, message: error.to_string() });
                        break;
                    }
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok((Arc::new(TungsteniteTransport { sink: Mutex::new(sink) }), event_rx))
    }
}

/// Appends the default `/sendspin` path and `8927` port when the configured
/// URL omits them, per the wire protocol's stated defaults.
fn with_default_path_and_port(url: &str) -> String {
    let mut url = url.to_string();
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        if !rest.contains(':') && !rest.contains('/') {
            url.push_str(":8927");
        }
    }
    if !url.contains("://") || !url[url.find("://").unwrap() + 3..].contains('/') {
        url.push_str("/sendspin");
    }
    url
}

fn is_recoverable_connect_error(error: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error as TErr;
    !matches!(error, TErr::Tls(_) | TErr::Http(_))
}

fn is_recoverable_stream_error(error: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error as TErr;
    matches!(error, TErr::Io(_) | TErr::ConnectionClosed | TErr::AlreadyClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_and_port_are_appended_when_missing() {
        assert_eq!(with_default_path_and_port("ws://speaker.local"), "ws://speaker.local:8927/sendspin");
    }

    #[test]
    fn explicit_port_and_path_are_preserved() {
        assert_eq!(
            with_default_path_and_port("ws://speaker.local:9000/custom"),
            "ws://speaker.local:9000/custom"
        );
    }
}
