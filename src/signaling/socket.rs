use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::SignalError;
use crate::protocol::ParticipantId;

/// One live transport connection. Implementations surface closure by
/// returning `None` from [`recv`](SignalingSocket::recv); transport-level
/// errors are treated the same as closure.
#[async_trait]
pub trait SignalingSocket: Send {
    async fn send(&mut self, frame: String) -> Result<(), SignalError>;
    async fn recv(&mut self) -> Option<String>;
    async fn close(&mut self);
}

/// Opens transport connections for a given participant. The participant
/// identifier is a connection-time parameter; the relay registers the
/// connection under it.
#[async_trait]
pub trait SignalingDialer: Send + Sync {
    async fn dial(&self, participant: ParticipantId) -> Result<Box<dyn SignalingSocket>, SignalError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketDialer {
    base: Url,
}

impl WebSocketDialer {
    pub fn new(base: &str) -> Result<Self, SignalError> {
        let base = Url::parse(base).map_err(|err| SignalError::Dial(format!("invalid relay url {base}: {err}")))?;
        Ok(Self { base })
    }

    fn endpoint(&self, participant: ParticipantId) -> Result<Url, SignalError> {
        let mut url = self.base.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalError::Dial(format!("unsupported relay scheme {other}")));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalError::Dial("invalid websocket scheme".into()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SignalError::Dial("cannot mutate relay url path".into()))?;
            segments.pop_if_empty();
            segments.push("ws");
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("participant", &participant.to_string());
        Ok(url)
    }
}

#[async_trait]
impl SignalingDialer for WebSocketDialer {
    async fn dial(&self, participant: ParticipantId) -> Result<Box<dyn SignalingSocket>, SignalError> {
        let url = self.endpoint(participant)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalError::Dial(format!("websocket connect failed: {err}")))?;
        let (write, read) = stream.split();
        Ok(Box::new(WebSocketSignalingSocket { write, read }))
    }
}

struct WebSocketSignalingSocket {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SignalingSocket for WebSocketSignalingSocket {
    async fn send(&mut self, frame: String) -> Result<(), SignalError> {
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|_| SignalError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<String> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => {
                    if let Ok(text) = String::from_utf8(data) {
                        return Some(text);
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target = "signaling", error = %err, "websocket error");
                    return None;
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_participant_and_ws_scheme() {
        let dialer = WebSocketDialer::new("https://relay.example.com/signal").unwrap();
        let url = dialer.endpoint(42).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/signal/ws");
        assert_eq!(url.query(), Some("participant=42"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let dialer = WebSocketDialer::new("ftp://relay.example.com").unwrap();
        assert!(dialer.endpoint(1).is_err());
    }
}
