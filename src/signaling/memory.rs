//! In-process relay used by the integration tests, standing in for the real
//! signaling relay the same way the loopback transport pair stands in for a
//! network in the rest of the stack. Routes frames by `to`, confirms
//! registration, and reports unroutable targets with an `error` frame.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::SignalError;
use super::socket::{SignalingDialer, SignalingSocket};
use crate::protocol::{MessageKind, ParticipantId, RELAY, SignalingMessage};

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    clients: Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<String>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> Arc<dyn SignalingDialer> {
        Arc::new(MemoryDialer {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_registered(&self, participant: ParticipantId) -> bool {
        self.inner.clients.lock().contains_key(&participant)
    }

    /// Sever a client's connection, as a flaky network would. The client sees
    /// its inbound stream end and is expected to reconnect.
    pub fn drop_client(&self, participant: ParticipantId) {
        self.inner.clients.lock().remove(&participant);
    }
}

impl RelayInner {
    fn deliver(&self, to: ParticipantId, frame: String) -> bool {
        let clients = self.clients.lock();
        match clients.get(&to) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn route(&self, from: ParticipantId, frame: String) {
        let Ok(message) = serde_json::from_str::<SignalingMessage>(&frame) else {
            tracing::warn!(target = "signaling", from, "relay dropping malformed frame");
            return;
        };
        if message.to == RELAY {
            if message.kind == MessageKind::ConnectionTest {
                let confirm = SignalingMessage::new(MessageKind::ConnectionConfirmed, RELAY, from, "");
                if let Ok(text) = serde_json::to_string(&confirm) {
                    self.deliver(from, text);
                }
            }
            return;
        }
        if !self.deliver(message.to, frame) {
            let error = SignalingMessage::new(MessageKind::Error, RELAY, from, message.session_id)
                .with_data(serde_json::Value::String(format!(
                    "participant {} is not connected",
                    message.to
                )));
            if let Ok(text) = serde_json::to_string(&error) {
                self.deliver(from, text);
            }
        }
    }
}

struct MemoryDialer {
    inner: Arc<RelayInner>,
}

#[async_trait]
impl SignalingDialer for MemoryDialer {
    async fn dial(&self, participant: ParticipantId) -> Result<Box<dyn SignalingSocket>, SignalError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Re-registration replaces the previous connection.
        self.inner.clients.lock().insert(participant, tx.clone());
        let confirm = SignalingMessage::new(MessageKind::ConnectionConfirmed, RELAY, participant, "");
        let text = serde_json::to_string(&confirm)?;
        self.inner.deliver(participant, text);
        Ok(Box::new(MemorySocket {
            participant,
            inner: Arc::clone(&self.inner),
            inbox: rx,
            // Weak so `drop_client` severing the registration ends the stream.
            tx: tx.downgrade(),
        }))
    }
}

struct MemorySocket {
    participant: ParticipantId,
    inner: Arc<RelayInner>,
    inbox: mpsc::UnboundedReceiver<String>,
    tx: mpsc::WeakUnboundedSender<String>,
}

#[async_trait]
impl SignalingSocket for MemorySocket {
    async fn send(&mut self, frame: String) -> Result<(), SignalError> {
        self.inner.route(self.participant, frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        self.inbox.recv().await
    }

    async fn close(&mut self) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let mut clients = self.inner.clients.lock();
        // Only deregister if this connection is still the registered one.
        if let Some(current) = clients.get(&self.participant) {
            if current.same_channel(&tx) {
                clients.remove(&self.participant);
            }
        }
    }
}
