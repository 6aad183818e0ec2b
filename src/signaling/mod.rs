//! Managed, auto-reconnecting duplex channel to the signaling relay. Knows
//! nothing about call semantics: inbound frames are dispatched to handlers
//! registered per message type, outbound frames are sent only while the
//! transport is open.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::ReconnectPolicy;
use crate::protocol::{MessageKind, ParticipantId, RELAY, SignalingMessage};

pub mod memory;
pub mod socket;

use socket::{SignalingDialer, SignalingSocket};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalError {
    /// Soft failure: the message was dropped, not queued.
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("failed to reach relay: {0}")]
    Dial(String),
    #[error("relay handshake failed: {0}")]
    Handshake(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("malformed signaling frame: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Observable connection lifecycle. `Failed` is the permanent-disconnect
/// signal emitted once the reconnect budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

pub type MessageHandler = Box<dyn Fn(SignalingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Instance-owned registry; registering a kind twice replaces the previous
/// handler rather than accumulating.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: parking_lot::RwLock<HashMap<MessageKind, Arc<MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, kind: MessageKind, handler: MessageHandler) {
        self.handlers.write().insert(kind, Arc::new(handler));
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    async fn dispatch(&self, message: SignalingMessage) {
        let handler = self.handlers.read().get(&message.kind).cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => {
                tracing::debug!(target = "signaling", kind = ?message.kind, "no handler registered");
            }
        }
    }
}

pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    participant: ParticipantId,
    dialer: Arc<dyn SignalingDialer>,
    policy: ReconnectPolicy,
    handlers: HandlerRegistry,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    link: watch::Sender<LinkState>,
    // Single-flight guard: at most one dial/handshake in flight.
    connect_gate: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    closed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    bridge_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(
        participant: ParticipantId,
        dialer: Arc<dyn SignalingDialer>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                participant,
                dialer,
                policy,
                handlers: HandlerRegistry::default(),
                outbound: parking_lot::Mutex::new(None),
                link,
                connect_gate: tokio::sync::Mutex::new(()),
                attempts: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                tasks: parking_lot::Mutex::new(Vec::new()),
                bridge_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.inner.participant
    }

    /// Register all handlers before calling [`start`](Self::start); handlers
    /// registered after connect may miss early messages.
    pub fn register_handler(&self, kind: MessageKind, handler: MessageHandler) {
        self.inner.handlers.register(kind, handler);
    }

    /// Closure-friendly wrapper around [`register_handler`](Self::register_handler).
    pub fn on<F, Fut>(&self, kind: MessageKind, f: F)
    where
        F: Fn(SignalingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_handler(kind, Box::new(move |msg| Box::pin(f(msg))));
    }

    /// Idempotent: concurrent callers share the same in-flight attempt, and
    /// a connected channel returns immediately.
    pub async fn start(&self) -> Result<(), SignalError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        ChannelInner::connect(Arc::clone(&self.inner)).await
    }

    /// Serialize and transmit; drops the message with a soft failure when the
    /// transport is not open. No outbound queueing.
    pub fn send(&self, message: &SignalingMessage) -> Result<(), SignalError> {
        let frame = serde_json::to_string(message)?;
        let guard = self.inner.outbound.lock();
        match guard.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(SignalError::NotConnected),
        }
    }

    /// Liveness probe; the relay answers with `connection-confirmed`.
    pub fn probe(&self) -> Result<(), SignalError> {
        self.send(&SignalingMessage::new(
            MessageKind::ConnectionTest,
            self.inner.participant,
            RELAY,
            "",
        ))
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.link.borrow() == LinkState::Connected
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }

    /// Close the transport. Handlers survive by default so a later `start`
    /// resumes dispatch without re-registration. The bridge task is not
    /// aborted: dropping the outbound sender lets it flush frames queued
    /// before the stop and close the socket cleanly.
    pub fn stop(&self, clear_handlers: bool) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.outbound.lock().take();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.link.send_replace(LinkState::Disconnected);
        if clear_handlers {
            self.inner.handlers.clear();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(bridge) = self.inner.bridge_task.lock().take() {
            bridge.abort();
        }
    }
}

impl ChannelInner {
    async fn connect(inner: Arc<Self>) -> Result<(), SignalError> {
        let _permit = inner.connect_gate.lock().await;
        if *inner.link.borrow() == LinkState::Connected {
            return Ok(());
        }
        inner.link.send_replace(LinkState::Connecting);
        let socket = match inner.dialer.dial(inner.participant).await {
            Ok(socket) => socket,
            Err(err) => {
                inner.link.send_replace(LinkState::Disconnected);
                return Err(err);
            }
        };
        inner.attach(socket).await
    }

    /// Wait for the relay's registration confirmation, then hand the socket
    /// to the bridge task.
    async fn attach(self: &Arc<Self>, mut socket: Box<dyn SignalingSocket>) -> Result<(), SignalError> {
        let mut early = Vec::new();
        let confirmed = timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match socket.recv().await {
                    Some(frame) => match serde_json::from_str::<SignalingMessage>(&frame) {
                        Ok(msg) if msg.kind == MessageKind::ConnectionConfirmed => return Ok(()),
                        Ok(msg) => early.push(msg),
                        Err(err) => {
                            tracing::warn!(target = "signaling", error = %err, "dropping malformed frame during handshake");
                        }
                    },
                    None => return Err(SignalError::Handshake("closed before confirmation".into())),
                }
            }
        })
        .await;
        match confirmed {
            Ok(result) => result,
            Err(_) => Err(SignalError::Handshake(
                "timed out waiting for connection-confirmed".into(),
            )),
        }
        .inspect_err(|_| {
            self.link.send_replace(LinkState::Disconnected);
        })?;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);
        self.attempts.store(0, Ordering::SeqCst);
        self.link.send_replace(LinkState::Connected);
        tracing::info!(target = "signaling", participant = self.participant, "relay connection confirmed");

        // Frames that raced the confirmation still reach their handlers.
        for msg in early {
            self.handlers.dispatch(msg).await;
        }

        let inner = Arc::clone(self);
        let bridge = tokio::spawn(inner.bridge(socket, rx));
        if let Some(old) = self.bridge_task.lock().replace(bridge) {
            old.abort();
        }
        Ok(())
    }

    /// One task owns the socket: outbound frames and inbound dispatch are
    /// multiplexed here, so handlers observe frames in arrival order.
    async fn bridge(
        self: Arc<Self>,
        mut socket: Box<dyn SignalingSocket>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            tokio::select! {
                maybe = outbound.recv() => match maybe {
                    Some(frame) => {
                        if socket.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // stop() dropped the sender: close gracefully, no reconnect.
                    None => {
                        socket.close().await;
                        return;
                    }
                },
                frame = socket.recv() => match frame {
                    Some(text) => match serde_json::from_str::<SignalingMessage>(&text) {
                        Ok(msg) if msg.kind == MessageKind::ConnectionConfirmed => {
                            tracing::debug!(target = "signaling", "redundant connection confirmation");
                        }
                        Ok(msg) => self.handlers.dispatch(msg).await,
                        Err(err) => {
                            tracing::warn!(target = "signaling", error = %err, "dropping malformed frame");
                        }
                    },
                    None => break,
                },
            }
        }
        self.on_transport_closed();
    }

    fn on_transport_closed(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        tracing::warn!(target = "signaling", participant = self.participant, "relay connection lost");
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.reconnect_loop().await });
        self.store_task(handle);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.policy.max_attempts {
                tracing::error!(
                    target = "signaling",
                    participant = self.participant,
                    attempts = self.policy.max_attempts,
                    "reconnect budget exhausted"
                );
                self.link.send_replace(LinkState::Failed);
                return;
            }
            self.link.send_replace(LinkState::Reconnecting { attempt });
            sleep(self.policy.base_delay * attempt).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match Self::connect(Arc::clone(&self)).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        participant = self.participant,
                        attempt,
                        error = %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    fn store_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRelay;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{Duration, sleep};

    fn test_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 3,
        }
    }

    fn chat(from: ParticipantId, to: ParticipantId, text: &str) -> SignalingMessage {
        SignalingMessage::new(MessageKind::ChatMessage, from, to, "s1")
            .with_data(serde_json::Value::String(text.to_string()))
    }

    #[tokio::test]
    async fn send_before_start_is_a_soft_failure() {
        let relay = MemoryRelay::new();
        let channel = SignalingChannel::new(1, relay.dialer(), test_policy());
        let err = channel.send(&chat(1, 2, "hi")).unwrap_err();
        assert!(matches!(err, SignalError::NotConnected));
    }

    #[tokio::test]
    async fn routes_frames_to_the_registered_handler() {
        let relay = MemoryRelay::new();
        let a = SignalingChannel::new(1, relay.dialer(), test_policy());
        let b = SignalingChannel::new(2, relay.dialer(), test_policy());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on(MessageKind::ChatMessage, move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });

        a.start().await.unwrap();
        b.start().await.unwrap();
        a.send(&chat(1, 2, "hello")).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely delivery")
            .expect("message");
        assert_eq!(received.text(), Some("hello"));
        assert_eq!(received.from, 1);
    }

    #[tokio::test]
    async fn re_registration_replaces_the_handler() {
        let registry = HandlerRegistry::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first);
        registry.register(
            MessageKind::ChatMessage,
            Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );
        let s = Arc::clone(&second);
        registry.register(
            MessageKind::ChatMessage,
            Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );
        registry.dispatch(chat(1, 2, "x")).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_start_shares_one_attempt() {
        let relay = MemoryRelay::new();
        let channel = Arc::new(SignalingChannel::new(5, relay.dialer(), test_policy()));
        let (a, b) = tokio::join!(channel.start(), channel.start());
        a.unwrap();
        b.unwrap();
        assert!(channel.is_connected());
        assert!(relay.is_registered(5));
    }

    #[tokio::test]
    async fn stop_preserves_handlers_by_default() {
        let relay = MemoryRelay::new();
        let a = SignalingChannel::new(1, relay.dialer(), test_policy());
        let b = SignalingChannel::new(2, relay.dialer(), test_policy());

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        b.on(MessageKind::ChatMessage, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        a.start().await.unwrap();
        b.start().await.unwrap();
        b.stop(false);
        assert!(!b.is_connected());

        // Restart without re-registering; dispatch must resume.
        b.start().await.unwrap();
        a.send(&chat(1, 2, "again")).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unroutable_target_yields_relay_error() {
        let relay = MemoryRelay::new();
        let a = SignalingChannel::new(1, relay.dialer(), test_policy());
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.on(MessageKind::Error, move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });
        a.start().await.unwrap();
        a.send(&chat(1, 99, "anyone there?")).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely error")
            .expect("error frame");
        assert_eq!(err.from, RELAY);
        assert!(err.text().unwrap().contains("99"));
    }
}
