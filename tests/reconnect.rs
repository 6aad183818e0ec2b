//! Reconnect behavior of the signaling channel, driven on a paused clock so
//! the linear backoff schedule can be asserted exactly.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tutorlink::config::ReconnectPolicy;
use tutorlink::protocol::{MessageKind, ParticipantId, SignalingMessage};
use tutorlink::signaling::memory::MemoryRelay;
use tutorlink::signaling::socket::{SignalingDialer, SignalingSocket};
use tutorlink::signaling::{LinkState, SignalError, SignalingChannel};

/// Passes through to the in-process relay until `fail_from_now`, then refuses
/// every dial. Records when each dial happened.
struct FlakyDialer {
    inner: Arc<dyn SignalingDialer>,
    failing: AtomicBool,
    dials: Mutex<Vec<Instant>>,
}

impl FlakyDialer {
    fn new(inner: Arc<dyn SignalingDialer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            dials: Mutex::new(Vec::new()),
        })
    }

    fn fail_from_now(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn dials(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingDialer for FlakyDialer {
    async fn dial(
        &self,
        participant: ParticipantId,
    ) -> Result<Box<dyn SignalingSocket>, SignalError> {
        self.dials.lock().unwrap().push(Instant::now());
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignalError::Dial("relay unreachable".into()));
        }
        self.inner.dial(participant).await
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_is_linear_and_budget_bounded() {
    let relay = MemoryRelay::new();
    let dialer = FlakyDialer::new(relay.dialer());
    let channel = SignalingChannel::new(
        7,
        Arc::clone(&dialer) as Arc<dyn SignalingDialer>,
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
    );
    channel.start().await.expect("initial connect");
    assert!(channel.is_connected());

    dialer.fail_from_now();
    let lost_at = Instant::now();
    relay.drop_client(7);

    let mut link = channel.link_state();
    link.wait_for(|state| *state == LinkState::Failed)
        .await
        .expect("link watch alive");

    // First entry is the initial successful dial; the rest are reconnects.
    let dials = dialer.dials();
    assert_eq!(dials.len(), 4, "exactly max_attempts reconnect dials");
    assert_eq!(dials[1] - lost_at, Duration::from_secs(1));
    assert_eq!(dials[2] - dials[1], Duration::from_secs(2));
    assert_eq!(dials[3] - dials[2], Duration::from_secs(3));

    // Failed is terminal; sends now drop with a soft error.
    let message = SignalingMessage::new(MessageKind::ChatMessage, 7, 8, "s1")
        .with_data(serde_json::value::Value::String("hello?".into()));
    assert!(matches!(
        channel.send(&message),
        Err(SignalError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_loss_recovers_and_resets_the_budget() {
    let relay = MemoryRelay::new();
    let channel = SignalingChannel::new(
        9,
        relay.dialer(),
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 2,
        },
    );
    channel.start().await.expect("connect");

    for _ in 0..3 {
        relay.drop_client(9);
        let mut link = channel.link_state();
        link.wait_for(|state| matches!(state, LinkState::Reconnecting { .. }))
            .await
            .expect("link watch alive");
        link.wait_for(|state| *state == LinkState::Connected)
            .await
            .expect("link watch alive");
        assert!(relay.is_registered(9));
    }
}
