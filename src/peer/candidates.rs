//! Ordering helper for connectivity fragments: a candidate is only meaningful
//! once the remote negotiation description has been applied, so anything that
//! arrives early is held and replayed in receipt order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::SessionError;

#[async_trait]
pub trait CandidateSink: Send + Sync {
    async fn apply(&self, candidate: RTCIceCandidateInit) -> Result<(), SessionError>;
}

pub struct CandidateBuffer {
    sink: Arc<dyn CandidateSink>,
    retry_attempts: u32,
    retry_delay: Duration,
    state: tokio::sync::Mutex<BufferState>,
}

#[derive(Default)]
struct BufferState {
    remote_ready: bool,
    pending: VecDeque<RTCIceCandidateInit>,
}

impl CandidateBuffer {
    pub fn new(sink: Arc<dyn CandidateSink>, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            sink,
            retry_attempts,
            retry_delay,
            state: tokio::sync::Mutex::new(BufferState::default()),
        }
    }

    /// Apply immediately when the remote description is set, buffer otherwise.
    /// Empty candidates (end-of-candidates markers, malformed frames) are
    /// ignored without retry.
    pub async fn push(&self, candidate: RTCIceCandidateInit) {
        if candidate.candidate.trim().is_empty() {
            tracing::trace!(target = "webrtc", "ignoring empty candidate");
            return;
        }
        {
            let mut state = self.state.lock().await;
            if !state.remote_ready {
                state.pending.push_back(candidate);
                return;
            }
        }
        self.apply_or_requeue(candidate).await;
    }

    /// Flip the gate and replay everything buffered, in receipt order. The
    /// buffer is drained regardless of individual outcomes; candidates that
    /// exhaust their retries are re-queued for the next flush trigger.
    pub async fn remote_description_applied(&self) {
        let drained: Vec<RTCIceCandidateInit> = {
            let mut state = self.state.lock().await;
            state.remote_ready = true;
            state.pending.drain(..).collect()
        };
        tracing::debug!(target = "webrtc", buffered = drained.len(), "replaying buffered candidates");
        for candidate in drained {
            self.apply_or_requeue(candidate).await;
        }
    }

    async fn apply_or_requeue(&self, candidate: RTCIceCandidateInit) {
        for attempt in 1..=self.retry_attempts {
            match self.sink.apply(candidate.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(
                        target = "webrtc",
                        attempt,
                        error = %err,
                        "candidate application failed"
                    );
                    if attempt < self.retry_attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }
        // Exhausted: keep it for the next flush trigger rather than dropping.
        self.state.lock().await.pending.push_back(candidate);
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.pending.clear();
        state.remote_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        applied: parking_lot::Mutex<Vec<String>>,
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CandidateSink for RecordingSink {
        async fn apply(&self, candidate: RTCIceCandidateInit) -> Result<(), SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SessionError::Candidate("sink unavailable".into()));
            }
            self.applied.lock().push(candidate.candidate);
            Ok(())
        }
    }

    fn init(text: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn buffered_candidates_replay_in_receipt_order() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CandidateBuffer::new(sink.clone(), 3, Duration::from_millis(1));
        buffer.push(init("first")).await;
        buffer.push(init("second")).await;
        buffer.push(init("third")).await;
        assert_eq!(buffer.pending_len().await, 3);
        assert!(sink.applied.lock().is_empty());

        buffer.remote_description_applied().await;
        assert_eq!(*sink.applied.lock(), vec!["first", "second", "third"]);
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn immediate_application_after_remote_description() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CandidateBuffer::new(sink.clone(), 3, Duration::from_millis(1));
        buffer.remote_description_applied().await;
        buffer.push(init("direct")).await;
        assert_eq!(*sink.applied.lock(), vec!["direct"]);
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn empty_candidates_are_ignored_without_retry() {
        let sink = Arc::new(RecordingSink::default());
        let buffer = CandidateBuffer::new(sink.clone(), 3, Duration::from_millis(1));
        buffer.push(init("")).await;
        buffer.push(init("   ")).await;
        buffer.remote_description_applied().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_remaining.store(2, Ordering::SeqCst);
        let buffer = CandidateBuffer::new(sink.clone(), 3, Duration::from_millis(1));
        buffer.remote_description_applied().await;
        buffer.push(init("flaky")).await;
        assert_eq!(*sink.applied.lock(), vec!["flaky"]);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_candidate_is_requeued_for_the_next_flush() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_remaining.store(3, Ordering::SeqCst);
        let buffer = CandidateBuffer::new(sink.clone(), 3, Duration::from_millis(1));
        buffer.remote_description_applied().await;
        buffer.push(init("stubborn")).await;
        assert_eq!(buffer.pending_len().await, 1);

        // Next flush trigger (e.g. an ICE-restart answer) retries it.
        buffer.remote_description_applied().await;
        assert_eq!(*sink.applied.lock(), vec!["stubborn"]);
        assert_eq!(buffer.pending_len().await, 0);
    }
}
