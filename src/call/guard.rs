//! Suppresses duplicate hang-up signals. Ending a call can be triggered from
//! several places at once (user action, peer hang-up racing ours, watchdog
//! giving up); only the first `call-end` per (peer, session) within the window
//! goes out on the wire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::ParticipantId;

pub struct EndCallGuard {
    window: Duration,
    entries: Mutex<HashMap<(ParticipantId, String), Instant>>,
}

impl EndCallGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` exactly once per (peer, session) within the window.
    /// Expired entries are pruned on every call, so the map stays bounded by
    /// the number of recently ended calls.
    pub fn try_send(&self, peer: ParticipantId, session_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, sent_at| now.duration_since(*sent_at) < self.window);
        match entries.get(&(peer, session_id.to_string())) {
            Some(_) => {
                tracing::debug!(target = "call", peer, session_id, "suppressing duplicate call-end");
                false
            }
            None => {
                entries.insert((peer, session_id.to_string()), now);
                true
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let guard = EndCallGuard::new(Duration::from_secs(3));
        assert!(guard.try_send(7, "session-a"));
        assert!(!guard.try_send(7, "session-a"));
        assert!(!guard.try_send(7, "session-a"));
    }

    #[test]
    fn distinct_sessions_and_peers_pass_independently() {
        let guard = EndCallGuard::new(Duration::from_secs(3));
        assert!(guard.try_send(7, "session-a"));
        assert!(guard.try_send(7, "session-b"));
        assert!(guard.try_send(8, "session-a"));
    }

    #[test]
    fn entry_expires_after_the_window() {
        let guard = EndCallGuard::new(Duration::from_millis(10));
        assert!(guard.try_send(7, "session-a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(guard.try_send(7, "session-a"));
        // The expired entry was pruned, not just overwritten.
        assert_eq!(guard.len(), 1);
    }
}
