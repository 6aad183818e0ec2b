use std::env;
use std::time::Duration;

/// One STUN/TURN entry handed to the peer connection. TURN entries carry
/// credentials; STUN entries leave them empty.
#[derive(Debug, Clone, Default)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// Static connectivity-assistance configuration; never negotiated at runtime.
#[derive(Debug, Clone)]
pub struct IceSettings {
    pub servers: Vec<IceServerEntry>,
    pub bundle_policy: BundlePolicy,
    pub candidate_pool_size: u8,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            servers: vec![IceServerEntry {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            bundle_policy: BundlePolicy::Balanced,
            candidate_pool_size: 4,
        }
    }
}

impl IceSettings {
    /// Load overrides from the environment: `TUTORLINK_ICE_URLS` is a
    /// comma-separated url list, `TUTORLINK_TURN_USERNAME` /
    /// `TUTORLINK_TURN_CREDENTIAL` apply to every listed server.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(urls) = env::var("TUTORLINK_ICE_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                settings.servers = vec![IceServerEntry {
                    urls,
                    username: env::var("TUTORLINK_TURN_USERNAME").unwrap_or_default(),
                    credential: env::var("TUTORLINK_TURN_CREDENTIAL").unwrap_or_default(),
                }];
            }
        }
        settings
    }
}

/// Linear reconnect backoff: attempt `k` waits `base_delay * k`, up to
/// `max_attempts` attempts. Worst-case total wait is therefore
/// `base_delay * max_attempts * (max_attempts + 1) / 2`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Two-stage connection watchdog: log degraded state after the first window,
/// trigger a single ICE restart after the second.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogPolicy {
    pub degraded_after: Duration,
    pub restart_after: Duration,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            degraded_after: Duration::from_secs(10),
            restart_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice: IceSettings,
    pub reconnect: ReconnectPolicy,
    pub watchdog: WatchdogPolicy,
    /// Suppression window for duplicate end-of-call sends.
    pub end_guard_window: Duration,
    /// How long an unanswered call rings before it is torn down.
    pub ring_timeout: Duration,
    pub candidate_retry_attempts: u32,
    pub candidate_retry_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice: IceSettings::default(),
            reconnect: ReconnectPolicy::default(),
            watchdog: WatchdogPolicy::default(),
            end_guard_window: Duration::from_secs(3),
            ring_timeout: Duration::from_secs(45),
            candidate_retry_attempts: 3,
            candidate_retry_delay: Duration::from_millis(150),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        Self {
            ice: IceSettings::from_env(),
            ..Default::default()
        }
    }
}

/// Base URL of the signaling relay, normalised the way the rest of the stack
/// expects it (IPv4 loopback instead of `localhost`).
pub fn relay_url_from_env() -> String {
    let url = env::var("TUTORLINK_RELAY_URL").unwrap_or_else(|_| "ws://127.0.0.1:8443".to_string());
    if let Some(rest) = url.strip_prefix("ws://localhost") {
        format!("ws://127.0.0.1{rest}")
    } else {
        url
    }
}
