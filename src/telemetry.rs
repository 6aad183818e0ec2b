use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `filter` follows the usual
/// `EnvFilter` syntax (`tutorlink=debug,webrtc=warn`); `TUTORLINK_LOG`
/// overrides it when set.
pub fn init(filter: &str) {
    let directive = std::env::var("TUTORLINK_LOG").unwrap_or_else(|_| filter.to_string());
    let env_filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
