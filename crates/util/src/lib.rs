pub mod stats;

pub use stats::{BrokerStats, StatsSnapshot};

use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub type UnixMillis = u64;

pub fn unix_millis() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as UnixMillis
}

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber, filtered by `RUST_LOG`.
/// Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
