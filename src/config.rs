//! Runtime tuning knobs read straight from the process environment, in the same
//! `lazy_static` + `env::var`-with-fallback style as the rest of this codebase. There is no
//! config-file or CLI-flag layer here — the core only ever reads the handful of variables
//! named in the spec (§6), the same way `DISCORD_TOKEN`/`DATABASE_URL` are read today.

use std::env;
use std::time::Duration;

lazy_static! {
    /// Tick period for the notification scheduler (C5). Spec-mandated default: 60s.
    pub static ref NOTIFICATION_TICK_SECS: u64 = env::var("NOTIFICATION_TICK_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    /// Lower bound of the gateway reconnect backoff (§4.1).
    pub static ref GATEWAY_BACKOFF_MIN_MS: u64 = env::var("GATEWAY_BACKOFF_MIN_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);

    /// Upper bound ("cap") of the gateway reconnect backoff (§4.1).
    pub static ref GATEWAY_BACKOFF_MAX_MS: u64 = env::var("GATEWAY_BACKOFF_MAX_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30_000);
}

pub fn notification_tick_interval() -> Duration {
    Duration::from_secs(*NOTIFICATION_TICK_SECS)
}

pub fn gateway_backoff_min() -> Duration {
    Duration::from_millis(*GATEWAY_BACKOFF_MIN_MS)
}

pub fn gateway_backoff_max() -> Duration {
    Duration::from_millis(*GATEWAY_BACKOFF_MAX_MS)
}
