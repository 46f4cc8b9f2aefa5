//! Streaming configuration.
//!
//! All knobs are plain fields with defaults; [`StreamingConfig::from_env`]
//! overlays environment variables so deployments can tune a single value
//! without a config file.

use serde::{Deserialize, Serialize};

/// Configuration for the visual streaming core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Ring capacity per session (`EVENT_BUFFER_SIZE`).
    pub event_buffer_size: usize,
    /// Per-client backpressure threshold (`CLIENT_WRITE_QUEUE`).
    pub client_write_queue: usize,
    /// Control-channel rate limit, messages per rolling second
    /// (`CONTROL_RATE_PER_SEC`).
    pub control_rate_per_sec: u32,
    /// Control-channel connection cap in seconds (`CONTROL_MAX_DURATION_S`).
    pub control_max_duration_secs: u64,
    /// Max age of a verified storage-state record in hours
    /// (`COOKIE_VERIFY_TTL_HOURS`).
    pub cookie_verify_ttl_hours: i64,
    /// Auto-save storage state when a session ends
    /// (`AUTO_SAVE_SESSION_STATE`).
    pub auto_save_session_state: bool,
    /// Gate loading of prior storage state (`FEATURE_USE_COOKIES`).
    pub feature_use_cookies: bool,
    /// How long a `client_ready` waits for the first FullSnapshot before the
    /// channel expires (`SNAPSHOT_WAIT_S`).
    pub snapshot_wait_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            client_write_queue: 256,
            control_rate_per_sec: 100,
            control_max_duration_secs: 300,
            cookie_verify_ttl_hours: 24,
            auto_save_session_state: true,
            feature_use_cookies: false,
            snapshot_wait_secs: 30,
        }
    }
}

impl StreamingConfig {
    /// Build a config from the process environment, falling back to defaults
    /// for unset or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            event_buffer_size: env_parse("EVENT_BUFFER_SIZE", d.event_buffer_size),
            client_write_queue: env_parse("CLIENT_WRITE_QUEUE", d.client_write_queue),
            control_rate_per_sec: env_parse("CONTROL_RATE_PER_SEC", d.control_rate_per_sec),
            control_max_duration_secs: env_parse(
                "CONTROL_MAX_DURATION_S",
                d.control_max_duration_secs,
            ),
            cookie_verify_ttl_hours: env_parse(
                "COOKIE_VERIFY_TTL_HOURS",
                d.cookie_verify_ttl_hours,
            ),
            auto_save_session_state: env_bool("AUTO_SAVE_SESSION_STATE", d.auto_save_session_state),
            feature_use_cookies: env_bool("FEATURE_USE_COOKIES", d.feature_use_cookies),
            snapshot_wait_secs: env_parse("SNAPSHOT_WAIT_S", d.snapshot_wait_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
