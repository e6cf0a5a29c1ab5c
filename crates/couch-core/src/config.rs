use std::env;
use std::time::Duration;

/// Jitter bounds and attempt budget for silent shared-channel reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Upper bound (exclusive) of the delay before the first rejoin.
    pub initial_jitter: Duration,
    /// Upper bound (exclusive) of the delay before every later rejoin.
    pub retry_jitter: Duration,
    /// Rejoin attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_jitter: Duration::from_millis(1_000),
            retry_jitter: Duration::from_millis(5_000),
            max_attempts: Some(10),
        }
    }
}

/// Retry policy for a single peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRetryPolicy {
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for PeerRetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Timing knobs shared by every couch component.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub request_timeout: Duration,
    pub join_timeout: Duration,
    /// How long a nickname conflict may persist before a join gives up.
    pub conflict_window: Duration,
    pub conflict_retry_delay: Duration,
    pub reconnect: ReconnectPolicy,
    pub secret_rotation: Duration,
    pub peer_retry: PeerRetryPolicy,
    pub reconnect_hint_max_age: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(15),
            conflict_window: Duration::from_secs(35),
            conflict_retry_delay: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            secret_rotation: Duration::from_secs(5 * 60),
            peer_retry: PeerRetryPolicy::default(),
            reconnect_hint_max_age: Duration::from_secs(30),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by `COUCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("COUCH_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("COUCH_CONFLICT_WINDOW_SECS") {
            config.conflict_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COUCH_ROTATION_SECS") {
            config.secret_rotation = Duration::from_secs(secs.max(1));
        }
        if let Ok(raw) = env::var("COUCH_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = match raw.trim() {
                "" | "0" | "unlimited" => None,
                value => value.parse().ok().or(config.reconnect.max_attempts),
            };
        }
        if let Some(secs) = env_u64("COUCH_PEER_RETRY_SECS") {
            config.peer_retry.retry_delay = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("COUCH_PEER_MAX_RETRIES") {
            config.peer_retry.max_retries = retries as u32;
        }
        if let Ok(raw) = env::var("COUCH_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-global.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_protocol_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.conflict_window, Duration::from_secs(35));
        assert_eq!(config.secret_rotation, Duration::from_secs(300));
        assert_eq!(config.reconnect.initial_jitter, Duration::from_millis(1_000));
        assert_eq!(config.reconnect.retry_jitter, Duration::from_millis(5_000));
        assert_eq!(config.peer_retry.max_retries, 3);
        assert_eq!(config.reconnect_hint_max_age, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_are_applied() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("COUCH_REQUEST_TIMEOUT_MS", "2500");
            env::set_var("COUCH_RECONNECT_MAX_ATTEMPTS", "unlimited");
            env::set_var("COUCH_ICE_SERVERS", "stun:a.example:3478, turn:b.example");
        }
        let config = CoreConfig::from_env();
        unsafe {
            env::remove_var("COUCH_REQUEST_TIMEOUT_MS");
            env::remove_var("COUCH_RECONNECT_MAX_ATTEMPTS");
            env::remove_var("COUCH_ICE_SERVERS");
        }
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example".to_string()]
        );
    }
}
