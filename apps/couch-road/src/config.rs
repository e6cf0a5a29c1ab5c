use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Connections silent for longer than this are dropped.
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("COUCH_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            stale_timeout: env::var("COUCH_ROAD_STALE_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_timeout),
            sweep_interval: defaults.sweep_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            // three missed 30s heartbeats
            stale_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
        }
    }
}
