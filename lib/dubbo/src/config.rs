use serde_derive::Deserialize;
use std::time::Duration;

/// Tunables for the pool and registry, loadable from TOML. Every field has a
/// single effect; the defaults match the protocol's conventional values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds a connection may sit idle before the heartbeat sweep starts
    /// probing it.
    pub idle_timeout_secs: u64,
    /// How often the heartbeat task wakes, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Unanswered heartbeats tolerated before the connection is replaced.
    pub heartbeat_max_misses: u32,
    /// Readiness poll timeout, bounding how quickly freshly added
    /// connections are picked up by the reader.
    pub poll_interval_ms: u64,
    /// Deadline for establishing a TCP connection to a provider.
    pub connect_timeout_secs: u64,
    /// Client name embedded in consumer registrations.
    pub application_name: String,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            idle_timeout_secs: 60,
            heartbeat_interval_ms: 30,
            heartbeat_max_misses: 3,
            poll_interval_ms: 500,
            connect_timeout_secs: 10,
            application_name: "dubbo-client-rs".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(toml: &str) -> Result<ClientConfig, String> {
        serdeconv::from_toml_str(toml).map_err(|e| e.to_string())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
