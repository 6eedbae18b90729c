//! Configuration schema definitions.
//!
//! Every section has defaults, so an empty file (or `NodeConfig::default()`)
//! describes a working node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::StoreKind;

/// Root configuration for an embedded node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// State directory. Defaults to `<user config dir>/embednet-<program>`.
    pub dir: Option<PathBuf>,

    /// Hostname on the overlay. Defaults to the program name.
    pub hostname: Option<String>,

    /// Remove the node from the network when it goes away.
    pub ephemeral: bool,

    /// Pre-shared join key. Falls back to `EMBEDNET_AUTHKEY`.
    pub auth_key: Option<String>,

    /// Coordination server override.
    pub control_url: Option<String>,

    pub store: StoreConfig,

    pub listeners: ListenerSettings,

    pub timeouts: TimeoutConfig,

    pub observability: ObservabilityConfig,
}

/// Where backend state is persisted.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// State file for the `file` kind. Defaults to `<dir>/node.state`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// How long an inbound flow waits for `accept` before it is dropped.
    pub handoff_grace_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            handoff_grace_ms: 1000,
        }
    }
}

impl ListenerSettings {
    pub fn handoff_grace(&self) -> Duration {
        Duration::from_millis(self.handoff_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on the final log flush at close.
    pub close_flush_secs: u64,

    /// Interval between authorization URL reminders.
    pub auth_poll_secs: u64,

    /// Interval between link state samples.
    pub link_poll_secs: u64,

    /// How long a gateway client may take to send its first byte.
    pub sniff_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            close_flush_secs: 5,
            auth_poll_secs: 5,
            link_poll_secs: 10,
            sniff_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn close_flush(&self) -> Duration {
        Duration::from_secs(self.close_flush_secs)
    }

    pub fn auth_poll(&self) -> Duration {
        Duration::from_secs(self.auth_poll_secs)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_secs(self.link_poll_secs)
    }

    pub fn sniff(&self) -> Duration {
        Duration::from_secs(self.sniff_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Install the Prometheus exporter (host binary only).
    pub metrics_enabled: bool,

    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert!(!config.ephemeral);
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.listeners.handoff_grace(), Duration::from_secs(1));
        assert_eq!(config.timeouts.close_flush_secs, 5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            hostname = "printer"
            ephemeral = true

            [store]
            kind = "memory"

            [timeouts]
            sniff_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.hostname.as_deref(), Some("printer"));
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.timeouts.sniff_secs, 2);
        assert_eq!(config.timeouts.auth_poll_secs, 5);
    }
}
