//! Host configuration, loadable from JSON with every field defaulted.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ShutdownMode;

/// Tunables for a [`crate::Host`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// ID of the planet every session is bound to.
    pub home_planet_id: u64,
    /// Capacity of each session's inbound pipe.
    pub inbox_capacity: usize,
    /// Capacity of each session's outbound pipe. Pushes block when it is full.
    pub outbox_capacity: usize,
    /// Capacity of each cell owner's command queue.
    pub cell_cmd_capacity: usize,
    /// Upper bound on a graceful shutdown before it is escalated.
    pub graceful_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            home_planet_id: 1,
            inbox_capacity: 64,
            outbox_capacity: 64,
            cell_cmd_capacity: 32,
            graceful_timeout_ms: 5_000,
        }
    }
}

impl HostConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Graceful shutdown mode bounded by `graceful_timeout_ms`.
    pub fn graceful_shutdown(&self) -> ShutdownMode {
        ShutdownMode::Graceful {
            timeout: Duration::from_millis(self.graceful_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = HostConfig::from_json(br#"{"outbox_capacity": 2}"#).unwrap();
        assert_eq!(cfg.outbox_capacity, 2);
        assert_eq!(cfg.inbox_capacity, HostConfig::default().inbox_capacity);
        assert_eq!(
            cfg.graceful_shutdown(),
            ShutdownMode::Graceful {
                timeout: Duration::from_secs(5)
            }
        );
    }
}
