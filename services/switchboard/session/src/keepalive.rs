//! Keepalive policy.

use crate::session::EngineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PING data a candidate transport sends to probe an upgrade
pub const PROBE: &str = "probe";

/// Which side sends PING
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// Client pings every `ping_interval`; the server answers with PONG
    #[default]
    ClientInitiated,
    /// Server pings every `ping_interval`; the client answers with PONG
    ServerInitiated,
}

/// How long a session may stay silent before it is considered dead
pub fn liveness_window(config: &EngineConfig) -> Duration {
    config.ping_interval + config.ping_timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_window() {
        let config = EngineConfig::default();
        assert_eq!(liveness_window(&config), Duration::from_secs(85));
    }

    #[test]
    fn test_heartbeat_mode_names() {
        let mode: HeartbeatMode = serde_json::from_str(r#""server_initiated""#).unwrap();
        assert_eq!(mode, HeartbeatMode::ServerInitiated);
        assert_eq!(serde_json::to_string(&HeartbeatMode::default()).unwrap(), r#""client_initiated""#);
    }
}
