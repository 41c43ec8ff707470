use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use switchboard_session::{EngineConfig, HeartbeatMode};
use switchboard_storage::PubSubMode;
use tracing::{info, warn};

/// Server configuration: listen address, node identity, engine timings and
/// the cluster backend
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen: String,
    pub node_id: Option<u64>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub upgrade_timeout: Duration,
    pub first_data_timeout: Duration,
    pub ack_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub upgrades: Vec<String>,
    pub heartbeat: HeartbeatMode,
    pub pubsub: PubSubMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            listen: "0.0.0.0:3000".to_string(),
            node_id: None,
            ping_interval: engine.ping_interval,
            ping_timeout: engine.ping_timeout,
            upgrade_timeout: engine.upgrade_timeout,
            first_data_timeout: engine.first_data_timeout,
            ack_timeout: engine.ack_timeout,
            max_frame_size: engine.max_frame_size,
            upgrades: engine.upgrades,
            heartbeat: engine.heartbeat,
            pubsub: PubSubMode::default(),
        }
    }
}

/// On-disk shape; durations are humantime strings ("25s", "1m 30s")
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    listen: Option<String>,
    node_id: Option<u64>,
    engine: Option<EngineSection>,
    pubsub: Option<PubSubMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineSection {
    ping_interval: Option<String>,
    ping_timeout: Option<String>,
    upgrade_timeout: Option<String>,
    first_data_timeout: Option<String>,
    ack_timeout: Option<String>,
    max_frame_size: Option<usize>,
    upgrades: Option<Vec<String>>,
    heartbeat: Option<HeartbeatMode>,
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<FileConfig>(&content) {
                Ok(file_config) => {
                    config.apply_file_config(file_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", config_path.as_ref(), e);
                }
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: listen={}, node_id={:?}, ping_interval={:?}, ping_timeout={:?}",
            config.listen, config.node_id, config.ping_interval, config.ping_timeout
        );

        Ok(config)
    }

    fn apply_file_config(&mut self, file_config: FileConfig) -> Result<()> {
        if let Some(listen) = file_config.listen {
            self.listen = listen;
        }
        if let Some(node_id) = file_config.node_id {
            self.node_id = Some(node_id);
        }
        if let Some(pubsub) = file_config.pubsub {
            self.pubsub = pubsub;
        }

        let Some(engine) = file_config.engine else {
            return Ok(());
        };
        if let Some(value) = engine.ping_interval {
            self.ping_interval = parse_duration("engine.ping_interval", &value)?;
        }
        if let Some(value) = engine.ping_timeout {
            self.ping_timeout = parse_duration("engine.ping_timeout", &value)?;
        }
        if let Some(value) = engine.upgrade_timeout {
            self.upgrade_timeout = parse_duration("engine.upgrade_timeout", &value)?;
        }
        if let Some(value) = engine.first_data_timeout {
            self.first_data_timeout = parse_duration("engine.first_data_timeout", &value)?;
        }
        if let Some(value) = engine.ack_timeout {
            self.ack_timeout = Some(parse_duration("engine.ack_timeout", &value)?);
        }
        if let Some(size) = engine.max_frame_size {
            self.max_frame_size = size;
        }
        if let Some(upgrades) = engine.upgrades {
            self.upgrades = upgrades;
        }
        if let Some(heartbeat) = engine.heartbeat {
            self.heartbeat = heartbeat;
        }
        Ok(())
    }

    /// Apply `SWITCHBOARD_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("SWITCHBOARD_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = listen;
        }

        if let Some(value) = lookup("SWITCHBOARD_PING_INTERVAL") {
            match humantime::parse_duration(&value) {
                Ok(interval) => {
                    self.ping_interval = interval;
                    info!("Ping interval overridden by environment: {:?}", interval);
                }
                Err(e) => warn!("Ignoring SWITCHBOARD_PING_INTERVAL={:?}: {}", value, e),
            }
        }

        if let Some(value) = lookup("SWITCHBOARD_PING_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(timeout) => {
                    self.ping_timeout = timeout;
                    info!("Ping timeout overridden by environment: {:?}", timeout);
                }
                Err(e) => warn!("Ignoring SWITCHBOARD_PING_TIMEOUT={:?}: {}", value, e),
            }
        }

        if let Some(value) = lookup("SWITCHBOARD_NODE_ID") {
            if let Ok(id) = value.parse::<u64>() {
                self.node_id = Some(id);
                info!("Node ID overridden by environment: {}", id);
            }
        }
    }

    /// Protocol engine settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            upgrade_timeout: self.upgrade_timeout,
            first_data_timeout: self.first_data_timeout,
            ack_timeout: self.ack_timeout,
            max_frame_size: self.max_frame_size,
            upgrades: self.upgrades.clone(),
            heartbeat: self.heartbeat,
            ..EngineConfig::default()
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", key, value))
}
