//! Configuration handling for the coord binary.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line (applied in `main`). A missing or unreadable file is not an
//! error: the defaults of [`CoordinationConfig`] are used instead.

use anyhow::{Context, Result};
use coord_session::{CoordinationConfig, PromotionStrategy, TopologyMode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node and coordination settings for one coord process
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Human-readable node name
    pub node_id: String,
    /// Capabilities advertised with the node identity
    pub capabilities: BTreeMap<String, String>,
    /// Session settings
    pub coordination: CoordinationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "coord-node".to_string(),
            capabilities: BTreeMap::new(),
            coordination: CoordinationConfig::default(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    node: Option<NodeSection>,
    coordination: Option<CoordinationSection>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    id: Option<String>,
    #[serde(default)]
    capabilities: BTreeMap<String, String>,
}

/// Durations are humantime strings such as `"500ms"` or `"2s"`
#[derive(Debug, Deserialize)]
struct CoordinationSection {
    network: Option<String>,
    max_nodes: Option<usize>,
    min_nodes: Option<usize>,
    heartbeat_interval: Option<String>,
    node_timeout: Option<String>,
    discovery_interval: Option<String>,
    discovery_rounds: Option<u32>,
    join_timeout: Option<String>,
    promotion_strategy: Option<String>,
    topology: Option<String>,
    connection_test: Option<ConnectionTestSection>,
}

#[derive(Debug, Deserialize)]
struct ConnectionTestSection {
    max_retries: Option<u32>,
    timeout: Option<String>,
    retry_delay: Option<String>,
}

/// Parse a humantime duration, keeping `current` (with a warning) when it is malformed
fn parse_duration(key: &str, value: Option<String>, current: Duration) -> Duration {
    match value {
        Some(raw) => match humantime::parse_duration(&raw) {
            Ok(duration) => duration,
            Err(e) => {
                warn!("Ignoring {}={:?}: {}", key, raw, e);
                current
            }
        },
        None => current,
    }
}

impl NodeConfig {
    /// Load configuration from `config_path` and the environment
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Node configuration: node_id={}, network={}, max_nodes={}, min_nodes={}, heartbeat={:?}, timeout={:?}",
            config.node_id,
            config.coordination.network_name,
            config.coordination.max_nodes,
            config.coordination.min_nodes,
            config.coordination.heartbeat_interval,
            config.coordination.node_timeout
        );
        Ok(config)
    }

    /// Check the merged settings
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node id must not be empty");
        }
        self.coordination
            .validate()
            .context("invalid coordination settings")
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if let Some(node) = root.node {
            if let Some(id) = node.id {
                self.node_id = id;
            }
            self.capabilities.extend(node.capabilities);
        }

        if let Some(section) = root.coordination {
            self.apply_coordination_section(section);
        }
    }

    fn apply_coordination_section(&mut self, section: CoordinationSection) {
        let c = &mut self.coordination;

        if let Some(network) = section.network {
            c.network_name = network;
        }
        if let Some(max_nodes) = section.max_nodes {
            c.max_nodes = max_nodes;
        }
        if let Some(min_nodes) = section.min_nodes {
            c.min_nodes = min_nodes;
        }
        if let Some(rounds) = section.discovery_rounds {
            c.discovery_rounds = rounds;
        }
        c.heartbeat_interval =
            parse_duration("heartbeat_interval", section.heartbeat_interval, c.heartbeat_interval);
        c.node_timeout = parse_duration("node_timeout", section.node_timeout, c.node_timeout);
        c.discovery_interval =
            parse_duration("discovery_interval", section.discovery_interval, c.discovery_interval);
        c.join_timeout = parse_duration("join_timeout", section.join_timeout, c.join_timeout);

        if let Some(raw) = section.promotion_strategy {
            match raw.parse::<PromotionStrategy>() {
                Ok(strategy) => c.promotion_strategy = strategy,
                Err(e) => warn!("Ignoring promotion_strategy: {}", e),
            }
        }
        if let Some(raw) = section.topology {
            match raw.parse::<TopologyMode>() {
                Ok(topology) => c.topology = topology,
                Err(e) => warn!("Ignoring topology: {}", e),
            }
        }

        if let Some(test) = section.connection_test {
            let t = &mut c.connection_test;
            if let Some(retries) = test.max_retries {
                t.max_retries = retries;
            }
            t.timeout = parse_duration("connection_test.timeout", test.timeout, t.timeout);
            t.retry_delay =
                parse_duration("connection_test.retry_delay", test.retry_delay, t.retry_delay);
        }
    }

    /// Apply `COORD_*` overrides looked up through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup("COORD_NODE_ID") {
            info!("Node ID overridden by environment: {}", node_id);
            self.node_id = node_id;
        }

        if let Some(network) = lookup("COORD_NETWORK") {
            info!("Network overridden by environment: {}", network);
            self.coordination.network_name = network;
        }

        if let Some(raw) = lookup("COORD_MAX_NODES") {
            match raw.parse::<usize>() {
                Ok(max_nodes) => {
                    info!("Max nodes overridden by environment: {}", max_nodes);
                    self.coordination.max_nodes = max_nodes;
                }
                Err(_) => warn!("Ignoring COORD_MAX_NODES={:?}", raw),
            }
        }

        if let Some(raw) = lookup("COORD_MIN_NODES") {
            match raw.parse::<usize>() {
                Ok(min_nodes) => {
                    info!("Min nodes overridden by environment: {}", min_nodes);
                    self.coordination.min_nodes = min_nodes;
                }
                Err(_) => warn!("Ignoring COORD_MIN_NODES={:?}", raw),
            }
        }

        let heartbeat = self.coordination.heartbeat_interval;
        self.coordination.heartbeat_interval =
            parse_duration("COORD_HEARTBEAT_INTERVAL", lookup("COORD_HEARTBEAT_INTERVAL"), heartbeat);

        let timeout = self.coordination.node_timeout;
        self.coordination.node_timeout =
            parse_duration("COORD_NODE_TIMEOUT", lookup("COORD_NODE_TIMEOUT"), timeout);
    }
}
