//! Runtime configuration of a coordination session.

use crate::SessionError;
use coord_runtime::RecoveryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a coordinator is chosen when no network exists yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionStrategy {
    /// Earliest published candidate wins
    #[default]
    First,
    /// Pseudo-random candidate, identical on every node seeing the same set
    Random,
}

impl fmt::Display for PromotionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionStrategy::First => write!(f, "first"),
            PromotionStrategy::Random => write!(f, "random"),
        }
    }
}

impl FromStr for PromotionStrategy {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(PromotionStrategy::First),
            "random" => Ok(PromotionStrategy::Random),
            other => Err(SessionError::Config(format!("unknown promotion strategy: {}", other))),
        }
    }
}

/// Connection shape between nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Participants connect to the coordinator only
    #[default]
    Hierarchical,
    /// Every node connects to every other node
    #[serde(rename = "peer2peer")]
    PeerToPeer,
    /// Full mesh for data, coordinator authority for membership
    Hybrid,
}

impl TopologyMode {
    /// Whether participants keep links to nodes other than the coordinator
    pub fn is_full_mesh(&self) -> bool {
        !matches!(self, TopologyMode::Hierarchical)
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::Hierarchical => write!(f, "hierarchical"),
            TopologyMode::PeerToPeer => write!(f, "peer2peer"),
            TopologyMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for TopologyMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hierarchical" => Ok(TopologyMode::Hierarchical),
            "peer2peer" => Ok(TopologyMode::PeerToPeer),
            "hybrid" => Ok(TopologyMode::Hybrid),
            other => Err(SessionError::Config(format!("unknown topology: {}", other))),
        }
    }
}

/// Bidirectional connection test settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTestConfig {
    /// Attempts in total before giving up
    pub max_retries: u32,
    /// Wait for each response
    pub timeout: Duration,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for ConnectionTestConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Configuration of a coordination session
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationConfig {
    /// Network to discover and join
    pub network_name: String,
    /// Nodes the coordinator admits besides itself
    pub max_nodes: usize,
    /// Nodes (including the coordinator) required before the coordinator is ready
    pub min_nodes: usize,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Silence after which a node is considered gone
    pub node_timeout: Duration,
    /// Discovery refresh period
    pub discovery_interval: Duration,
    /// Discovery rounds before falling back to an election
    pub discovery_rounds: u32,
    /// Bound on the whole join
    pub join_timeout: Duration,
    /// Election strategy
    pub promotion_strategy: PromotionStrategy,
    /// Connection shape
    pub topology: TopologyMode,
    /// Connection test settings
    pub connection_test: ConnectionTestConfig,
    /// Recovery policy for the session's execution units
    pub recovery: RecoveryPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            network_name: "default-network".to_string(),
            max_nodes: 8,
            min_nodes: 1,
            heartbeat_interval: Duration::from_secs(1),
            node_timeout: Duration::from_secs(5),
            discovery_interval: Duration::from_millis(500),
            discovery_rounds: 3,
            join_timeout: Duration::from_secs(10),
            promotion_strategy: PromotionStrategy::First,
            topology: TopologyMode::Hierarchical,
            connection_test: ConnectionTestConfig::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl CoordinationConfig {
    /// Create a config for `network_name` with defaults otherwise
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            ..Self::default()
        }
    }

    /// Reject settings the protocol cannot work with
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.network_name.is_empty() {
            return Err(SessionError::Config("network name must not be empty".into()));
        }
        if self.max_nodes == 0 {
            return Err(SessionError::Config("max_nodes must be at least 1".into()));
        }
        if self.min_nodes > self.max_nodes + 1 {
            return Err(SessionError::Config(format!(
                "min_nodes ({}) cannot exceed max_nodes + 1 ({})",
                self.min_nodes,
                self.max_nodes + 1
            )));
        }
        if self.heartbeat_interval.is_zero() || self.discovery_interval.is_zero() {
            return Err(SessionError::Config("intervals must be non-zero".into()));
        }
        if self.node_timeout <= self.heartbeat_interval {
            return Err(SessionError::Config(format!(
                "node_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.node_timeout, self.heartbeat_interval
            )));
        }
        if self.connection_test.max_retries == 0 {
            return Err(SessionError::Config("connection test needs at least one attempt".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_nodes, 8);
        assert_eq!(config.connection_test.max_retries, 3);
        assert_eq!(config.topology, TopologyMode::Hierarchical);
    }

    #[test]
    fn test_validation_rejects_bad_timing() {
        let config = CoordinationConfig {
            node_timeout: Duration::from_millis(500),
            ..CoordinationConfig::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));

        let config = CoordinationConfig {
            min_nodes: 20,
            ..CoordinationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_strategy_and_topology() {
        assert_eq!("Random".parse::<PromotionStrategy>().unwrap(), PromotionStrategy::Random);
        assert_eq!("peer2peer".parse::<TopologyMode>().unwrap(), TopologyMode::PeerToPeer);
        assert!("ring".parse::<TopologyMode>().is_err());
        assert_eq!(TopologyMode::PeerToPeer.to_string(), "peer2peer");
    }
}
