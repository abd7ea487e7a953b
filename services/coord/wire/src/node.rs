//! Node identity structures for the wire protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Role a node plays in the coordination network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRole {
    /// Role not assigned yet (discovery or election still running)
    Unassigned,
    /// Node with authority to accept joins and broadcast topology
    Coordinator,
    /// Non-coordinator member
    Participant,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Unassigned => write!(f, "unassigned"),
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Participant => write!(f, "participant"),
        }
    }
}

/// Identity of a node taking part in a coordination session.
///
/// A `Node` is never mutated once built. Role changes produce a new value via
/// [`Node::with_role`], so snapshots handed out of the roster can never alias
/// a value that is later changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Human-readable node name
    id: String,
    /// Globally unique node identifier
    #[serde(rename = "uId")]
    uid: String,
    /// Current role
    role: NodeRole,
    /// Free-form capability advertisement
    #[serde(default)]
    capabilities: BTreeMap<String, String>,
}

impl Node {
    /// Create a new node with an explicit unique ID
    pub fn new(id: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uid: uid.into(),
            role: NodeRole::Unassigned,
            capabilities: BTreeMap::new(),
        }
    }

    /// Create a new node with a freshly generated unique ID
    pub fn generate(id: impl Into<String>) -> Self {
        Self::new(id, uuid::Uuid::new_v4().to_string())
    }

    /// Add a capability while the node is being built
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    /// Return a copy of this node carrying a different role
    pub fn with_role(&self, role: NodeRole) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }

    /// Human-readable node name
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Globally unique node identifier
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Current role
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Capability advertisement
    pub fn capabilities(&self) -> &BTreeMap<String, String> {
        &self.capabilities
    }

    /// Look up a single capability
    pub fn capability(&self, key: &str) -> Option<&str> {
        self.capabilities.get(key).map(String::as_str)
    }

    /// Whether this node is the coordinator
    pub fn is_coordinator(&self) -> bool {
        self.role == NodeRole::Coordinator
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.uid, self.role)
    }
}
