//! Coordination state owner.

use crate::{CoordinationPhase, StateError, StateEventHandler};
use coord_wire::{Node, NodeRole};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Read-only view of the coordination state at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Current phase
    pub phase: CoordinationPhase,
    /// Whether the local node is the coordinator
    pub is_coordinator: bool,
    /// Coordinator uid once established
    pub coordinator_uid: Option<String>,
    /// Connected nodes (excluding the local node), ordered by uid
    pub connected_nodes: Vec<Node>,
}

/// Phase, role, and roster of the local node.
///
/// The roster never contains the local node itself. Heartbeat timestamps use
/// the tokio clock so staleness can be tested with a paused runtime.
#[derive(Debug)]
pub struct CoordinationState {
    local_uid: String,
    phase: CoordinationPhase,
    is_coordinator: bool,
    coordinator_uid: Option<String>,
    nodes: HashMap<String, Node>,
    last_heartbeat: HashMap<String, Instant>,
    event_handler: Option<Arc<dyn StateEventHandler>>,
}

impl CoordinationState {
    /// Create an idle state for the node identified by `local_uid`
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            phase: CoordinationPhase::Idle,
            is_coordinator: false,
            coordinator_uid: None,
            nodes: HashMap::new(),
            last_heartbeat: HashMap::new(),
            event_handler: None,
        }
    }

    /// Set the event handler for state notifications
    pub fn set_event_handler(&mut self, handler: Arc<dyn StateEventHandler>) {
        self.event_handler = Some(handler);
    }

    /// Uid of the local node
    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    /// Current phase
    pub fn phase(&self) -> CoordinationPhase {
        self.phase
    }

    /// Whether the local node is the coordinator (false until established)
    pub fn is_coordinator(&self) -> bool {
        self.phase.is_established() && self.is_coordinator
    }

    /// Coordinator uid (None until established)
    pub fn coordinator_uid(&self) -> Option<&str> {
        if self.phase.is_established() {
            self.coordinator_uid.as_deref()
        } else {
            None
        }
    }

    /// Move to `phase`. Returns whether anything changed.
    pub fn transition_to(&mut self, phase: CoordinationPhase) -> bool {
        if self.phase == phase {
            return false;
        }

        let from = self.phase;
        self.phase = phase;
        info!("Coordination phase {} -> {}", from, phase);

        if let Some(handler) = &self.event_handler {
            handler.notify_phase_changed(from, phase);
        }
        true
    }

    /// Take the coordinator role and move to `Established`
    pub fn become_coordinator(&mut self, uid: impl Into<String>) {
        self.is_coordinator = true;
        self.coordinator_uid = Some(uid.into());
        self.transition_to(CoordinationPhase::Established);
    }

    /// Take the participant role and move to `Established`
    pub fn become_participant(&mut self, coordinator_uid: Option<String>) {
        self.is_coordinator = false;
        self.coordinator_uid = coordinator_uid;
        self.transition_to(CoordinationPhase::Established);
    }

    /// Record the coordinator learned after the role was taken
    pub fn set_coordinator_uid(&mut self, uid: impl Into<String>) {
        self.coordinator_uid = Some(uid.into());
    }

    /// Add or refresh a node.
    ///
    /// Returns `Ok(true)` when the node was previously unknown (a joined event
    /// is emitted) and `Ok(false)` when an existing entry was replaced in place
    /// (no event). A newly added node counts as seen now.
    pub fn add_node(&mut self, node: Node) -> Result<bool, StateError> {
        if node.uid() == self.local_uid {
            return Err(StateError::LocalNode(node.uid().to_string()));
        }
        if self.phase == CoordinationPhase::Disposing {
            return Err(StateError::Disposing);
        }

        let uid = node.uid().to_string();
        if let Some(existing) = self.nodes.get_mut(&uid) {
            *existing = node;
            debug!("Refreshed node {}", uid);
            return Ok(false);
        }

        self.last_heartbeat.entry(uid.clone()).or_insert_with(Instant::now);
        info!("Node joined roster: {}", node);
        self.nodes.insert(uid, node.clone());

        if let Some(handler) = &self.event_handler {
            handler.notify_node_joined(&node);
        }
        Ok(true)
    }

    /// Remove a node, returning it if it was present
    pub fn remove_node(&mut self, uid: &str) -> Option<Node> {
        self.last_heartbeat.remove(uid);
        let node = self.nodes.remove(uid)?;
        info!("Node left roster: {}", node);

        if let Some(handler) = &self.event_handler {
            handler.notify_node_left(&node);
        }
        Some(node)
    }

    /// Refresh the last-seen timestamp of `uid`
    pub fn update_heartbeat(&mut self, uid: &str) {
        self.last_heartbeat.insert(uid.to_string(), Instant::now());
    }

    /// Last heartbeat recorded for `uid`
    pub fn last_heartbeat(&self, uid: &str) -> Option<Instant> {
        self.last_heartbeat.get(uid).copied()
    }

    /// Uids whose last heartbeat is older than `timeout`, ordered by uid
    pub fn stale_nodes(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale: Vec<String> = self
            .last_heartbeat
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(uid, _)| uid.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Whether `uid` is in the roster
    pub fn contains(&self, uid: &str) -> bool {
        self.nodes.contains_key(uid)
    }

    /// Copy of a single roster entry
    pub fn node(&self, uid: &str) -> Option<Node> {
        self.nodes.get(uid).cloned()
    }

    /// Number of connected nodes (excluding the local node)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Snapshot of the roster, ordered by uid
    pub fn connected_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.uid().cmp(b.uid()));
        nodes
    }

    /// Uids of the roster
    pub fn node_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.nodes.keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Whether a join request may currently be accepted
    pub fn can_accept_nodes(&self) -> bool {
        self.is_coordinator()
            && matches!(
                self.phase,
                CoordinationPhase::Accepting | CoordinationPhase::Ready
            )
    }

    /// Full topology as seen by this node: `local` (with its current role) plus the roster
    pub fn topology(&self, local: &Node) -> Vec<Node> {
        let role = if !self.phase.is_established() {
            NodeRole::Unassigned
        } else if self.is_coordinator {
            NodeRole::Coordinator
        } else {
            NodeRole::Participant
        };

        let mut topology = Vec::with_capacity(self.nodes.len() + 1);
        topology.push(local.with_role(role));
        topology.extend(self.connected_nodes());
        topology
    }

    /// Read-only view of the current state
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase,
            is_coordinator: self.is_coordinator(),
            coordinator_uid: self.coordinator_uid().map(str::to_string),
            connected_nodes: self.connected_nodes(),
        }
    }

    /// Drop role and roster and return to `Idle`. No left events are emitted.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.last_heartbeat.clear();
        self.is_coordinator = false;
        self.coordinator_uid = None;
        self.transition_to(CoordinationPhase::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl StateEventHandler for Recorder {
        fn notify_phase_changed(&self, from: CoordinationPhase, to: CoordinationPhase) {
            self.events.lock().unwrap().push(format!("phase:{}->{}", from, to));
        }

        fn notify_node_joined(&self, node: &Node) {
            self.events.lock().unwrap().push(format!("joined:{}", node.uid()));
        }

        fn notify_node_left(&self, node: &Node) {
            self.events.lock().unwrap().push(format!("left:{}", node.uid()));
        }
    }

    fn state_with_recorder() -> (CoordinationState, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut state = CoordinationState::new("local");
        state.set_event_handler(recorder.clone());
        (state, recorder)
    }

    #[test]
    fn test_transition_is_noop_when_unchanged() {
        let (mut state, recorder) = state_with_recorder();

        assert!(!state.transition_to(CoordinationPhase::Idle));
        assert!(state.transition_to(CoordinationPhase::Discovering));
        assert!(!state.transition_to(CoordinationPhase::Discovering));

        assert_eq!(recorder.take(), vec!["phase:idle->discovering"]);
    }

    #[test]
    fn test_role_fields_hidden_until_established() {
        let mut state = CoordinationState::new("local");
        state.set_coordinator_uid("c");
        assert_eq!(state.coordinator_uid(), None);

        state.become_participant(Some("c".into()));
        assert_eq!(state.phase(), CoordinationPhase::Established);
        assert_eq!(state.coordinator_uid(), Some("c"));
        assert!(!state.is_coordinator());

        state.become_coordinator("local");
        assert!(state.is_coordinator());
        assert_eq!(state.coordinator_uid(), Some("local"));
    }

    #[test]
    fn test_add_node_refresh_emits_no_event() {
        let (mut state, recorder) = state_with_recorder();

        assert_eq!(state.add_node(Node::new("a", "uid-a")), Ok(true));
        let refreshed = Node::new("a", "uid-a").with_capability("gain", "2");
        assert_eq!(state.add_node(refreshed), Ok(false));

        assert_eq!(recorder.take(), vec!["joined:uid-a"]);
        assert_eq!(state.node("uid-a").unwrap().capability("gain"), Some("2"));
        assert_eq!(state.node_count(), 1);
    }

    #[test]
    fn test_local_node_never_enters_roster() {
        let mut state = CoordinationState::new("local");
        assert_eq!(
            state.add_node(Node::new("me", "local")),
            Err(StateError::LocalNode("local".into()))
        );
        assert_eq!(state.node_count(), 0);
    }

    #[test]
    fn test_remove_node_emits_left_once() {
        let (mut state, recorder) = state_with_recorder();
        state.add_node(Node::new("a", "uid-a")).unwrap();
        recorder.take();

        assert!(state.remove_node("uid-a").is_some());
        assert!(state.remove_node("uid-a").is_none());
        assert_eq!(recorder.take(), vec!["left:uid-a"]);
        assert!(state.last_heartbeat("uid-a").is_none());
    }

    #[test]
    fn test_can_accept_nodes() {
        let mut state = CoordinationState::new("local");
        assert!(!state.can_accept_nodes());

        state.become_coordinator("local");
        assert!(!state.can_accept_nodes());

        state.transition_to(CoordinationPhase::Accepting);
        assert!(state.can_accept_nodes());
        state.transition_to(CoordinationPhase::Ready);
        assert!(state.can_accept_nodes());
        state.transition_to(CoordinationPhase::Active);
        assert!(!state.can_accept_nodes());

        let mut participant = CoordinationState::new("p");
        participant.become_participant(Some("local".into()));
        participant.transition_to(CoordinationPhase::Ready);
        assert!(!participant.can_accept_nodes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_nodes() {
        let mut state = CoordinationState::new("local");
        state.add_node(Node::new("a", "uid-a")).unwrap();
        state.add_node(Node::new("b", "uid-b")).unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        state.update_heartbeat("uid-b");
        assert!(state.stale_nodes(Duration::from_secs(5)).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(state.stale_nodes(Duration::from_secs(5)), vec!["uid-a"]);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            state.stale_nodes(Duration::from_secs(5)),
            vec!["uid-a", "uid-b"]
        );
    }

    #[test]
    fn test_topology_includes_local_node_first() {
        let mut state = CoordinationState::new("c");
        state.become_coordinator("c");
        state.add_node(Node::new("b", "uid-b")).unwrap();
        state.add_node(Node::new("a", "uid-a")).unwrap();

        let local = Node::new("coord", "c");
        let topology = state.topology(&local);
        let uids: Vec<&str> = topology.iter().map(|n| n.uid()).collect();
        assert_eq!(uids, vec!["c", "uid-a", "uid-b"]);
        assert!(topology[0].is_coordinator());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let (mut state, recorder) = state_with_recorder();
        state.become_coordinator("local");
        state.add_node(Node::new("a", "uid-a")).unwrap();
        recorder.take();

        state.reset();
        assert_eq!(state.phase(), CoordinationPhase::Idle);
        assert_eq!(state.node_count(), 0);
        assert!(!state.is_coordinator());
        assert_eq!(recorder.take(), vec!["phase:established->idle"]);
    }
}
