//! Heartbeats and stale-node sweeps.

use coord_state::CoordinationState;
use coord_wire::{Heartbeat, Node};
use std::time::Duration;
use tracing::{debug, info};

/// Heartbeat announcing the local role
pub fn heartbeat(state: &CoordinationState) -> Heartbeat {
    Heartbeat {
        is_coordinator: state.is_coordinator(),
    }
}

/// Outcome of one stale sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleSweep {
    /// Nodes removed from the roster
    pub removed: Vec<Node>,
    /// Set when a participant's coordinator went silent
    pub coordinator_lost: Option<String>,
}

impl StaleSweep {
    /// Whether the roster changed
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Remove nodes that missed heartbeats for longer than `timeout`.
///
/// The coordinator sweeps the whole roster, and so does a participant linked
/// to every node (`full_mesh`). A hierarchical participant only hears the
/// coordinator's heartbeats, so it only checks the coordinator and leaves the
/// rest of the roster to topology updates.
pub fn sweep_stale(state: &mut CoordinationState, timeout: Duration, full_mesh: bool) -> StaleSweep {
    let mut sweep = StaleSweep::default();
    if !state.phase().is_established() {
        return sweep;
    }

    let stale = state.stale_nodes(timeout);
    if stale.is_empty() {
        return sweep;
    }

    let coordinator = state.coordinator_uid().map(str::to_string);
    if state.is_coordinator() || full_mesh {
        for uid in stale {
            match state.remove_node(&uid) {
                Some(node) => {
                    info!("Removing stale node {} after {:?} of silence", uid, timeout);
                    sweep.removed.push(node);
                }
                None => debug!("Dropped heartbeat entry of unknown node {}", uid),
            }
            if !state.is_coordinator() && coordinator.as_deref() == Some(uid.as_str()) {
                info!("Coordinator {} missed heartbeats for {:?}", uid, timeout);
                sweep.coordinator_lost = Some(uid);
            }
        }
        return sweep;
    }

    if let Some(coordinator) = coordinator {
        if stale.contains(&coordinator) {
            info!("Coordinator {} missed heartbeats for {:?}", coordinator, timeout);
            if let Some(node) = state.remove_node(&coordinator) {
                sweep.removed.push(node);
            }
            sweep.coordinator_lost = Some(coordinator);
        }
    }
    sweep
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_state::CoordinationPhase;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_removes_silent_nodes() {
        let mut state = CoordinationState::new("c");
        state.become_coordinator("c");
        state.transition_to(CoordinationPhase::Ready);
        state.add_node(Node::new("a", "a")).unwrap();
        state.add_node(Node::new("b", "b")).unwrap();
        assert!(heartbeat(&state).is_coordinator);

        tokio::time::advance(Duration::from_secs(3)).await;
        state.update_heartbeat("b");
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(state.stale_nodes(TIMEOUT), vec!["a".to_string()]);
        let sweep = sweep_stale(&mut state, TIMEOUT, false);
        assert!(sweep.changed());
        assert_eq!(sweep.removed[0].uid(), "a");
        assert_eq!(state.node_uids(), vec!["b".to_string()]);
        assert!(sweep.coordinator_lost.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_only_watches_coordinator() {
        let mut state = CoordinationState::new("p");
        state.become_participant(Some("c".to_string()));
        state.transition_to(CoordinationPhase::Ready);
        state.add_node(Node::new("c", "c")).unwrap();
        state.add_node(Node::new("other", "other")).unwrap();
        assert!(!heartbeat(&state).is_coordinator);

        tokio::time::advance(Duration::from_secs(4)).await;
        state.update_heartbeat("c");
        tokio::time::advance(Duration::from_secs(2)).await;

        // "other" is silent but only the coordinator's liveness matters here
        let sweep = sweep_stale(&mut state, TIMEOUT, false);
        assert!(!sweep.changed());
        assert!(state.contains("other"));

        tokio::time::advance(Duration::from_secs(6)).await;
        let sweep = sweep_stale(&mut state, TIMEOUT, false);
        assert_eq!(sweep.coordinator_lost.as_deref(), Some("c"));
        assert!(!state.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mesh_participant_sweeps_whole_roster() {
        let mut state = CoordinationState::new("p");
        state.become_participant(Some("c".to_string()));
        state.transition_to(CoordinationPhase::Ready);
        state.add_node(Node::new("c", "c")).unwrap();
        state.add_node(Node::new("other", "other")).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        state.update_heartbeat("c");
        tokio::time::advance(Duration::from_secs(2)).await;

        let sweep = sweep_stale(&mut state, TIMEOUT, true);
        assert_eq!(sweep.removed.len(), 1);
        assert_eq!(sweep.removed[0].uid(), "other");
        assert!(sweep.coordinator_lost.is_none());
        assert_eq!(state.node_uids(), vec!["c".to_string()]);

        tokio::time::advance(Duration::from_secs(6)).await;
        let sweep = sweep_stale(&mut state, TIMEOUT, true);
        assert_eq!(sweep.coordinator_lost.as_deref(), Some("c"));
        assert!(state.node_uids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweep_before_established() {
        let mut state = CoordinationState::new("p");
        state.transition_to(CoordinationPhase::Discovering);
        state.update_heartbeat("x");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(sweep_stale(&mut state, TIMEOUT, false), StaleSweep::default());
    }
}
