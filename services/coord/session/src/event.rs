//! Session events and the notifier that publishes them.

use coord_runtime::StreamState;
use coord_state::{CoordinationPhase, StateEventHandler};
use coord_wire::{Metadata, Node};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEventKind {
    /// Coordination phase changed
    PhaseChanged {
        /// Previous phase
        from: CoordinationPhase,
        /// New phase
        to: CoordinationPhase,
    },
    /// Node entered the roster
    NodeJoined {
        /// The node
        node: Node,
    },
    /// Node left the roster
    NodeLeft {
        /// The node
        node: Node,
    },
    /// A participant reported a stream ready
    StreamReady {
        /// Stream name
        stream: String,
        /// Reporting node
        node_uid: String,
    },
    /// Local stream changed state
    StreamStateChanged {
        /// Stream name
        stream: String,
        /// New state
        state: StreamState,
    },
    /// Application message from another node
    UserMessage {
        /// Sender uid
        from: String,
        /// Application-chosen message ID
        message_id: String,
        /// Application payload
        payload: Metadata,
    },
    /// Configuration change from another node
    ConfigUpdate {
        /// Sender uid
        from: String,
        /// Changed keys
        config: Metadata,
    },
    /// Coordinator went away (left or stale)
    CoordinatorLost {
        /// Uid of the lost coordinator
        uid: String,
    },
    /// Join attempt failed
    JoinFailed {
        /// Failure reason
        reason: String,
    },
    /// An execution unit was permanently disabled
    Fatal {
        /// Unit id
        unit: String,
        /// Why recovery was refused
        reason: String,
    },
}

/// Event published on the session event bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Per-session sequence number, starting at 1
    pub sequence: u64,
    /// Uid of the node that published the event
    pub originator: String,
    /// Event payload
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

/// Publishes session events to every current subscriber.
///
/// Subscribers that register after an event was sent never see it. The
/// notifier is also the [`StateEventHandler`] of the control loop's state, so
/// phase and roster changes reach the bus after they are committed.
#[derive(Debug, Clone)]
pub struct SessionEventNotifier {
    local_uid: String,
    event_tx: broadcast::Sender<SessionEvent>,
    sequence_counter: Arc<AtomicU64>,
}

impl SessionEventNotifier {
    /// Create a notifier publishing on `event_tx`
    pub fn new(local_uid: impl Into<String>, event_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            local_uid: local_uid.into(),
            event_tx,
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to events sent from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event
    pub fn send(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            sequence: self.next_sequence(),
            originator: self.local_uid.clone(),
            kind,
        };
        let sequence = event.sequence;
        if self.event_tx.send(event).is_err() {
            debug!("No subscribers for session event {}", sequence);
        }
    }

    /// A participant reported a stream ready
    pub fn notify_stream_ready(&self, stream: &str, node_uid: &str) {
        info!("Stream {} ready on node {}", stream, node_uid);
        self.send(SessionEventKind::StreamReady {
            stream: stream.to_string(),
            node_uid: node_uid.to_string(),
        });
    }

    /// A local stream changed state
    pub fn notify_stream_state(&self, stream: &str, state: StreamState) {
        debug!("Stream {} is now {}", stream, state);
        self.send(SessionEventKind::StreamStateChanged {
            stream: stream.to_string(),
            state,
        });
    }

    /// The coordinator is gone
    pub fn notify_coordinator_lost(&self, uid: &str) {
        warn!("Lost coordinator {}", uid);
        self.send(SessionEventKind::CoordinatorLost {
            uid: uid.to_string(),
        });
    }

    /// A join attempt failed
    pub fn notify_join_failed(&self, reason: &str) {
        warn!("Join failed: {}", reason);
        self.send(SessionEventKind::JoinFailed {
            reason: reason.to_string(),
        });
    }

    /// A unit was disabled for good
    pub fn notify_fatal(&self, unit: &str, reason: &str) {
        warn!("Unit {} disabled: {}", unit, reason);
        self.send(SessionEventKind::Fatal {
            unit: unit.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl StateEventHandler for SessionEventNotifier {
    fn notify_phase_changed(&self, from: CoordinationPhase, to: CoordinationPhase) {
        self.send(SessionEventKind::PhaseChanged { from, to });
    }

    fn notify_node_joined(&self, node: &Node) {
        info!("Node {} ({}) joined", node.id(), node.uid());
        self.send(SessionEventKind::NodeJoined { node: node.clone() });
    }

    fn notify_node_left(&self, node: &Node) {
        info!("Node {} ({}) left", node.id(), node.uid());
        self.send(SessionEventKind::NodeLeft { node: node.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_and_late_subscribers() {
        let (tx, mut early) = broadcast::channel(16);
        let notifier = SessionEventNotifier::new("n1", tx);

        notifier.notify_phase_changed(CoordinationPhase::Idle, CoordinationPhase::Discovering);
        let mut late = notifier.subscribe();
        notifier.notify_join_failed("nope");

        let first = early.try_recv().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.originator, "n1");
        assert!(matches!(first.kind, SessionEventKind::PhaseChanged { .. }));
        assert_eq!(early.try_recv().unwrap().sequence, 2);

        // The late subscriber only sees what was sent after it registered
        let seen = late.try_recv().unwrap();
        assert_eq!(seen.sequence, 2);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let notifier = SessionEventNotifier::new("n1", tx);
        notifier.notify_node_joined(&Node::new("a", "a-uid"));
        notifier.notify_stream_ready("s1", "a-uid");
    }
}
