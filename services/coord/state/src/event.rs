//! Observer seam for state changes.

use crate::CoordinationPhase;
use coord_wire::Node;

/// Receives notifications after the coordination state has changed
pub trait StateEventHandler: Send + Sync + std::fmt::Debug {
    /// Phase moved from `from` to `to`
    fn notify_phase_changed(&self, from: CoordinationPhase, to: CoordinationPhase);
    /// A previously unknown node was added to the roster
    fn notify_node_joined(&self, node: &Node);
    /// A node was removed from the roster
    fn notify_node_left(&self, node: &Node);
}
