//! Coordination phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the coordination state machine.
///
/// Declaration order follows the intended progression, so phases compare with
/// `<`/`>=` (e.g. role fields are meaningful once `phase >= Established`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum CoordinationPhase {
    /// Not participating in any network
    #[default]
    Idle,
    /// Looking for an existing network or other candidates
    Discovering,
    /// Choosing a coordinator among the candidates
    Electing,
    /// Role has been decided
    Established,
    /// Coordinator is admitting nodes
    Accepting,
    /// Enough nodes are present (coordinator) or join accepted (participant)
    Ready,
    /// At least one stream is running
    Active,
    /// Every stream is paused
    Paused,
    /// Tearing down
    Disposing,
}

impl CoordinationPhase {
    /// Whether the role fields of the state are meaningful in this phase
    pub fn is_established(&self) -> bool {
        *self >= CoordinationPhase::Established && *self != CoordinationPhase::Disposing
    }

    /// Phase name as used in logs and snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationPhase::Idle => "idle",
            CoordinationPhase::Discovering => "discovering",
            CoordinationPhase::Electing => "electing",
            CoordinationPhase::Established => "established",
            CoordinationPhase::Accepting => "accepting",
            CoordinationPhase::Ready => "ready",
            CoordinationPhase::Active => "active",
            CoordinationPhase::Paused => "paused",
            CoordinationPhase::Disposing => "disposing",
        }
    }
}

impl fmt::Display for CoordinationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(CoordinationPhase::Idle < CoordinationPhase::Discovering);
        assert!(CoordinationPhase::Established < CoordinationPhase::Ready);
        assert!(CoordinationPhase::Active < CoordinationPhase::Paused);

        assert!(!CoordinationPhase::Electing.is_established());
        assert!(CoordinationPhase::Accepting.is_established());
        assert!(!CoordinationPhase::Disposing.is_established());
    }
}
