//! Coordinator election among discovered candidates.
//!
//! Every node runs the election over the candidates it has discovered
//! (itself included). Both strategies are deterministic functions of the
//! candidate set, so nodes that see the same set promote the same node.

use crate::config::PromotionStrategy;
use chrono::{DateTime, Utc};
use coord_resource::StreamDescriptor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Descriptor property carrying the human-readable node id
pub const NODE_ID_PROPERTY: &str = "nodeId";
/// Descriptor property carrying the network name
pub const NETWORK_PROPERTY: &str = "network";

/// A node that could become coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Node uid
    pub uid: String,
    /// Human-readable node id
    pub id: String,
    /// When the node published its coordination endpoint
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Candidate described by a coordination endpoint
    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        Self {
            uid: descriptor.source_id.clone(),
            id: descriptor
                .property(NODE_ID_PROPERTY)
                .unwrap_or(&descriptor.source_id)
                .to_string(),
            created_at: descriptor.created_at,
        }
    }
}

/// Pick the coordinator. Returns `None` only for an empty candidate set.
pub fn elect(strategy: PromotionStrategy, candidates: &[Candidate]) -> Option<&Candidate> {
    match strategy {
        PromotionStrategy::First => candidates
            .iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uid.cmp(&b.uid))),
        PromotionStrategy::Random => {
            let mut sorted: Vec<&Candidate> = candidates.iter().collect();
            if sorted.is_empty() {
                return None;
            }
            sorted.sort_by(|a, b| a.uid.cmp(&b.uid));
            sorted.dedup_by(|a, b| a.uid == b.uid);

            let mut hasher = crc32fast::Hasher::new();
            for candidate in &sorted {
                hasher.update(candidate.uid.as_bytes());
                hasher.update(&[0]);
            }
            let mut rng = StdRng::seed_from_u64(u64::from(hasher.finalize()));
            let index = rng.gen_range(0..sorted.len());
            Some(sorted[index])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(uid: &str, secs: i64) -> Candidate {
        Candidate {
            uid: uid.to_string(),
            id: uid.to_string(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_prefers_oldest_then_uid() {
        let candidates = vec![candidate("c", 20), candidate("b", 10), candidate("a", 30)];
        assert_eq!(elect(PromotionStrategy::First, &candidates).unwrap().uid, "b");

        let tied = vec![candidate("z", 10), candidate("m", 10)];
        assert_eq!(elect(PromotionStrategy::First, &tied).unwrap().uid, "m");
    }

    #[test]
    fn test_random_is_order_independent() {
        let forward = vec![candidate("a", 1), candidate("b", 2), candidate("c", 3), candidate("d", 4)];
        let mut backward = forward.clone();
        backward.reverse();

        let one = elect(PromotionStrategy::Random, &forward).unwrap().uid.clone();
        let two = elect(PromotionStrategy::Random, &backward).unwrap().uid.clone();
        assert_eq!(one, two);
    }

    #[test]
    fn test_empty_set_elects_nobody() {
        assert!(elect(PromotionStrategy::First, &[]).is_none());
        assert!(elect(PromotionStrategy::Random, &[]).is_none());
    }

    #[test]
    fn test_candidate_from_descriptor() {
        let descriptor = StreamDescriptor::new("net/coordination/u1", "coordination", "u1")
            .with_property(NODE_ID_PROPERTY, "alpha");
        let candidate = Candidate::from_descriptor(&descriptor);
        assert_eq!(candidate.uid, "u1");
        assert_eq!(candidate.id, "alpha");
        assert_eq!(candidate.created_at, descriptor.created_at);
    }
}
