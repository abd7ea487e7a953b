use super::{HandlerContext, ProtocolEffect, ProtocolHandler};
use crate::config::CoordinationConfig;
use crate::ProtocolError;
use coord_state::{CoordinationPhase, CoordinationState};
use coord_wire::{
    ConnectionTestResponse, CoordinationMessage, JoinAccept, JoinOffer, JoinReject, JoinRequest,
    MessageBody, MessageType, NodeRole, TopologyUpdate,
};
use tracing::{debug, info, warn};

/// Rejection reason when the coordinator is not admitting nodes
pub const REJECT_NOT_ACCEPTING: &str = "Not accepting new nodes";
/// Rejection reason when the roster is full
pub const REJECT_CAPACITY: &str = "Maximum nodes reached";

/// Handles messages while the local node is the coordinator
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinatorHandler;

/// Move `Accepting` to `Ready` once enough nodes are present
pub(crate) fn refresh_readiness(state: &mut CoordinationState, config: &CoordinationConfig) {
    if state.phase() == CoordinationPhase::Accepting && state.node_count() + 1 >= config.min_nodes {
        state.transition_to(CoordinationPhase::Ready);
    }
}

fn clamp(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

impl CoordinatorHandler {
    fn broadcast_topology(ctx: &mut HandlerContext<'_>) {
        let topology = ctx.state.topology(ctx.local);
        ctx.send(TopologyUpdate { topology });
    }

    fn handle_heartbeat(ctx: &mut HandlerContext<'_>, from: &str, is_coordinator: bool) {
        if ctx.state.contains(from) {
            ctx.state.update_heartbeat(from);
            return;
        }
        if is_coordinator {
            warn!("Heartbeat from another coordinator {}, ignoring", from);
            return;
        }

        debug!("Heartbeat from unknown node {}, offering a join", from);
        let offer = JoinOffer {
            target_node_uid: Some(from.to_string()),
            network_name: ctx.config.network_name.clone(),
            node_count: clamp(ctx.state.node_count() + 1),
            max_nodes: clamp(ctx.config.max_nodes),
        };
        ctx.send(offer);
    }

    fn handle_join_request(ctx: &mut HandlerContext<'_>, request: &JoinRequest) -> Result<(), ProtocolError> {
        let node = request.node.with_role(NodeRole::Participant);
        let uid = node.uid().to_string();
        if uid == ctx.local.uid() {
            debug!("Ignoring join request carrying the local node");
            return Ok(());
        }

        if ctx.state.contains(&uid) {
            info!("Node {} rejoined", uid);
            ctx.state.add_node(node)?;
            ctx.state.update_heartbeat(&uid);
        } else {
            let reason = if !ctx.state.can_accept_nodes() {
                Some(REJECT_NOT_ACCEPTING)
            } else if ctx.state.node_count() >= ctx.config.max_nodes {
                Some(REJECT_CAPACITY)
            } else {
                None
            };

            if let Some(reason) = reason {
                info!("Rejecting join of {}: {}", uid, reason);
                ctx.send(JoinReject {
                    rejected_node_uid: uid,
                    reason: reason.to_string(),
                });
                return Ok(());
            }

            ctx.state.add_node(node)?;
            info!(
                "Accepted node {} ({}/{} nodes)",
                uid,
                ctx.state.node_count(),
                ctx.config.max_nodes
            );
            refresh_readiness(ctx.state, ctx.config);
        }

        let current_topology = ctx.state.topology(ctx.local);
        ctx.send(JoinAccept {
            accepted_node_uid: uid,
            current_topology,
        });
        Self::broadcast_topology(ctx);
        Ok(())
    }
}

impl ProtocolHandler for CoordinatorHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Coordinator
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::Heartbeat
                | MessageType::ConnectionTest
                | MessageType::JoinRequest
                | MessageType::NodeLeaving
                | MessageType::StreamReady
                | MessageType::UserMessage
                | MessageType::ConfigUpdate
        )
    }

    fn handle(&self, ctx: &mut HandlerContext<'_>, message: &CoordinationMessage) -> Result<(), ProtocolError> {
        let from = message.from_node_uid();
        match message.body() {
            MessageBody::Heartbeat(heartbeat) => {
                Self::handle_heartbeat(ctx, from, heartbeat.is_coordinator);
            }
            MessageBody::ConnectionTest(test) => {
                debug!("Answering connection test {} from {}", test.test_id, from);
                ctx.send(ConnectionTestResponse {
                    test_id: test.test_id.clone(),
                    confirmed: true,
                });
            }
            MessageBody::JoinRequest(request) => {
                Self::handle_join_request(ctx, request)?;
            }
            MessageBody::NodeLeaving(leaving) => {
                if ctx.state.remove_node(from).is_some() {
                    info!(
                        "Node {} left: {}",
                        from,
                        leaving.reason.as_deref().unwrap_or("no reason given")
                    );
                    Self::broadcast_topology(ctx);
                }
            }
            MessageBody::StreamReady(target) => {
                ctx.effect(ProtocolEffect::StreamReady {
                    stream: target.stream_name.clone(),
                    node_uid: from.to_string(),
                });
            }
            MessageBody::UserMessage(user) => {
                ctx.effect(ProtocolEffect::UserMessage {
                    from: from.to_string(),
                    message_id: user.message_id.clone(),
                    payload: user.payload.clone(),
                });
            }
            MessageBody::ConfigUpdate(update) => {
                ctx.effect(ProtocolEffect::ConfigUpdate {
                    from: from.to_string(),
                    config: update.config.clone(),
                });
            }
            other => {
                debug!("Coordinator ignores {}", other.message_type());
            }
        }
        Ok(())
    }
}
