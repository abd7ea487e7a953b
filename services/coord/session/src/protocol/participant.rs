use super::{HandlerContext, ProtocolEffect, ProtocolHandler};
use crate::ProtocolError;
use coord_state::{CoordinationPhase, CoordinationState};
use coord_wire::{CoordinationMessage, MessageBody, MessageType, Node, NodeRole};
use std::collections::HashSet;
use tracing::{debug, info};

/// Handles messages while the local node is a participant
#[derive(Debug, Default, Clone, Copy)]
pub struct ParticipantHandler;

/// Reconcile the roster against a topology from the coordinator.
///
/// Removes roster entries missing from `topology` and adds entries missing
/// from the roster. Entries present on both sides are left untouched, so
/// applying the same topology twice is a no-op the second time.
pub fn reconcile_topology(state: &mut CoordinationState, topology: &[Node]) -> Result<(), ProtocolError> {
    let local_uid = state.local_uid().to_string();
    let remote: HashSet<&str> = topology
        .iter()
        .map(Node::uid)
        .filter(|uid| *uid != local_uid)
        .collect();

    for uid in state.node_uids() {
        if !remote.contains(uid.as_str()) {
            state.remove_node(&uid);
        }
    }
    for node in topology {
        if node.uid() != local_uid && !state.contains(node.uid()) {
            state.add_node(node.clone())?;
        }
    }
    Ok(())
}

impl ParticipantHandler {
    fn from_coordinator(ctx: &HandlerContext<'_>, from: &str) -> bool {
        ctx.state.coordinator_uid() == Some(from)
    }
}

impl ProtocolHandler for ParticipantHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Participant
    }

    fn can_handle(&self, message_type: MessageType) -> bool {
        message_type.is_stream_command()
            || matches!(
                message_type,
                MessageType::Heartbeat
                    | MessageType::JoinOffer
                    | MessageType::JoinAccept
                    | MessageType::JoinReject
                    | MessageType::TopologyUpdate
                    | MessageType::ConnectionTestResponse
                    | MessageType::NodeLeaving
                    | MessageType::UserMessage
                    | MessageType::ConfigUpdate
            )
    }

    fn handle(&self, ctx: &mut HandlerContext<'_>, message: &CoordinationMessage) -> Result<(), ProtocolError> {
        let from = message.from_node_uid();
        let local_uid = ctx.local.uid().to_string();

        match message.body() {
            MessageBody::Heartbeat(_) => {
                if Self::from_coordinator(ctx, from) || ctx.state.contains(from) {
                    ctx.state.update_heartbeat(from);
                }
            }
            MessageBody::JoinAccept(accept) => {
                if accept.accepted_node_uid != local_uid {
                    return Ok(());
                }
                info!("Join accepted by {}", from);
                ctx.state.set_coordinator_uid(from);
                reconcile_topology(ctx.state, &accept.current_topology)?;
                ctx.state.update_heartbeat(from);
                ctx.state.transition_to(CoordinationPhase::Ready);
                ctx.effect(ProtocolEffect::JoinAccepted {
                    topology: accept.current_topology.clone(),
                });
            }
            MessageBody::JoinReject(reject) => {
                if reject.rejected_node_uid == local_uid {
                    return Err(ProtocolError::JoinRejected(reject.reason.clone()));
                }
            }
            MessageBody::JoinOffer(offer) => {
                let addressed = offer.target_node_uid.as_deref() == Some(local_uid.as_str());
                if addressed && ctx.state.phase() >= CoordinationPhase::Ready {
                    info!("Coordinator {} no longer lists this node, rejoining", from);
                    ctx.effect(ProtocolEffect::Rejoin);
                }
            }
            MessageBody::TopologyUpdate(update) => {
                if !Self::from_coordinator(ctx, from) {
                    debug!("Ignoring topology from non-coordinator {}", from);
                    return Ok(());
                }
                reconcile_topology(ctx.state, &update.topology)?;
            }
            MessageBody::ConnectionTestResponse(response) => {
                if response.confirmed {
                    ctx.effect(ProtocolEffect::ConnectionConfirmed {
                        test_id: response.test_id.clone(),
                    });
                }
            }
            MessageBody::NodeLeaving(_) => {
                if Self::from_coordinator(ctx, from) {
                    ctx.state.remove_node(from);
                    ctx.effect(ProtocolEffect::CoordinatorLeft {
                        uid: from.to_string(),
                    });
                }
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
            body if body.message_type().is_stream_command() => {
                if Self::from_coordinator(ctx, from) {
                    ctx.effect(ProtocolEffect::StreamCommand(body.clone()));
                } else {
                    debug!("Ignoring {} from non-coordinator {}", body.message_type(), from);
                }
            }
            other => {
                debug!("Participant ignores {}", other.message_type());
            }
        }
        Ok(())
    }
}
