//! Role-specific protocol handlers.
//!
//! The control loop owns the [`CoordinationState`] and hands every decoded
//! message to the handler matching the local role. Handlers never touch the
//! transport: replies go into the context's outgoing queue and anything the
//! session has to act on is returned as a [`ProtocolEffect`].

mod coordinator;
mod participant;

pub(crate) use coordinator::refresh_readiness;
pub use coordinator::{CoordinatorHandler, REJECT_CAPACITY, REJECT_NOT_ACCEPTING};
pub use participant::{reconcile_topology, ParticipantHandler};

use crate::config::CoordinationConfig;
use crate::ProtocolError;
use coord_state::CoordinationState;
use coord_wire::{CoordinationMessage, MessageBody, MessageType, Metadata, Node, NodeRole};

/// Something the session must act on after a message was handled
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEffect {
    /// Stream lifecycle command for the local stream registry
    StreamCommand(MessageBody),
    /// A participant reported a stream ready
    StreamReady {
        /// Stream name
        stream: String,
        /// Reporting node
        node_uid: String,
    },
    /// Application message
    UserMessage {
        /// Sender uid
        from: String,
        /// Application-chosen message ID
        message_id: String,
        /// Application payload
        payload: Metadata,
    },
    /// Configuration change
    ConfigUpdate {
        /// Sender uid
        from: String,
        /// Changed keys
        config: Metadata,
    },
    /// This node's join was accepted
    JoinAccepted {
        /// Topology carried by the accept
        topology: Vec<Node>,
    },
    /// The coordinator no longer knows this node; a fresh join request is due
    Rejoin,
    /// A connection test was answered
    ConnectionConfirmed {
        /// Test id
        test_id: String,
    },
    /// The coordinator announced its departure
    CoordinatorLeft {
        /// Coordinator uid
        uid: String,
    },
}

/// Everything a handler may read or change while handling one message
pub struct HandlerContext<'a> {
    /// Coordination state of the local node
    pub state: &'a mut CoordinationState,
    /// Local node identity
    pub local: &'a Node,
    /// Session configuration
    pub config: &'a CoordinationConfig,
    outgoing: Vec<MessageBody>,
    effects: Vec<ProtocolEffect>,
}

impl<'a> HandlerContext<'a> {
    /// Create a context with empty queues
    pub fn new(state: &'a mut CoordinationState, local: &'a Node, config: &'a CoordinationConfig) -> Self {
        Self {
            state,
            local,
            config,
            outgoing: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Queue a message for broadcast on the local coordination endpoint
    pub fn send(&mut self, body: impl Into<MessageBody>) {
        self.outgoing.push(body.into());
    }

    /// Queue an effect for the session
    pub fn effect(&mut self, effect: ProtocolEffect) {
        self.effects.push(effect);
    }

    /// Local node carrying its current role
    pub fn local_with_role(&self) -> Node {
        let role = if self.state.is_coordinator() {
            NodeRole::Coordinator
        } else {
            NodeRole::Participant
        };
        self.local.with_role(role)
    }

    /// Queued messages and effects, in order
    pub fn into_outputs(self) -> (Vec<MessageBody>, Vec<ProtocolEffect>) {
        (self.outgoing, self.effects)
    }
}

/// Message handler for one role
pub trait ProtocolHandler: Send + Sync {
    /// Role this handler implements
    fn role(&self) -> NodeRole;

    /// Whether messages of `message_type` are handled
    fn can_handle(&self, message_type: MessageType) -> bool;

    /// Handle one message
    fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &CoordinationMessage,
    ) -> Result<(), ProtocolError>;
}

/// Handler for the current role of `state`
pub fn handler_for(state: &CoordinationState) -> &'static dyn ProtocolHandler {
    static COORDINATOR: CoordinatorHandler = CoordinatorHandler;
    static PARTICIPANT: ParticipantHandler = ParticipantHandler;

    if state.is_coordinator() {
        &COORDINATOR
    } else {
        &PARTICIPANT
    }
}
