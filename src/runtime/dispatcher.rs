//! Per-agent protocol dispatcher.
//!
//! The dispatcher multiplexes every protocol instance an agent is running:
//! it routes inbound messages by instance id, builds responders on demand
//! for ids it has never seen, cascades child completions up to parents, and
//! surfaces top-level completions to the agent. Messages are processed
//! strictly in arrival order.

use crate::error::ProtocolError;
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, SpawnRequest, Step};
use crate::runtime::AgentId;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Builds a responder instance for a message whose id is unknown. Returning
/// `None` declines the message (it is then dropped with a warning).
pub type ResponderFactory = fn(&Message) -> Option<Box<dyn Protocol>>;

/// A top-level (parentless) protocol completion, surfaced to the agent.
#[derive(Debug)]
pub struct AgentEvent {
    /// Type of the completed protocol.
    pub kind: ProtocolKind,
    /// Its instance id.
    pub id: String,
    /// Its outcome.
    pub outcome: Outcome,
}

/// Registry of the protocol instances active on one agent.
#[derive(Default)]
pub struct Dispatcher {
    active: HashMap<String, Box<dyn Protocol>>,
    factories: HashMap<ProtocolKind, ResponderFactory>,
}

/// Routing key of a message: responder-bound traffic routes to a sibling
/// entry so the initiator and its local responder coexist in one registry.
fn routing_key(msg: &Message) -> String {
    if msg.to_responder {
        responder_id(&msg.protocol_id)
    } else {
        msg.protocol_id.clone()
    }
}

/// Registry id of the local responder for initiator id `protocol_id`.
pub fn responder_id(protocol_id: &str) -> String {
    format!("{protocol_id}#r")
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the responder factory for a protocol type. Types without a
    /// factory drop messages for unknown ids with a warning.
    pub fn register_responder(&mut self, kind: ProtocolKind, factory: ResponderFactory) {
        self.factories.insert(kind, factory);
    }

    /// Number of active instances.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no instance is active.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether an instance with this registry id is active.
    pub fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Explicitly remove an instance.
    pub fn remove(&mut self, id: &str) {
        self.active.remove(id);
    }

    /// Drop every active instance (inter-round cleanup).
    pub fn clear_all(&mut self) {
        self.active.clear();
    }

    /// Start a spawned protocol, or adopt an existing same-id instance when
    /// the spawn allows it. Returns the top-level completions this triggers.
    pub fn start(
        &mut self,
        spawn: SpawnRequest,
        ctx: &mut Ctx,
    ) -> Result<Vec<AgentEvent>, ProtocolError> {
        let mut events = Vec::new();
        let id = spawn.proto.id().to_string();

        if self.active.contains_key(&id) {
            if !spawn.adopt {
                return Err(ProtocolError::Config(format!(
                    "duplicate protocol id '{id}'"
                )));
            }
            let parent = spawn.proto.parent().map(str::to_string);
            let step = self
                .active
                .get_mut(&id)
                .expect("instance checked above")
                .on_adopt(parent, ctx)?;
            self.conclude(&id, step, ctx, &mut events)?;
            return Ok(events);
        }

        self.active.insert(id.clone(), spawn.proto);
        let step = self
            .active
            .get_mut(&id)
            .expect("instance inserted above")
            .on_start(ctx)?;
        self.conclude(&id, step, ctx, &mut events)?;
        Ok(events)
    }

    /// Route one inbound message, creating a responder if needed.
    pub fn deliver(
        &mut self,
        msg: &Message,
        sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Vec<AgentEvent>, ProtocolError> {
        let mut events = Vec::new();
        let key = routing_key(msg);

        if !self.active.contains_key(&key) {
            if msg.is_completion {
                debug!(
                    protocol = %msg.protocol_id,
                    "dropping completion message for unknown instance"
                );
                return Ok(events);
            }
            let built = self.factories.get(&msg.kind).and_then(|f| f(msg));
            match built {
                Some(responder) => {
                    self.active.insert(key.clone(), responder);
                }
                None => {
                    warn!(
                        protocol = %msg.protocol_id,
                        kind = ?msg.kind,
                        "no responder for unknown instance, dropping message"
                    );
                    return Ok(events);
                }
            }
        }

        let step = self
            .active
            .get_mut(&key)
            .expect("instance present or just created")
            .on_message(msg, sender, ctx)?;
        self.conclude(&key, step, ctx, &mut events)?;
        Ok(events)
    }

    /// Remove a completed instance and cascade the completion to its parent,
    /// repeating while parents complete in turn.
    fn conclude(
        &mut self,
        key: &str,
        step: Step,
        ctx: &mut Ctx,
        events: &mut Vec<AgentEvent>,
    ) -> Result<(), ProtocolError> {
        let Step::Complete(outcome) = step else {
            return Ok(());
        };

        let mut done = vec![(key.to_string(), outcome)];
        while let Some((key, outcome)) = done.pop() {
            let proto = self
                .active
                .remove(&key)
                .expect("completed instance must be registered");
            match proto.parent() {
                Some(parent_id) => match self.active.get_mut(parent_id) {
                    Some(parent) => {
                        let step = parent.on_child_complete(proto.id(), &outcome, ctx)?;
                        if let Step::Complete(parent_outcome) = step {
                            done.push((parent_id.to_string(), parent_outcome));
                        }
                    }
                    None => {
                        debug!(
                            child = %proto.id(),
                            parent = %parent_id,
                            "ignoring completion for a parent that is gone"
                        );
                    }
                },
                None => {
                    events.push(AgentEvent {
                        kind: proto.kind(),
                        id: proto.id().to_string(),
                        outcome,
                    });
                }
            }
        }
        Ok(())
    }
}
