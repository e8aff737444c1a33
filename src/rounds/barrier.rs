//! All-agent rendezvous.
//!
//! Every agent broadcasts one signal for the barrier's round (itself
//! included, through the local fast path); the shared-id instance on each
//! agent counts signals and completes once all participants have signalled
//! *and* the local agent has reached the barrier itself (adoption). An
//! instance created early by a remote signal simply accumulates until the
//! local round catches up and adopts it.

use crate::error::ProtocolError;
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use tracing::debug;

/// One barrier instance.
pub struct Barrier {
    id: String,
    round: usize,
    parent: Option<String>,
    adopted: bool,
    signals: usize,
}

impl Barrier {
    /// Barrier `id` for `round`, reporting to `parent` (or the agent).
    pub fn new(id: &str, round: usize, parent: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            round,
            parent: parent.map(str::to_string),
            adopted: false,
            signals: 0,
        }
    }

    /// Responder factory: builds the instance on the first early signal.
    pub fn responder(msg: &Message) -> Option<Box<dyn Protocol>> {
        match msg.payload {
            Payload::BarrierSignal { round } => {
                Some(Box::new(Barrier::new(&msg.protocol_id, round, None)))
            }
            _ => None,
        }
    }

    /// The broadcastable signal for this barrier.
    pub fn signal(id: &str, round: usize, sender: AgentId) -> Message {
        Message::shared(
            id,
            ProtocolKind::Barrier,
            sender,
            Payload::BarrierSignal { round },
        )
    }

    fn maybe_done(&self, ctx: &Ctx) -> Step {
        if self.adopted && self.signals == ctx.participants.len() {
            Step::Complete(Outcome::Done)
        } else {
            Step::Continue
        }
    }
}

impl Protocol for Barrier {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Barrier
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, _ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.adopted = true;
        Ok(Step::Continue)
    }

    fn on_adopt(&mut self, parent: Option<String>, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.adopted = true;
        self.parent = parent;
        Ok(self.maybe_done(ctx))
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::BarrierSignal { round } = msg.payload else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        if round != self.round {
            return Err(ProtocolError::WrongRound {
                expected: self.round,
                got: round,
                protocol: self.id.clone(),
            });
        }
        self.signals += 1;
        Ok(self.maybe_done(ctx))
    }
}
