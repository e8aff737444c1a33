//! Shares-to-plaintext reconstruction.
//!
//! Each peer sends its share of the requested key back to the initiator,
//! which interpolates the plaintext once every participant has answered.
//! Collecting all N shares (rather than a bare threshold) also covers the
//! degree-doubled polynomials the multiplication protocol reveals. Only the
//! initiator learns the value.

use crate::error::ProtocolError;
use crate::runtime::dispatcher::responder_id;
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use crate::shamir;
use crate::share::Share;
use tracing::debug;

/// Initiator: collect shares of `key` and interpolate at the origin.
pub struct Reconstruct {
    id: String,
    parent: Option<String>,
    key: String,
    shares: Vec<Share>,
    expected: usize,
}

impl Reconstruct {
    /// Reconstruct the secret stored under `key`.
    pub fn new(id: &str, parent: Option<&str>, key: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            key: key.to_string(),
            shares: Vec::new(),
            expected: 0,
        }
    }
}

impl Protocol for Reconstruct {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Reconstruct
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expected = ctx.participants.len();
        let msg = Message::request(
            &self.id,
            ProtocolKind::Reconstruct,
            ctx.me,
            Payload::ReconstructRequest {
                key: self.key.clone(),
            },
        );
        ctx.broadcast(&msg);
        Ok(Step::Continue)
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::ReconstructShare { share } = &msg.payload else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        self.shares.push(*share);
        if self.shares.len() == self.expected {
            let value = shamir::reconstruct(&self.shares, ctx.prime)?;
            Ok(Step::Complete(Outcome::Value(value)))
        } else {
            Ok(Step::Continue)
        }
    }
}

/// Responder: sends the local share of the requested key.
pub struct ReconstructResponder {
    id: String,
}

/// Responder factory for [ProtocolKind::Reconstruct] messages.
pub fn reconstruct_responder(msg: &Message) -> Option<Box<dyn Protocol>> {
    matches!(msg.payload, Payload::ReconstructRequest { .. }).then(|| {
        Box::new(ReconstructResponder {
            id: responder_id(&msg.protocol_id),
        }) as Box<dyn Protocol>
    })
}

impl Protocol for ReconstructResponder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Reconstruct
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::ReconstructRequest { key } = &msg.payload else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        let share = ctx.get_share(key)?;
        ctx.send(
            msg.sender,
            Message::reply(
                &msg.protocol_id,
                ProtocolKind::Reconstruct,
                ctx.me,
                Payload::ReconstructShare { share },
            ),
        );
        Ok(Step::Complete(Outcome::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::mpc::distribute::ShareDistribution;
    use crate::runtime::protocol::Outcome;
    use crate::sim::testkit::{self, run_protocol};

    #[test]
    fn test_reconstruct_returns_plaintext_to_initiator() {
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 41);
        run_protocol(
            &mut sim,
            1,
            Box::new(ShareDistribution::new("t/d", None, "S", 987_654, false)),
        );
        // a different agent than the distributor reconstructs
        let outcome = run_protocol(&mut sim, 4, Box::new(Reconstruct::new("t/r", None, "S")));
        assert_eq!(outcome, Outcome::Value(987_654));
    }

    #[test]
    fn test_reconstruct_missing_key_is_fatal() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 42);
        sim.agent_mut(2)
            .inject(Box::new(Reconstruct::new("t/r", None, "ABSENT")))
            .unwrap();
        let failed = (0..100).any(|_| sim.tick().is_err());
        assert!(failed);
    }
}
