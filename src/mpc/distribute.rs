//! Plaintext-to-shares distribution.
//!
//! The initiator holds a plaintext value, generates one Shamir share per
//! participant with threshold `floor(N/2)`, and sends participant `k` the
//! share evaluated at index `k`. Vector distribution runs one child
//! distribution per entry and completes when every entry has landed.

use crate::error::ProtocolError;
use crate::mpc::vector_key;
use crate::runtime::dispatcher::responder_id;
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use crate::shamir;
use std::collections::HashSet;
use tracing::debug;

/// Initiator: share a plaintext value to all participants.
pub struct ShareDistribution {
    id: String,
    parent: Option<String>,
    key: String,
    value: u64,
    sticky: bool,
    acks: usize,
    expected: usize,
}

impl ShareDistribution {
    /// Distribute `value` under storage key `key` on every participant.
    pub fn new(id: &str, parent: Option<&str>, key: &str, value: u64, sticky: bool) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            key: key.to_string(),
            value,
            sticky,
            acks: 0,
            expected: 0,
        }
    }
}

impl Protocol for ShareDistribution {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Distribute
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expected = ctx.participants.len();
        let indices: Vec<u64> = ctx.participants.iter().map(|&a| a as u64).collect();
        let shares = shamir::generate_shares(
            self.value,
            &indices,
            ctx.threshold(),
            ctx.prime,
            ctx.crypto_rng,
        )?;
        for (&participant, share) in ctx.participants.iter().zip(shares) {
            let msg = Message::request(
                &self.id,
                ProtocolKind::Distribute,
                ctx.me,
                Payload::DistributeShare {
                    key: self.key.clone(),
                    share,
                    sticky: self.sticky,
                },
            );
            ctx.send(participant, msg);
        }
        Ok(Step::Continue)
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        _ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        match msg.payload {
            Payload::Ack => {
                self.acks += 1;
                if self.acks == self.expected {
                    Ok(Step::Complete(Outcome::Done))
                } else {
                    Ok(Step::Continue)
                }
            }
            _ => {
                debug!(protocol = %self.id, "ignoring unexpected message");
                Ok(Step::Continue)
            }
        }
    }
}

/// Responder: files the received share and acks.
pub struct DistributeResponder {
    id: String,
}

/// Responder factory for [ProtocolKind::Distribute] messages.
pub fn distribute_responder(msg: &Message) -> Option<Box<dyn Protocol>> {
    matches!(msg.payload, Payload::DistributeShare { .. }).then(|| {
        Box::new(DistributeResponder {
            id: responder_id(&msg.protocol_id),
        }) as Box<dyn Protocol>
    })
}

impl Protocol for DistributeResponder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Distribute
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::DistributeShare { key, share, sticky } = &msg.payload else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        if *sticky {
            ctx.storage.store_sticky(key, *share);
        } else {
            let tag = ctx.tag();
            ctx.storage.store(key, *share, &tag);
        }
        ctx.send(
            msg.sender,
            Message::reply(
                &msg.protocol_id,
                ProtocolKind::Distribute,
                ctx.me,
                Payload::Ack,
            ),
        );
        Ok(Step::Complete(Outcome::Done))
    }
}

/// Initiator: share a plaintext vector, one child distribution per entry.
/// Entry `i` lands under `vector_key(base, i)` on every participant.
pub struct VectorShareDistribution {
    id: String,
    parent: Option<String>,
    base: String,
    values: Vec<u64>,
    sticky: bool,
    pending: HashSet<String>,
}

impl VectorShareDistribution {
    /// Distribute `values` under keys `base[0]..base[len-1]`.
    pub fn new(id: &str, parent: Option<&str>, base: &str, values: Vec<u64>, sticky: bool) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            base: base.to_string(),
            values,
            sticky,
            pending: HashSet::new(),
        }
    }
}

impl Protocol for VectorShareDistribution {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::VectorDistribute
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        if self.values.is_empty() {
            return Err(ProtocolError::Config(format!(
                "vector distribution '{}' over an empty vector",
                self.id
            )));
        }
        for (i, &value) in self.values.iter().enumerate() {
            let child_id = format!("{}/{i}", self.id);
            let child = ShareDistribution::new(
                &child_id,
                Some(&self.id),
                &vector_key(&self.base, i),
                value,
                self.sticky,
            );
            self.pending.insert(child_id);
            ctx.spawn(Box::new(child));
        }
        Ok(Step::Continue)
    }

    fn on_message(
        &mut self,
        _msg: &Message,
        _sender: AgentId,
        _ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        debug!(protocol = %self.id, "ignoring unexpected message");
        Ok(Step::Continue)
    }

    fn on_child_complete(
        &mut self,
        child: &str,
        _outcome: &Outcome,
        _ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        if !self.pending.remove(child) {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        if self.pending.is_empty() {
            Ok(Step::Complete(Outcome::Done))
        } else {
            Ok(Step::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::MERSENNE_31 as P;
    use crate::shamir;
    use crate::sim::testkit::{self, collect_shares, run_protocol};

    #[test]
    fn test_distribute_lands_on_every_agent() {
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 23);
        run_protocol(
            &mut sim,
            3,
            Box::new(ShareDistribution::new("t/d", None, "S", 123_456, false)),
        );
        let shares = collect_shares(&sim, "S");
        assert_eq!(shares.len(), 5);
        for (i, share) in shares.iter().enumerate() {
            assert_eq!(share.index, i as u64 + 1);
        }
        assert_eq!(shamir::reconstruct(&shares, P).unwrap(), 123_456);
    }

    #[test]
    fn test_vector_distribution() {
        let mut sim = testkit::fixture(4, Algorithm::Pdsa, 24);
        run_protocol(
            &mut sim,
            1,
            Box::new(VectorShareDistribution::new(
                "t/v",
                None,
                "W",
                vec![10, 20, 30],
                false,
            )),
        );
        for (i, expected) in [10u64, 20, 30].into_iter().enumerate() {
            let shares = collect_shares(&sim, &vector_key("W", i));
            assert_eq!(shamir::reconstruct(&shares, P).unwrap(), expected);
        }
    }

    #[test]
    fn test_sticky_distribution_survives_tag_clears() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 25);
        run_protocol(
            &mut sim,
            1,
            Box::new(ShareDistribution::new("t/d", None, "K", 9, true)),
        );
        let info = sim.agent(2).storage().info("K").unwrap();
        assert!(info.sticky);
        assert_eq!(info.tag, None);
    }
}
