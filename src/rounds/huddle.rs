//! The huddle: round-start cost-contribution exchange.
//!
//! For every other agent `i`, the local agent takes the row of its shared
//! cost matrix selected by its own current value (the all-zeros matrix for
//! unconstrained pairs, so participation never reveals which pairs are
//! real), Shamir-shares each of the row's M entries, and sends participant
//! `k` its slice of the shares. Receivers fold each incoming slice into the
//! per-value accumulator `Wb_{i}[x]`; the huddle on agent `i` completes
//! once contributions from all N-1 others have been summed into its own
//! vector. Other agents' accumulations continue as their own huddles.

use crate::error::ProtocolError;
use crate::mpc::vector_key;
use crate::rounds::{huddle_id, wb_base};
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use crate::shamir;
use crate::share::Share;
use tracing::debug;

/// One per-round huddle instance, shared-id across all agents.
pub struct Huddle {
    id: String,
    round: usize,
    parent: Option<String>,
    adopted: bool,
    sent_own: bool,
    me_contributions: usize,
}

impl Huddle {
    /// The round-`r` huddle, reporting to `parent` (the round protocol).
    pub fn new(round: usize, parent: Option<&str>) -> Self {
        Self {
            id: huddle_id(round),
            round,
            parent: parent.map(str::to_string),
            adopted: false,
            sent_own: false,
            me_contributions: 0,
        }
    }

    /// Responder factory: builds the instance on the first early
    /// contribution.
    pub fn responder(msg: &Message) -> Option<Box<dyn Protocol>> {
        match msg.payload {
            Payload::HuddleContribution { round, .. } => Some(Box::new(Huddle::new(round, None))),
            _ => None,
        }
    }

    /// Share out this agent's cost rows toward every other agent.
    fn send_contributions(&mut self, ctx: &mut Ctx) -> Result<(), ProtocolError> {
        let me = ctx.me;
        let participants = ctx.participants.to_vec();
        let indices: Vec<u64> = participants.iter().map(|&a| a as u64).collect();
        let threshold = ctx.threshold();
        let domain = ctx.problem.domain_size();
        let value = ctx.current_value;

        for &target in &participants {
            if target == me {
                continue;
            }
            let row: Vec<u64> = {
                let matrix = ctx.problem.cost_matrix(me, target);
                matrix[value].clone()
            };

            // per_peer[k] collects participant k's share of each row entry
            let mut per_peer: Vec<Vec<Share>> = vec![Vec::with_capacity(domain); indices.len()];
            for &cost in &row {
                let shares =
                    shamir::generate_shares(cost, &indices, threshold, ctx.prime, ctx.crypto_rng)?;
                for (peer_slice, share) in per_peer.iter_mut().zip(shares) {
                    peer_slice.push(share);
                }
            }
            for (&peer, entries) in participants.iter().zip(per_peer) {
                let msg = Message::shared(
                    &self.id,
                    ProtocolKind::Huddle,
                    me,
                    Payload::HuddleContribution {
                        round: self.round,
                        target,
                        entries,
                    },
                );
                ctx.send(peer, msg);
            }
        }
        self.sent_own = true;
        Ok(())
    }

    fn maybe_done(&self, ctx: &Ctx) -> Step {
        if self.adopted && self.me_contributions == ctx.participants.len() - 1 {
            Step::Complete(Outcome::Done)
        } else {
            Step::Continue
        }
    }
}

impl Protocol for Huddle {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Huddle
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.adopted = true;
        if !self.sent_own {
            self.send_contributions(ctx)?;
        }
        Ok(self.maybe_done(ctx))
    }

    fn on_adopt(&mut self, parent: Option<String>, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.adopted = true;
        self.parent = parent;
        if !self.sent_own {
            self.send_contributions(ctx)?;
        }
        Ok(self.maybe_done(ctx))
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::HuddleContribution {
            round,
            target,
            entries,
        } = &msg.payload
        else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        if *round != self.round {
            return Err(ProtocolError::WrongRound {
                expected: self.round,
                got: *round,
                protocol: self.id.clone(),
            });
        }

        let tag = ctx.tag();
        let base = wb_base(*target);
        for (x, share) in entries.iter().enumerate() {
            let key = vector_key(&base, x);
            let merged = match ctx.storage.get(&key) {
                Some(prev) => prev.add(share, ctx.prime),
                None => *share,
            };
            ctx.storage.store(&key, merged, &tag);
        }
        if *target == ctx.me {
            self.me_contributions += 1;
        }
        Ok(self.maybe_done(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::MERSENNE_31 as P;
    use crate::shamir;
    use crate::sim::testkit::{self, collect_shares};

    #[test]
    fn test_huddle_assembles_every_cost_vector() {
        let mut sim = testkit::fixture(4, Algorithm::Pdsa, 21);

        // each agent owns its huddle instance before any message flows
        for id in 1..=4 {
            sim.agent_mut(id)
                .inject(Box::new(Huddle::new(0, None)))
                .unwrap();
        }
        for _ in 0..1_000 {
            if (1..=4).all(|id| sim.agent(id).find_event(&huddle_id(0)).is_some()) {
                break;
            }
            sim.tick().unwrap();
        }

        let values: Vec<usize> = (1..=4).map(|id| sim.agent(id).selected_value()).collect();
        for target in 1..=4 {
            for x in 0..sim.problem().domain_size() {
                let shares = collect_shares(&sim, &vector_key(&wb_base(target), x));
                assert_eq!(shares.len(), 4);
                let got = shamir::reconstruct(&shares, P).unwrap();
                let expected: u64 = (1..=4)
                    .filter(|&j| j != target)
                    .map(|j| sim.problem().cost_matrix(target, j)[x][values[j - 1]])
                    .sum();
                assert_eq!(got, expected, "Wb_{target}[{x}]");
            }
        }
    }

    #[test]
    fn test_wrong_round_contribution_is_fatal() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 22);
        sim.agent_mut(1)
            .inject(Box::new(Huddle::new(0, None)))
            .unwrap();
        // hand the instance a contribution stamped with a different round
        let msg = Message::shared(
            &huddle_id(0),
            ProtocolKind::Huddle,
            2,
            Payload::HuddleContribution {
                round: 3,
                target: 1,
                entries: vec![],
            },
        );
        let result = sim.agent_mut(1).deliver(msg, 2);
        assert!(matches!(
            result,
            Err(ProtocolError::WrongRound { expected: 0, got: 3, .. })
        ));
    }
}
