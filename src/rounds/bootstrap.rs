//! One-time distribution of the sticky bootstrap secrets.
//!
//! Before round 0 the lowest-id agent draws the multiplication mask `r`
//! uniformly and distributes sticky shares of it and of each of its 31 bits
//! (LSB first). When the topology indicators are needed (PMGM), every agent
//! additionally distributes, for each ordered pair `(me, j)`, a sticky
//! share of 1 if the constraint is real and 0 otherwise, so later rounds
//! can weigh gains without revealing which pairs exist.

use crate::error::ProtocolError;
use crate::field::{self, MERSENNE_31_BITS};
use crate::mpc::distribute::{ShareDistribution, VectorShareDistribution};
use crate::mpc::R_KEY;
use crate::rounds::n_key;
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use std::collections::HashSet;
use tracing::debug;

/// Id of agent `me`'s bootstrap protocol.
pub fn bootstrap_id(me: AgentId) -> String {
    format!("bootstrap-a{me}")
}

/// Per-agent bootstrap: runs once, before the first round.
pub struct Bootstrap {
    id: String,
    mask: bool,
    topology: bool,
    pending: HashSet<String>,
}

impl Bootstrap {
    /// Bootstrap for agent `me`. `mask` distributes the multiplication mask
    /// and its bits (any algorithm running MPC over the prime); `topology`
    /// adds the PMGM indicators.
    pub fn new(me: AgentId, mask: bool, topology: bool) -> Self {
        Self {
            id: bootstrap_id(me),
            mask,
            topology,
            pending: HashSet::new(),
        }
    }

    fn spawn_one(&mut self, proto: Box<dyn Protocol>, ctx: &mut Ctx) {
        self.pending.insert(proto.id().to_string());
        ctx.spawn(proto);
    }
}

impl Protocol for Bootstrap {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Bootstrap
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        let me = ctx.me;
        let lead = *ctx.participants.first().ok_or_else(|| {
            ProtocolError::Config("bootstrap with zero participants".into())
        })?;

        if self.mask && me == lead {
            let r = field::random_element(ctx.crypto_rng, ctx.prime);
            let mask = ShareDistribution::new(
                &format!("{}/r", self.id),
                Some(&self.id),
                R_KEY,
                r,
                true,
            );
            self.spawn_one(Box::new(mask), ctx);

            let bits: Vec<u64> = (0..MERSENNE_31_BITS).map(|b| r >> b & 1).collect();
            let mask_bits = VectorShareDistribution::new(
                &format!("{}/rb", self.id),
                Some(&self.id),
                R_KEY,
                bits,
                true,
            );
            self.spawn_one(Box::new(mask_bits), ctx);
        }

        if self.topology {
            for &j in ctx.participants {
                if j == me {
                    continue;
                }
                let connected = ctx.problem.is_connected(me, j) as u64;
                let indicator = ShareDistribution::new(
                    &format!("{}/n{j}", self.id),
                    Some(&self.id),
                    &n_key(me, j),
                    connected,
                    true,
                );
                self.spawn_one(Box::new(indicator), ctx);
            }
        }

        if self.pending.is_empty() {
            return Ok(Step::Complete(Outcome::Done));
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
