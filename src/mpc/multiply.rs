//! Degree-reducing share multiplication and the dot product built on it.
//!
//! Multiplication masks the locally doubled product with the pre-shared
//! random secret `r-key`: every peer computes `a_k * b_k + r_k`, the
//! initiator reconstructs the masked product `a*b + r` publicly (the
//! degree-doubled polynomial interpolates exactly from all N shares), and
//! every peer then stores `(a*b + r) - r_k` as its fresh degree-reduced
//! share of the product.

use crate::error::ProtocolError;
use crate::field;
use crate::mpc::arithmetic::LocalOpProtocol;
use crate::mpc::R_KEY;
use crate::runtime::dispatcher::responder_id;
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use crate::shamir;
use crate::share::Share;
use std::collections::HashSet;
use tracing::debug;

enum MultiplyPhase {
    Collecting,
    Unmasking,
}

/// Initiator of one share multiplication.
pub struct SecureMultiply {
    id: String,
    parent: Option<String>,
    a: String,
    b: String,
    out: String,
    phase: MultiplyPhase,
    shares: Vec<Share>,
    acks: usize,
    expected: usize,
}

impl SecureMultiply {
    /// Shares of `a * b` under `out`.
    pub fn new(id: &str, parent: Option<&str>, a: &str, b: &str, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            a: a.to_string(),
            b: b.to_string(),
            out: out.to_string(),
            phase: MultiplyPhase::Collecting,
            shares: Vec::new(),
            acks: 0,
            expected: 0,
        }
    }
}

impl Protocol for SecureMultiply {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Multiply
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expected = ctx.participants.len();
        let msg = Message::request(
            &self.id,
            ProtocolKind::Multiply,
            ctx.me,
            Payload::MultiplyRequest {
                a: self.a.clone(),
                b: self.b.clone(),
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
        match (&self.phase, &msg.payload) {
            (MultiplyPhase::Collecting, Payload::MaskedProduct { share }) => {
                self.shares.push(*share);
                if self.shares.len() == self.expected {
                    let masked = shamir::reconstruct(&self.shares, ctx.prime)?;
                    let unmask = Message::request(
                        &self.id,
                        ProtocolKind::Multiply,
                        ctx.me,
                        Payload::Unmask {
                            masked,
                            out: self.out.clone(),
                        },
                    );
                    ctx.broadcast(&unmask);
                    self.phase = MultiplyPhase::Unmasking;
                }
                Ok(Step::Continue)
            }
            (MultiplyPhase::Unmasking, Payload::Ack) => {
                self.acks += 1;
                if self.acks == self.expected {
                    Ok(Step::Complete(Outcome::Done))
                } else {
                    Ok(Step::Continue)
                }
            }
            _ => {
                debug!(protocol = %self.id, "ignoring message out of phase");
                Ok(Step::Continue)
            }
        }
    }
}

/// Responder: masks the local product, then unmasks the revealed value.
pub struct MultiplyResponder {
    id: String,
}

/// Responder factory for [ProtocolKind::Multiply] messages.
pub fn multiply_responder(msg: &Message) -> Option<Box<dyn Protocol>> {
    matches!(msg.payload, Payload::MultiplyRequest { .. }).then(|| {
        Box::new(MultiplyResponder {
            id: responder_id(&msg.protocol_id),
        }) as Box<dyn Protocol>
    })
}

impl Protocol for MultiplyResponder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Multiply
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        match &msg.payload {
            Payload::MultiplyRequest { a, b } => {
                let a = ctx.get_share(a)?;
                let b = ctx.get_share(b)?;
                let r = ctx.get_share(R_KEY)?;
                let p = ctx.prime;
                // degree-doubled local product, masked by the shared random r
                let masked = Share::new(
                    a.index,
                    field::add(field::mul(a.value, b.value, p), r.value, p),
                    field::add(
                        field::mul(a.debug_secret, b.debug_secret, p),
                        r.debug_secret,
                        p,
                    ),
                );
                ctx.send(
                    msg.sender,
                    Message::reply(
                        &msg.protocol_id,
                        ProtocolKind::Multiply,
                        ctx.me,
                        Payload::MaskedProduct { share: masked },
                    ),
                );
                Ok(Step::Continue)
            }
            Payload::Unmask { masked, out } => {
                let r = ctx.get_share(R_KEY)?;
                let p = ctx.prime;
                let product = Share::new(
                    r.index,
                    field::sub(*masked, r.value, p),
                    field::sub(*masked, r.debug_secret, p),
                );
                let tag = ctx.tag();
                ctx.storage.store(out, product, &tag);
                ctx.send(
                    msg.sender,
                    Message::reply(
                        &msg.protocol_id,
                        ProtocolKind::Multiply,
                        ctx.me,
                        Payload::Ack,
                    ),
                );
                Ok(Step::Complete(Outcome::Done))
            }
            _ => {
                debug!(protocol = %self.id, "ignoring unexpected message");
                Ok(Step::Continue)
            }
        }
    }
}

enum DotPhase {
    Multiplying,
    Summing,
}

/// Dot product of two shared vectors: parallel multiplications followed by a
/// local summation of the products.
pub struct SecureDotProduct {
    id: String,
    parent: Option<String>,
    a_keys: Vec<String>,
    b_keys: Vec<String>,
    out: String,
    phase: DotPhase,
    pending: HashSet<String>,
}

impl SecureDotProduct {
    /// Shares of `sum_i a[i] * b[i]` under `out`.
    pub fn new(
        id: &str,
        parent: Option<&str>,
        a_keys: Vec<String>,
        b_keys: Vec<String>,
        out: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            a_keys,
            b_keys,
            out: out.to_string(),
            phase: DotPhase::Multiplying,
            pending: HashSet::new(),
        }
    }

    fn product_keys(&self) -> Vec<String> {
        (0..self.a_keys.len())
            .map(|i| format!("{}/p{i}", self.id))
            .collect()
    }
}

impl Protocol for SecureDotProduct {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::DotProduct
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        if self.a_keys.is_empty() || self.a_keys.len() != self.b_keys.len() {
            return Err(ProtocolError::Config(format!(
                "dot product '{}' over vectors of lengths {} and {}",
                self.id,
                self.a_keys.len(),
                self.b_keys.len()
            )));
        }
        let outs = self.product_keys();
        for (i, out) in outs.iter().enumerate() {
            let child_id = format!("{}/m{i}", self.id);
            self.pending.insert(child_id.clone());
            ctx.spawn(Box::new(SecureMultiply::new(
                &child_id,
                Some(&self.id),
                &self.a_keys[i],
                &self.b_keys[i],
                out,
            )));
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
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        if !self.pending.remove(child) {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        if !self.pending.is_empty() {
            return Ok(Step::Continue);
        }
        match self.phase {
            DotPhase::Multiplying => {
                self.phase = DotPhase::Summing;
                let child_id = format!("{}/sum", self.id);
                self.pending.insert(child_id.clone());
                ctx.spawn(Box::new(LocalOpProtocol::local_sum(
                    &child_id,
                    Some(&self.id),
                    self.product_keys(),
                    &self.out,
                )));
                Ok(Step::Continue)
            }
            DotPhase::Summing => Ok(Step::Complete(Outcome::Done)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::{self, MERSENNE_31 as P};
    use crate::mpc::distribute::{ShareDistribution, VectorShareDistribution};
    use crate::mpc::vector_key;
    use crate::sim::testkit;

    #[test]
    fn test_multiply_reconstructs_product() {
        // N=5, A=7, B=11 with the mask drawn from the fixture seed
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 7);
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(ShareDistribution::new("t/a", None, "A", 7, false)),
        );
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(ShareDistribution::new("t/b", None, "B", 11, false)),
        );
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(SecureMultiply::new("t/ab", None, "A", "B", "AB")),
        );

        let shares = testkit::collect_shares(&sim, "AB");
        assert_eq!(shares.len(), 5);
        assert_eq!(crate::shamir::reconstruct(&shares, P).unwrap(), 77);
        for share in shares {
            assert_eq!(share.debug_secret, 77);
        }
    }

    #[test]
    fn test_multiply_large_operands() {
        let mut sim = testkit::fixture(4, Algorithm::Pdsa, 8);
        let a = P - 2;
        let b = 123_456_789;
        testkit::run_protocol(
            &mut sim,
            2,
            Box::new(ShareDistribution::new("t/a", None, "A", a, false)),
        );
        testkit::run_protocol(
            &mut sim,
            3,
            Box::new(ShareDistribution::new("t/b", None, "B", b, false)),
        );
        testkit::run_protocol(
            &mut sim,
            2,
            Box::new(SecureMultiply::new("t/ab", None, "A", "B", "AB")),
        );
        let shares = testkit::collect_shares(&sim, "AB");
        assert_eq!(
            crate::shamir::reconstruct(&shares, P).unwrap(),
            field::mul(a, b, P)
        );
    }

    #[test]
    fn test_dot_product() {
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 9);
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(VectorShareDistribution::new(
                "t/va",
                None,
                "VA",
                vec![1, 2, 3],
                false,
            )),
        );
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(VectorShareDistribution::new(
                "t/vb",
                None,
                "VB",
                vec![4, 5, 6],
                false,
            )),
        );
        let a_keys = (0..3).map(|i| vector_key("VA", i)).collect();
        let b_keys = (0..3).map(|i| vector_key("VB", i)).collect();
        testkit::run_protocol(
            &mut sim,
            1,
            Box::new(SecureDotProduct::new("t/dp", None, a_keys, b_keys, "DP")),
        );
        let shares = testkit::collect_shares(&sim, "DP");
        assert_eq!(crate::shamir::reconstruct(&shares, P).unwrap(), 32);
    }
}
