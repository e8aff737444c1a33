//! Share-local arithmetic primitives.
//!
//! One initiator/responder pair covers every operation each peer can apply
//! to shares it already holds: addition, subtraction, subtraction against a
//! public constant, one-minus, scalar multiplication, share copies, public
//! constants and vector sums. The named constructors are the protocol
//! surface the round machines use.

use crate::error::ProtocolError;
use crate::runtime::dispatcher::responder_id;
use crate::runtime::message::{Message, Payload, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use crate::share::Share;
use tracing::debug;

/// A local operation over stored shares, applied identically by every peer.
#[derive(Clone, Debug)]
pub enum LocalOp {
    /// `out = a + b`.
    Add {
        /// Left operand key.
        a: String,
        /// Right operand key.
        b: String,
    },
    /// `out = a - b`.
    Sub {
        /// Left operand key.
        a: String,
        /// Right operand key.
        b: String,
    },
    /// `out = k - b` or `out = b - k` for a public constant `k`.
    KnownSub {
        /// The public constant.
        k: u64,
        /// Shared operand key.
        b: String,
        /// Compute `k - b` when set, `b - k` otherwise.
        k_minus_b: bool,
    },
    /// `out = 1 - a`.
    OneMinus {
        /// Operand key.
        a: String,
    },
    /// `out = c * a` for a public scalar `c`.
    ScalarMul {
        /// The public scalar.
        c: u64,
        /// Operand key.
        a: String,
    },
    /// `out = src` (same secret under a new key).
    Copy {
        /// Source key.
        src: String,
    },
    /// `out =` the public constant `value` (degree-0 polynomial).
    Const {
        /// The public constant.
        value: u64,
    },
    /// `out =` the sum of all listed shares.
    Sum {
        /// Keys of the summands.
        keys: Vec<String>,
    },
}

impl LocalOp {
    /// Apply the operation on the local agent's shares.
    pub fn apply(&self, ctx: &Ctx) -> Result<Share, ProtocolError> {
        let p = ctx.prime;
        match self {
            LocalOp::Add { a, b } => Ok(ctx.get_share(a)?.add(&ctx.get_share(b)?, p)),
            LocalOp::Sub { a, b } => Ok(ctx.get_share(a)?.sub(&ctx.get_share(b)?, p)),
            LocalOp::KnownSub { k, b, k_minus_b } => {
                Ok(ctx.get_share(b)?.known_sub(*k, *k_minus_b, p))
            }
            LocalOp::OneMinus { a } => Ok(ctx.get_share(a)?.one_minus(p)),
            LocalOp::ScalarMul { c, a } => Ok(ctx.get_share(a)?.scalar_mul(*c, p)),
            LocalOp::Copy { src } => ctx.get_share(src),
            LocalOp::Const { value } => Ok(Share::constant(ctx.me as u64, *value, p)),
            LocalOp::Sum { keys } => {
                let mut iter = keys.iter();
                let first = iter.next().ok_or_else(|| {
                    ProtocolError::Config("local sum over an empty key list".into())
                })?;
                let mut acc = ctx.get_share(first)?;
                for key in iter {
                    acc = acc.add(&ctx.get_share(key)?, p);
                }
                Ok(acc)
            }
        }
    }
}

/// Initiator of a share-local operation on every participant.
pub struct LocalOpProtocol {
    id: String,
    parent: Option<String>,
    op: LocalOp,
    out: String,
    acks: usize,
    expected: usize,
}

impl LocalOpProtocol {
    fn new(id: &str, parent: Option<&str>, op: LocalOp, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            op,
            out: out.to_string(),
            acks: 0,
            expected: 0,
        }
    }

    /// Shares of `a + b`.
    pub fn secure_add(id: &str, parent: Option<&str>, a: &str, b: &str, out: &str) -> Self {
        Self::new(
            id,
            parent,
            LocalOp::Add {
                a: a.to_string(),
                b: b.to_string(),
            },
            out,
        )
    }

    /// Shares of `a - b`.
    pub fn secure_sub(id: &str, parent: Option<&str>, a: &str, b: &str, out: &str) -> Self {
        Self::new(
            id,
            parent,
            LocalOp::Sub {
                a: a.to_string(),
                b: b.to_string(),
            },
            out,
        )
    }

    /// Shares of `k - b` (or `b - k`) for a public `k`.
    pub fn secure_known_sub(
        id: &str,
        parent: Option<&str>,
        k: u64,
        b: &str,
        k_minus_b: bool,
        out: &str,
    ) -> Self {
        Self::new(
            id,
            parent,
            LocalOp::KnownSub {
                k,
                b: b.to_string(),
                k_minus_b,
            },
            out,
        )
    }

    /// Shares of `1 - a`.
    pub fn secure_invert(id: &str, parent: Option<&str>, a: &str, out: &str) -> Self {
        Self::new(id, parent, LocalOp::OneMinus { a: a.to_string() }, out)
    }

    /// Shares of `c * a` for a public scalar `c`.
    pub fn scalar_multiply(id: &str, parent: Option<&str>, c: u64, a: &str, out: &str) -> Self {
        Self::new(
            id,
            parent,
            LocalOp::ScalarMul {
                c,
                a: a.to_string(),
            },
            out,
        )
    }

    /// The same secret under a new key.
    pub fn copy_share(id: &str, parent: Option<&str>, src: &str, out: &str) -> Self {
        Self::new(id, parent, LocalOp::Copy { src: src.to_string() }, out)
    }

    /// Shares of the public constant `value`.
    pub fn constant(id: &str, parent: Option<&str>, value: u64, out: &str) -> Self {
        Self::new(id, parent, LocalOp::Const { value }, out)
    }

    /// Shares of the sum of the listed vector entries.
    pub fn local_sum(id: &str, parent: Option<&str>, keys: Vec<String>, out: &str) -> Self {
        Self::new(id, parent, LocalOp::Sum { keys }, out)
    }
}

impl Protocol for LocalOpProtocol {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::LocalOp
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expected = ctx.participants.len();
        let msg = Message::request(
            &self.id,
            ProtocolKind::LocalOp,
            ctx.me,
            Payload::LocalOpRequest {
                op: self.op.clone(),
                out: self.out.clone(),
            },
        );
        ctx.broadcast(&msg);
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

/// Responder: applies the requested operation and acks.
pub struct LocalOpResponder {
    id: String,
}

/// Responder factory for [ProtocolKind::LocalOp] messages.
pub fn local_op_responder(msg: &Message) -> Option<Box<dyn Protocol>> {
    matches!(msg.payload, Payload::LocalOpRequest { .. }).then(|| {
        Box::new(LocalOpResponder {
            id: responder_id(&msg.protocol_id),
        }) as Box<dyn Protocol>
    })
}

impl Protocol for LocalOpResponder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::LocalOp
    }

    fn on_message(
        &mut self,
        msg: &Message,
        _sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        let Payload::LocalOpRequest { op, out } = &msg.payload else {
            debug!(protocol = %self.id, "ignoring unexpected message");
            return Ok(Step::Continue);
        };
        let share = op.apply(ctx)?;
        let tag = ctx.tag();
        ctx.storage.store(out, share, &tag);
        ctx.send(
            msg.sender,
            Message::reply(&msg.protocol_id, ProtocolKind::LocalOp, ctx.me, Payload::Ack),
        );
        Ok(Step::Complete(Outcome::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::{self, MERSENNE_31 as P};
    use crate::mpc::distribute::ShareDistribution;
    use crate::mpc::vector_key;
    use crate::shamir;
    use crate::sim::testkit::{self, collect_shares, run_protocol};
    use crate::sim::Simulation;

    fn distribute(sim: &mut Simulation, seq: usize, key: &str, value: u64) {
        run_protocol(
            sim,
            1,
            Box::new(ShareDistribution::new(
                &format!("t/d{seq}"),
                None,
                key,
                value,
                false,
            )),
        );
    }

    fn reveal(sim: &Simulation, key: &str) -> u64 {
        shamir::reconstruct(&collect_shares(sim, key), P).unwrap()
    }

    #[test]
    fn test_add_sub_scalar_invert() {
        let mut sim = testkit::fixture(4, Algorithm::Pdsa, 31);
        distribute(&mut sim, 0, "A", 100);
        distribute(&mut sim, 1, "B", 30);

        run_protocol(
            &mut sim,
            1,
            Box::new(LocalOpProtocol::secure_add("t/add", None, "A", "B", "SUM")),
        );
        assert_eq!(reveal(&sim, "SUM"), 130);

        run_protocol(
            &mut sim,
            2,
            Box::new(LocalOpProtocol::secure_sub("t/sub", None, "A", "B", "DIFF")),
        );
        assert_eq!(reveal(&sim, "DIFF"), 70);

        run_protocol(
            &mut sim,
            3,
            Box::new(LocalOpProtocol::scalar_multiply("t/mul", None, 3, "A", "TRIPLE")),
        );
        assert_eq!(reveal(&sim, "TRIPLE"), 300);

        run_protocol(
            &mut sim,
            4,
            Box::new(LocalOpProtocol::secure_invert("t/inv", None, "A", "INV")),
        );
        assert_eq!(reveal(&sim, "INV"), field::sub(1, 100, P));
    }

    #[test]
    fn test_known_sub_directions() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 32);
        distribute(&mut sim, 0, "B", 30);

        run_protocol(
            &mut sim,
            1,
            Box::new(LocalOpProtocol::secure_known_sub(
                "t/kmb", None, 500, "B", true, "KMB",
            )),
        );
        assert_eq!(reveal(&sim, "KMB"), 470);

        run_protocol(
            &mut sim,
            2,
            Box::new(LocalOpProtocol::secure_known_sub(
                "t/bmk", None, 500, "B", false, "BMK",
            )),
        );
        assert_eq!(reveal(&sim, "BMK"), P - 470);
    }

    #[test]
    fn test_constant_copy_and_sum() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 33);
        for (i, v) in [4u64, 5, 6].into_iter().enumerate() {
            distribute(&mut sim, i, &vector_key("V", i), v);
        }

        run_protocol(
            &mut sim,
            1,
            Box::new(LocalOpProtocol::constant("t/const", None, 42, "C")),
        );
        assert_eq!(reveal(&sim, "C"), 42);
        for share in collect_shares(&sim, "C") {
            assert_eq!(share.value, 42);
        }

        run_protocol(
            &mut sim,
            2,
            Box::new(LocalOpProtocol::copy_share("t/copy", None, &vector_key("V", 0), "V0")),
        );
        assert_eq!(reveal(&sim, "V0"), 4);

        let keys = (0..3).map(|i| vector_key("V", i)).collect();
        run_protocol(
            &mut sim,
            3,
            Box::new(LocalOpProtocol::local_sum("t/sum", None, keys, "TOTAL")),
        );
        assert_eq!(reveal(&sim, "TOTAL"), 15);
    }

    #[test]
    fn test_missing_share_is_fatal() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 34);
        sim.agent_mut(1)
            .inject(Box::new(LocalOpProtocol::secure_add(
                "t/bad", None, "NOPE", "NOPE2", "OUT",
            )))
            .unwrap();
        let failed = (0..100).any(|_| sim.tick().is_err());
        assert!(failed, "missing input share must abort the iteration");
    }
}
