//! Tournament minimum/maximum over a shared vector.
//!
//! The range splits recursively; the two halves run in parallel and each
//! node combines them with one secure comparison followed by an oblivious
//! selection of the winning value share and index share. A one-element
//! range just forwards its share and materializes its index as a public
//! constant. On equal values the left operand wins, so the index output is
//! always the smallest-indexed extremum.

use crate::error::ProtocolError;
use crate::mpc::arithmetic::LocalOpProtocol;
use crate::mpc::compare::SecureCompare;
use crate::mpc::multiply::SecureMultiply;
use crate::mpc::vector_key;
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use std::collections::HashSet;
use tracing::debug;

enum TournamentPhase {
    Leaf,
    Halves,
    Comparing,
    Diffing,
    Selecting,
    Summing,
}

/// Initiator of a find-min / find-max tournament over `base[lo..=hi]`.
///
/// Completes with the extremum's value share under `out_val` and its index
/// share under `out_idx` on every participant.
pub struct FindExtremum {
    id: String,
    parent: Option<String>,
    base: String,
    lo: usize,
    hi: usize,
    out_val: String,
    out_idx: String,
    maximum: bool,
    phase: TournamentPhase,
    pending: HashSet<String>,
}

impl FindExtremum {
    /// Argmin tournament over `base[lo..=hi]`.
    pub fn min(
        id: &str,
        parent: Option<&str>,
        base: &str,
        lo: usize,
        hi: usize,
        out_val: &str,
        out_idx: &str,
    ) -> Result<Self, ProtocolError> {
        Self::new(id, parent, base, lo, hi, out_val, out_idx, false)
    }

    /// Argmax tournament over `base[lo..=hi]`.
    pub fn max(
        id: &str,
        parent: Option<&str>,
        base: &str,
        lo: usize,
        hi: usize,
        out_val: &str,
        out_idx: &str,
    ) -> Result<Self, ProtocolError> {
        Self::new(id, parent, base, lo, hi, out_val, out_idx, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: &str,
        parent: Option<&str>,
        base: &str,
        lo: usize,
        hi: usize,
        out_val: &str,
        out_idx: &str,
        maximum: bool,
    ) -> Result<Self, ProtocolError> {
        if lo > hi {
            return Err(ProtocolError::Config(format!(
                "extremum search '{id}' over the empty range {lo}..{hi}"
            )));
        }
        Ok(Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            base: base.to_string(),
            lo,
            hi,
            out_val: out_val.to_string(),
            out_idx: out_idx.to_string(),
            maximum,
            phase: TournamentPhase::Leaf,
            pending: HashSet::new(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{name}", self.id)
    }

    fn spawn_one(&mut self, proto: Box<dyn Protocol>, ctx: &mut Ctx) {
        self.pending.insert(proto.id().to_string());
        ctx.spawn(proto);
    }
}

impl Protocol for FindExtremum {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        if self.maximum {
            ProtocolKind::FindMax
        } else {
            ProtocolKind::FindMin
        }
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        if self.lo == self.hi {
            // single-entry range: forward the share, fix the index
            self.phase = TournamentPhase::Leaf;
            let value = LocalOpProtocol::copy_share(
                &self.key("val"),
                Some(&self.id),
                &vector_key(&self.base, self.lo),
                &self.out_val,
            );
            let index = LocalOpProtocol::constant(
                &self.key("idx"),
                Some(&self.id),
                self.lo as u64,
                &self.out_idx,
            );
            self.spawn_one(Box::new(value), ctx);
            self.spawn_one(Box::new(index), ctx);
            return Ok(Step::Continue);
        }

        self.phase = TournamentPhase::Halves;
        let mid = (self.lo + self.hi) / 2;
        let left = Self::new(
            &self.key("l"),
            Some(&self.id),
            &self.base,
            self.lo,
            mid,
            &self.key("lv"),
            &self.key("li"),
            self.maximum,
        )?;
        let right = Self::new(
            &self.key("r"),
            Some(&self.id),
            &self.base,
            mid + 1,
            self.hi,
            &self.key("rv"),
            &self.key("ri"),
            self.maximum,
        )?;
        self.spawn_one(Box::new(left), ctx);
        self.spawn_one(Box::new(right), ctx);
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
            TournamentPhase::Leaf => Ok(Step::Complete(Outcome::Done)),
            TournamentPhase::Halves => {
                // c = 1 exactly when the right half wins strictly, so ties
                // fall to the left (smaller-indexed) operand
                let (a, b) = if self.maximum {
                    (self.key("lv"), self.key("rv"))
                } else {
                    (self.key("rv"), self.key("lv"))
                };
                let cmp =
                    SecureCompare::new(&self.key("cmp"), Some(&self.id), &a, &b, &self.key("c"));
                self.phase = TournamentPhase::Comparing;
                self.spawn_one(Box::new(cmp), ctx);
                Ok(Step::Continue)
            }
            TournamentPhase::Comparing => {
                let dv = LocalOpProtocol::secure_sub(
                    &self.key("dv"),
                    Some(&self.id),
                    &self.key("rv"),
                    &self.key("lv"),
                    &self.key("dvk"),
                );
                let di = LocalOpProtocol::secure_sub(
                    &self.key("di"),
                    Some(&self.id),
                    &self.key("ri"),
                    &self.key("li"),
                    &self.key("dik"),
                );
                self.phase = TournamentPhase::Diffing;
                self.spawn_one(Box::new(dv), ctx);
                self.spawn_one(Box::new(di), ctx);
                Ok(Step::Continue)
            }
            TournamentPhase::Diffing => {
                let mv = SecureMultiply::new(
                    &self.key("mv"),
                    Some(&self.id),
                    &self.key("c"),
                    &self.key("dvk"),
                    &self.key("mvk"),
                );
                let mi = SecureMultiply::new(
                    &self.key("mi"),
                    Some(&self.id),
                    &self.key("c"),
                    &self.key("dik"),
                    &self.key("mik"),
                );
                self.phase = TournamentPhase::Selecting;
                self.spawn_one(Box::new(mv), ctx);
                self.spawn_one(Box::new(mi), ctx);
                Ok(Step::Continue)
            }
            TournamentPhase::Selecting => {
                // winner = left + c * (right - left)
                let val = LocalOpProtocol::secure_add(
                    &self.key("sv"),
                    Some(&self.id),
                    &self.key("lv"),
                    &self.key("mvk"),
                    &self.out_val,
                );
                let idx = LocalOpProtocol::secure_add(
                    &self.key("si"),
                    Some(&self.id),
                    &self.key("li"),
                    &self.key("mik"),
                    &self.out_idx,
                );
                self.phase = TournamentPhase::Summing;
                self.spawn_one(Box::new(val), ctx);
                self.spawn_one(Box::new(idx), ctx);
                Ok(Step::Continue)
            }
            TournamentPhase::Summing => Ok(Step::Complete(Outcome::Done)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::MERSENNE_31 as P;
    use crate::mpc::distribute::VectorShareDistribution;
    use crate::shamir;
    use crate::sim::testkit::{self, collect_shares, run_protocol};

    #[test]
    fn test_find_min_with_tie_break() {
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 17);
        run_protocol(
            &mut sim,
            1,
            Box::new(VectorShareDistribution::new(
                "t/v",
                None,
                "V",
                vec![5, 2, 8, 2],
                false,
            )),
        );
        let min = FindExtremum::min("t/min", None, "V", 0, 3, "MINV", "MINI").unwrap();
        run_protocol(&mut sim, 1, Box::new(min));
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MINV"), P).unwrap(),
            2
        );
        // both entries hold 2; the smaller index wins
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MINI"), P).unwrap(),
            1
        );
    }

    #[test]
    fn test_find_max_with_tie_break() {
        let mut sim = testkit::fixture(4, Algorithm::Pdsa, 18);
        run_protocol(
            &mut sim,
            2,
            Box::new(VectorShareDistribution::new(
                "t/v",
                None,
                "V",
                vec![7, 7, 1],
                false,
            )),
        );
        let max = FindExtremum::max("t/max", None, "V", 0, 2, "MAXV", "MAXI").unwrap();
        run_protocol(&mut sim, 2, Box::new(max));
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MAXV"), P).unwrap(),
            7
        );
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MAXI"), P).unwrap(),
            0
        );
    }

    #[test]
    fn test_single_entry_range() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 19);
        run_protocol(
            &mut sim,
            1,
            Box::new(VectorShareDistribution::new(
                "t/v",
                None,
                "V",
                vec![9],
                false,
            )),
        );
        let min = FindExtremum::min("t/min", None, "V", 0, 0, "MINV", "MINI").unwrap();
        run_protocol(&mut sim, 1, Box::new(min));
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MINV"), P).unwrap(),
            9
        );
        assert_eq!(
            shamir::reconstruct(&collect_shares(&sim, "MINI"), P).unwrap(),
            0
        );
    }

    #[test]
    fn test_empty_range_is_rejected() {
        assert!(FindExtremum::min("t/min", None, "V", 1, 0, "A", "B").is_err());
    }
}
