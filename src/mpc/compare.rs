//! Comparison primitives: LSB extraction, public-vs-bit-shared comparison,
//! the half-prime (sign) test, strict less-than, and the Fermat zero test.
//!
//! The LSB protocol reveals `c = x + r` publicly; since parity is linear,
//! `lsb(x) = (c_0 xor r_0) xor [c < r]` (the wrap past the odd prime flips
//! the parity exactly when `c < r`). The half-prime test is the LSB of `2x`,
//! and strict comparison is the half-prime test of the difference. Numeric
//! inputs to comparisons are interpreted as non-negative integers below p/2.

use crate::error::ProtocolError;
use crate::field;
use crate::mpc::arithmetic::LocalOpProtocol;
use crate::mpc::multiply::SecureMultiply;
use crate::mpc::reconstruct::Reconstruct;
use crate::mpc::{r_key_bit, R_KEY};
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use std::collections::HashSet;
use tracing::debug;

enum LsbPhase {
    Masking,
    Revealing,
    BitShare,
    Comparing,
    MulEd,
    AddEd,
    Scaling,
    Finishing,
}

/// Shares of the least significant bit of a shared value.
pub struct SecureLsb {
    id: String,
    parent: Option<String>,
    x: String,
    out: String,
    phase: LsbPhase,
    expect: String,
    masked: u64,
}

impl SecureLsb {
    /// Shares of `lsb(x)` under `out`, using the sticky mask and its bits.
    pub fn new(id: &str, parent: Option<&str>, x: &str, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            x: x.to_string(),
            out: out.to_string(),
            phase: LsbPhase::Masking,
            expect: String::new(),
            masked: 0,
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{name}", self.id)
    }

    fn next_child(&mut self, suffix: &str) -> String {
        self.expect = format!("{}/{suffix}", self.id);
        self.expect.clone()
    }
}

impl Protocol for SecureLsb {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Lsb
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        let child = self.next_child("mask");
        ctx.spawn(Box::new(LocalOpProtocol::secure_add(
            &child,
            Some(&self.id),
            &self.x,
            R_KEY,
            &self.key("c"),
        )));
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
        outcome: &Outcome,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        if child != self.expect {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        match self.phase {
            LsbPhase::Masking => {
                let child = self.next_child("reveal");
                ctx.spawn(Box::new(Reconstruct::new(
                    &child,
                    Some(&self.id),
                    &self.key("c"),
                )));
                self.phase = LsbPhase::Revealing;
            }
            LsbPhase::Revealing => {
                let Outcome::Value(c) = outcome else {
                    return Err(ProtocolError::Reconstruction(format!(
                        "mask reveal of '{}' returned no value",
                        self.id
                    )));
                };
                self.masked = *c;
                // d0 = c0 xor r0; with c0 public this is a local op on r0
                let child = self.next_child("d0");
                let d0 = if c & 1 == 0 {
                    LocalOpProtocol::copy_share(&child, Some(&self.id), &r_key_bit(0), &self.key("d0"))
                } else {
                    LocalOpProtocol::secure_invert(&child, Some(&self.id), &r_key_bit(0), &self.key("d0"))
                };
                ctx.spawn(Box::new(d0));
                self.phase = LsbPhase::BitShare;
            }
            LsbPhase::BitShare => {
                let bit_keys = (0..field::MERSENNE_31_BITS).map(|b| r_key_bit(b)).collect();
                let child = self.next_child("cmp");
                ctx.spawn(Box::new(BitCompare::new(
                    &child,
                    Some(&self.id),
                    self.masked,
                    bit_keys,
                    &self.key("e"),
                )));
                self.phase = LsbPhase::Comparing;
            }
            LsbPhase::Comparing => {
                let child = self.next_child("ed");
                ctx.spawn(Box::new(SecureMultiply::new(
                    &child,
                    Some(&self.id),
                    &self.key("e"),
                    &self.key("d0"),
                    &self.key("ed"),
                )));
                self.phase = LsbPhase::MulEd;
            }
            LsbPhase::MulEd => {
                let child = self.next_child("s");
                ctx.spawn(Box::new(LocalOpProtocol::secure_add(
                    &child,
                    Some(&self.id),
                    &self.key("e"),
                    &self.key("d0"),
                    &self.key("s"),
                )));
                self.phase = LsbPhase::AddEd;
            }
            LsbPhase::AddEd => {
                let child = self.next_child("2ed");
                ctx.spawn(Box::new(LocalOpProtocol::scalar_multiply(
                    &child,
                    Some(&self.id),
                    2,
                    &self.key("ed"),
                    &self.key("2ed"),
                )));
                self.phase = LsbPhase::Scaling;
            }
            LsbPhase::Scaling => {
                // xor: e + d0 - 2*e*d0
                let child = self.next_child("xor");
                ctx.spawn(Box::new(LocalOpProtocol::secure_sub(
                    &child,
                    Some(&self.id),
                    &self.key("s"),
                    &self.key("2ed"),
                    &self.out,
                )));
                self.phase = LsbPhase::Finishing;
            }
            LsbPhase::Finishing => return Ok(Step::Complete(Outcome::Done)),
        }
        Ok(Step::Continue)
    }
}

enum BitPhase {
    Init,
    Mul,
    Update,
    Finish,
}

/// Comparison of a public value against a bit-shared secret: shares of 1 iff
/// `a < b`. Scans from the most significant bit down, maintaining shares of
/// "all higher bits agreed so far"; exactly one multiplication per bit.
pub struct BitCompare {
    id: String,
    parent: Option<String>,
    a: u64,
    bit_keys: Vec<String>,
    out: String,
    bit: usize,
    same_key: String,
    res_key: String,
    pending: HashSet<String>,
    phase: BitPhase,
}

impl BitCompare {
    /// Shares of `[a < b]` where `bit_keys[i]` holds bit `i` of `b`.
    pub fn new(id: &str, parent: Option<&str>, a: u64, bit_keys: Vec<String>, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            a,
            bit_keys,
            out: out.to_string(),
            bit: 0,
            same_key: format!("{id}/same"),
            res_key: format!("{id}/res"),
            pending: HashSet::new(),
            phase: BitPhase::Init,
        }
    }

    fn spawn_one(&mut self, proto: Box<dyn Protocol>, ctx: &mut Ctx) {
        self.pending.insert(proto.id().to_string());
        ctx.spawn(proto);
    }

    fn start_bit(&mut self, ctx: &mut Ctx) {
        let child_id = format!("{}/m{}", self.id, self.bit);
        let m_key = format!("{}/mk{}", self.id, self.bit);
        let mul = SecureMultiply::new(
            &child_id,
            Some(&self.id),
            &self.same_key,
            &self.bit_keys[self.bit],
            &m_key,
        );
        self.phase = BitPhase::Mul;
        self.spawn_one(Box::new(mul), ctx);
    }

    fn advance(&mut self, ctx: &mut Ctx) {
        if self.bit == 0 {
            let child_id = format!("{}/out", self.id);
            let copy = LocalOpProtocol::copy_share(&child_id, Some(&self.id), &self.res_key, &self.out);
            self.phase = BitPhase::Finish;
            self.spawn_one(Box::new(copy), ctx);
        } else {
            self.bit -= 1;
            self.start_bit(ctx);
        }
    }
}

impl Protocol for BitCompare {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::BitCompare
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        if self.bit_keys.is_empty() {
            return Err(ProtocolError::Config(format!(
                "bit comparison '{}' over zero bits",
                self.id
            )));
        }
        self.bit = self.bit_keys.len() - 1;
        let same = LocalOpProtocol::constant(
            &format!("{}/init_same", self.id),
            Some(&self.id),
            1,
            &self.same_key,
        );
        let res = LocalOpProtocol::constant(
            &format!("{}/init_res", self.id),
            Some(&self.id),
            0,
            &self.res_key,
        );
        self.spawn_one(Box::new(same), ctx);
        self.spawn_one(Box::new(res), ctx);
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
            BitPhase::Init => self.start_bit(ctx),
            BitPhase::Mul => {
                let m_key = format!("{}/mk{}", self.id, self.bit);
                if self.a >> self.bit & 1 == 1 {
                    // equality continues only where b's bit is also set
                    self.same_key = m_key;
                    self.advance(ctx);
                } else {
                    // b's bit can only exceed a's here: res += same * b_i
                    let res_next = format!("{}/resk{}", self.id, self.bit);
                    let same_next = format!("{}/samek{}", self.id, self.bit);
                    let add = LocalOpProtocol::secure_add(
                        &format!("{}/a{}", self.id, self.bit),
                        Some(&self.id),
                        &self.res_key,
                        &m_key,
                        &res_next,
                    );
                    let sub = LocalOpProtocol::secure_sub(
                        &format!("{}/s{}", self.id, self.bit),
                        Some(&self.id),
                        &self.same_key,
                        &m_key,
                        &same_next,
                    );
                    self.res_key = res_next;
                    self.same_key = same_next;
                    self.phase = BitPhase::Update;
                    self.spawn_one(Box::new(add), ctx);
                    self.spawn_one(Box::new(sub), ctx);
                }
            }
            BitPhase::Update => self.advance(ctx),
            BitPhase::Finish => return Ok(Step::Complete(Outcome::Done)),
        }
        Ok(Step::Continue)
    }
}

enum WrapPhase {
    First,
    Second,
}

/// Shares of 1 iff `x >= p/2` (the sign of the signed representation):
/// the LSB of `2x`, which is even exactly when no wrap past the odd prime
/// occurred.
pub struct SecureCompareHalfPrime {
    id: String,
    parent: Option<String>,
    x: String,
    out: String,
    phase: WrapPhase,
    expect: String,
}

impl SecureCompareHalfPrime {
    /// Shares of `[x >= p/2]` under `out`.
    pub fn new(id: &str, parent: Option<&str>, x: &str, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            x: x.to_string(),
            out: out.to_string(),
            phase: WrapPhase::First,
            expect: String::new(),
        }
    }
}

impl Protocol for SecureCompareHalfPrime {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::HalfPrimeCompare
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expect = format!("{}/dbl", self.id);
        ctx.spawn(Box::new(LocalOpProtocol::scalar_multiply(
            &self.expect.clone(),
            Some(&self.id),
            2,
            &self.x,
            &format!("{}/2x", self.id),
        )));
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
        if child != self.expect {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        match self.phase {
            WrapPhase::First => {
                self.expect = format!("{}/lsb", self.id);
                ctx.spawn(Box::new(SecureLsb::new(
                    &self.expect.clone(),
                    Some(&self.id),
                    &format!("{}/2x", self.id),
                    &self.out,
                )));
                self.phase = WrapPhase::Second;
                Ok(Step::Continue)
            }
            WrapPhase::Second => Ok(Step::Complete(Outcome::Done)),
        }
    }
}

/// Shares of 1 iff `A < B` (strict; equality yields 0), for operands below
/// p/2: the half-prime test applied to `A - B`.
pub struct SecureCompare {
    id: String,
    parent: Option<String>,
    a: String,
    b: String,
    out: String,
    phase: WrapPhase,
    expect: String,
}

impl SecureCompare {
    /// Shares of `[a < b]` under `out`.
    pub fn new(id: &str, parent: Option<&str>, a: &str, b: &str, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            a: a.to_string(),
            b: b.to_string(),
            out: out.to_string(),
            phase: WrapPhase::First,
            expect: String::new(),
        }
    }
}

impl Protocol for SecureCompare {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Compare
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        self.expect = format!("{}/sub", self.id);
        ctx.spawn(Box::new(LocalOpProtocol::secure_sub(
            &self.expect.clone(),
            Some(&self.id),
            &self.a,
            &self.b,
            &format!("{}/d", self.id),
        )));
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
        if child != self.expect {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        match self.phase {
            WrapPhase::First => {
                // A < B exactly when A - B wraps into the upper half
                self.expect = format!("{}/sign", self.id);
                ctx.spawn(Box::new(SecureCompareHalfPrime::new(
                    &self.expect.clone(),
                    Some(&self.id),
                    &format!("{}/d", self.id),
                    &self.out,
                )));
                self.phase = WrapPhase::Second;
                Ok(Step::Continue)
            }
            WrapPhase::Second => Ok(Step::Complete(Outcome::Done)),
        }
    }
}

enum ZeroPhase {
    Squaring,
    MulX,
    Inverting,
}

/// Fermat zero test: shares of 1 iff `x = 0`, as `1 - x^(p-1)` computed by a
/// square-and-multiply chain of secure multiplications.
pub struct SecureIsZero {
    id: String,
    parent: Option<String>,
    x: String,
    out: String,
    bits: Vec<bool>,
    pos: usize,
    cur: String,
    seq: usize,
    phase: ZeroPhase,
    expect: String,
}

impl SecureIsZero {
    /// Shares of `[x == 0]` under `out`.
    pub fn new(id: &str, parent: Option<&str>, x: &str, out: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            x: x.to_string(),
            out: out.to_string(),
            bits: Vec::new(),
            pos: 0,
            cur: String::new(),
            seq: 0,
            phase: ZeroPhase::Squaring,
            expect: String::new(),
        }
    }

    fn spawn_multiply(&mut self, a: &str, b: &str, ctx: &mut Ctx) {
        self.seq += 1;
        let child = format!("{}/y{}", self.id, self.seq);
        let key = format!("{}/yk{}", self.id, self.seq);
        ctx.spawn(Box::new(SecureMultiply::new(
            &child,
            Some(&self.id),
            a,
            b,
            &key,
        )));
        self.cur = key;
        self.expect = child;
    }

    fn step(&mut self, ctx: &mut Ctx) {
        if self.pos == self.bits.len() {
            self.expect = format!("{}/inv", self.id);
            ctx.spawn(Box::new(LocalOpProtocol::secure_invert(
                &self.expect.clone(),
                Some(&self.id),
                &self.cur,
                &self.out,
            )));
            self.phase = ZeroPhase::Inverting;
        } else {
            let cur = self.cur.clone();
            self.spawn_multiply(&cur, &cur, ctx);
            self.phase = ZeroPhase::Squaring;
        }
    }
}

impl Protocol for SecureIsZero {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::IsZero
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        // exponent p - 1, most significant bit first; the leading bit is
        // covered by starting the chain at x itself
        let exp = ctx.prime - 1;
        let width = 64 - exp.leading_zeros() as usize;
        self.bits = (0..width - 1)
            .rev()
            .map(|i| exp >> i & 1 == 1)
            .collect();
        self.cur = self.x.clone();
        self.step(ctx);
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
        if child != self.expect {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        match self.phase {
            ZeroPhase::Squaring => {
                if self.bits[self.pos] {
                    let cur = self.cur.clone();
                    let x = self.x.clone();
                    self.spawn_multiply(&cur, &x, ctx);
                    self.phase = ZeroPhase::MulX;
                } else {
                    self.pos += 1;
                    self.step(ctx);
                }
                Ok(Step::Continue)
            }
            ZeroPhase::MulX => {
                self.pos += 1;
                self.step(ctx);
                Ok(Step::Continue)
            }
            ZeroPhase::Inverting => Ok(Step::Complete(Outcome::Done)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::field::MERSENNE_31 as P;
    use crate::mpc::distribute::ShareDistribution;
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
    fn test_compare() {
        let mut sim = testkit::fixture(5, Algorithm::Pdsa, 11);
        distribute(&mut sim, 0, "A", 100);
        distribute(&mut sim, 1, "B", 200);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureCompare::new("t/c1", None, "A", "B", "LT")),
        );
        assert_eq!(reveal(&sim, "LT"), 1);

        distribute(&mut sim, 2, "A", 300);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureCompare::new("t/c2", None, "A", "B", "GT")),
        );
        assert_eq!(reveal(&sim, "GT"), 0);
    }

    #[test]
    fn test_compare_is_strict_on_equality() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 12);
        distribute(&mut sim, 0, "A", 200);
        distribute(&mut sim, 1, "B", 200);
        run_protocol(
            &mut sim,
            2,
            Box::new(SecureCompare::new("t/c", None, "A", "B", "EQ")),
        );
        assert_eq!(reveal(&sim, "EQ"), 0);
    }

    #[test]
    fn test_half_prime_threshold() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 13);
        let below = (P - 1) / 2;
        distribute(&mut sim, 0, "X", below);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureCompareHalfPrime::new("t/h1", None, "X", "LOW")),
        );
        assert_eq!(reveal(&sim, "LOW"), 0);

        distribute(&mut sim, 1, "X", below + 1);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureCompareHalfPrime::new("t/h2", None, "X", "HIGH")),
        );
        assert_eq!(reveal(&sim, "HIGH"), 1);
    }

    #[test]
    fn test_lsb() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 14);
        for (seq, x) in [6u64, 7, 0, 1, 2_000_000_001].into_iter().enumerate() {
            distribute(&mut sim, seq, "X", x);
            run_protocol(
                &mut sim,
                1,
                Box::new(SecureLsb::new(&format!("t/l{seq}"), None, "X", "LSB")),
            );
            assert_eq!(reveal(&sim, "LSB"), x & 1, "lsb of {x}");
        }
    }

    #[test]
    fn test_is_zero() {
        let mut sim = testkit::fixture(3, Algorithm::Pdsa, 15);
        distribute(&mut sim, 0, "X", 0);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureIsZero::new("t/z0", None, "X", "Z0")),
        );
        assert_eq!(reveal(&sim, "Z0"), 1);

        distribute(&mut sim, 1, "X", 5);
        run_protocol(
            &mut sim,
            1,
            Box::new(SecureIsZero::new("t/z1", None, "X", "Z1")),
        );
        assert_eq!(reveal(&sim, "Z1"), 0);
    }
}
