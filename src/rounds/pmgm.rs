//! One PMGM round.
//!
//! Each agent computes shares of the gain it would realize by switching to
//! its best value, weighs every agent's gain by the sticky topology
//! indicator of its own neighborhood, and runs a secure argmax over the
//! weighted vector. Only the agent whose id wins the argmax (smallest id on
//! ties) applies its best value; everyone else re-selects its current value.
//! The whole decision is carried out on shares, so no agent learns who
//! switched or why.

use crate::error::ProtocolError;
use crate::mpc::arithmetic::LocalOpProtocol;
use crate::mpc::compare::SecureIsZero;
use crate::mpc::distribute::{ShareDistribution, VectorShareDistribution};
use crate::mpc::minmax::FindExtremum;
use crate::mpc::multiply::{SecureDotProduct, SecureMultiply};
use crate::mpc::reconstruct::Reconstruct;
use crate::mpc::vector_key;
use crate::rounds::barrier::Barrier;
use crate::rounds::huddle::Huddle;
use crate::rounds::{
    bestvalue_key, curcost_key, currval_key, evec_base, g_base, gain_key, gains_barrier_id,
    mincost_key, n_key, wb_base,
};
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use std::collections::HashSet;
use tracing::debug;

/// Id of agent `me`'s round-`r` PMGM instance.
pub fn pmgm_round_id(round: usize, me: AgentId) -> String {
    format!("pmgm-r{round}-a{me}")
}

/// Key of the share of agent `i`'s maximum neighborhood gain.
pub fn maxgain_key(agent: AgentId) -> String {
    format!("maxGain_{agent}")
}

/// Key of the share of the agent id realizing that maximum.
pub fn maxgainagent_key(agent: AgentId) -> String {
    format!("maxGainAgent_{agent}")
}

enum PmgmPhase {
    Sharing,
    FindingMin,
    DistributingE,
    ComputingCost,
    ComputingGain,
    SyncingGains,
    BuildingGains,
    FindingMax,
    Diffing,
    TestingMax,
    ValueDiffing,
    Scaling,
    Finalizing,
    Reconstructing,
}

/// State machine of one PMGM round on one agent.
pub struct PmgmRound {
    id: String,
    me: AgentId,
    round: usize,
    initial_value: usize,
    phase: PmgmPhase,
    pending: HashSet<String>,
}

impl PmgmRound {
    /// Round `round` for agent `me`, starting from its current value.
    pub fn new(round: usize, me: AgentId, initial_value: usize) -> Self {
        Self {
            id: pmgm_round_id(round, me),
            me,
            round,
            initial_value,
            phase: PmgmPhase::Sharing,
            pending: HashSet::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{name}", self.id)
    }

    fn spawn_one(&mut self, proto: Box<dyn Protocol>, ctx: &mut Ctx) {
        self.pending.insert(proto.id().to_string());
        ctx.spawn(proto);
    }

    fn advance(&mut self, outcome: &Outcome, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        let me = self.me;
        match self.phase {
            PmgmPhase::Sharing => {
                let domain = ctx.problem.domain_size();
                let min = FindExtremum::min(
                    &self.key("min"),
                    Some(&self.id),
                    &wb_base(me),
                    0,
                    domain - 1,
                    &mincost_key(me),
                    &bestvalue_key(me),
                )?;
                self.phase = PmgmPhase::FindingMin;
                self.spawn_one(Box::new(min), ctx);
            }
            PmgmPhase::FindingMin => {
                let domain = ctx.problem.domain_size();
                let unit: Vec<u64> = (0..domain)
                    .map(|x| (x == self.initial_value) as u64)
                    .collect();
                let evec = VectorShareDistribution::new(
                    &self.key("e"),
                    Some(&self.id),
                    &evec_base(me),
                    unit,
                    false,
                );
                self.phase = PmgmPhase::DistributingE;
                self.spawn_one(Box::new(evec), ctx);
            }
            PmgmPhase::DistributingE => {
                let domain = ctx.problem.domain_size();
                let wb: Vec<String> = (0..domain).map(|x| vector_key(&wb_base(me), x)).collect();
                let evec: Vec<String> = (0..domain)
                    .map(|x| vector_key(&evec_base(me), x))
                    .collect();
                let dot =
                    SecureDotProduct::new(&self.key("dot"), Some(&self.id), wb, evec, &curcost_key(me));
                self.phase = PmgmPhase::ComputingCost;
                self.spawn_one(Box::new(dot), ctx);
            }
            PmgmPhase::ComputingCost => {
                let gain = LocalOpProtocol::secure_sub(
                    &self.key("gain"),
                    Some(&self.id),
                    &curcost_key(me),
                    &mincost_key(me),
                    &gain_key(me),
                );
                self.phase = PmgmPhase::ComputingGain;
                self.spawn_one(Box::new(gain), ctx);
            }
            PmgmPhase::ComputingGain => {
                // every agent's gain share must be in place everywhere
                // before the weighing multiplications read them
                let barrier_id = gains_barrier_id(self.round);
                ctx.broadcast(&Barrier::signal(&barrier_id, self.round, me));
                let barrier = Barrier::new(&barrier_id, self.round, Some(&self.id));
                self.pending.insert(barrier_id);
                ctx.spawn_adopt(Box::new(barrier));
                self.phase = PmgmPhase::SyncingGains;
            }
            PmgmPhase::SyncingGains => {
                for &j in ctx.participants {
                    let out = vector_key(&g_base(me), j);
                    let proto: Box<dyn Protocol> = if j == me {
                        Box::new(LocalOpProtocol::copy_share(
                            &self.key(&format!("g{j}")),
                            Some(&self.id),
                            &gain_key(me),
                            &out,
                        ))
                    } else {
                        Box::new(SecureMultiply::new(
                            &self.key(&format!("g{j}")),
                            Some(&self.id),
                            &gain_key(j),
                            &n_key(me, j),
                            &out,
                        ))
                    };
                    self.spawn_one(proto, ctx);
                }
                self.phase = PmgmPhase::BuildingGains;
            }
            PmgmPhase::BuildingGains => {
                let n = ctx.participants.len();
                let max = FindExtremum::max(
                    &self.key("max"),
                    Some(&self.id),
                    &g_base(me),
                    1,
                    n,
                    &maxgain_key(me),
                    &maxgainagent_key(me),
                )?;
                self.phase = PmgmPhase::FindingMax;
                self.spawn_one(Box::new(max), ctx);
            }
            PmgmPhase::FindingMax => {
                let diff = LocalOpProtocol::secure_known_sub(
                    &self.key("diff"),
                    Some(&self.id),
                    me as u64,
                    &maxgainagent_key(me),
                    false,
                    &self.key("diffk"),
                );
                self.phase = PmgmPhase::Diffing;
                self.spawn_one(Box::new(diff), ctx);
            }
            PmgmPhase::Diffing => {
                let ismax = SecureIsZero::new(
                    &self.key("iszero"),
                    Some(&self.id),
                    &self.key("diffk"),
                    &self.key("ismax"),
                );
                self.phase = PmgmPhase::TestingMax;
                self.spawn_one(Box::new(ismax), ctx);
            }
            PmgmPhase::TestingMax => {
                let vdiff = LocalOpProtocol::secure_sub(
                    &self.key("vd"),
                    Some(&self.id),
                    &bestvalue_key(me),
                    &currval_key(me),
                    &self.key("vdk"),
                );
                self.phase = PmgmPhase::ValueDiffing;
                self.spawn_one(Box::new(vdiff), ctx);
            }
            PmgmPhase::ValueDiffing => {
                let tmp = SecureMultiply::new(
                    &self.key("tmp"),
                    Some(&self.id),
                    &self.key("ismax"),
                    &self.key("vdk"),
                    &self.key("tmpk"),
                );
                self.phase = PmgmPhase::Scaling;
                self.spawn_one(Box::new(tmp), ctx);
            }
            PmgmPhase::Scaling => {
                let fin = LocalOpProtocol::secure_add(
                    &self.key("fin"),
                    Some(&self.id),
                    &currval_key(me),
                    &self.key("tmpk"),
                    &self.key("fink"),
                );
                self.phase = PmgmPhase::Finalizing;
                self.spawn_one(Box::new(fin), ctx);
            }
            PmgmPhase::Finalizing => {
                let rec = Reconstruct::new(&self.key("rec"), Some(&self.id), &self.key("fink"));
                self.phase = PmgmPhase::Reconstructing;
                self.spawn_one(Box::new(rec), ctx);
            }
            PmgmPhase::Reconstructing => {
                let Outcome::Value(new_value) = outcome else {
                    return Err(ProtocolError::Reconstruction(format!(
                        "final-value reveal of '{}' returned no value",
                        self.id
                    )));
                };
                return Ok(Step::Complete(Outcome::Value(*new_value)));
            }
        }
        Ok(Step::Continue)
    }
}

impl Protocol for PmgmRound {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::PmgmRound
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        let huddle = Huddle::new(self.round, Some(&self.id));
        self.pending.insert(huddle.id().to_string());
        ctx.spawn_adopt(Box::new(huddle));

        let currval = ShareDistribution::new(
            &self.key("cv"),
            Some(&self.id),
            &currval_key(self.me),
            self.initial_value as u64,
            false,
        );
        self.spawn_one(Box::new(currval), ctx);
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
        if !self.pending.remove(child) {
            debug!(protocol = %self.id, child, "stale child completion");
            return Ok(Step::Continue);
        }
        if ctx.round != self.round {
            return Err(ProtocolError::WrongRound {
                expected: self.round,
                got: ctx.round,
                protocol: self.id.clone(),
            });
        }
        if !self.pending.is_empty() {
            return Ok(Step::Continue);
        }
        self.advance(outcome, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::problem::Problem;
    use crate::sim::{Halting, RunConfig, Simulation};

    fn config(rounds: usize) -> RunConfig {
        RunConfig {
            algorithm: Algorithm::Pmgm,
            base_seed: 2,
            stochastic: 1.0,
            halting: Halting::Rounds(rounds),
            initial_value: Some(0),
            paillier_bits: 128,
        }
    }

    #[test]
    fn test_only_the_positive_gain_agent_switches() {
        // a triangle where, from the all-zeros assignment, only agent 2 can
        // improve anything
        let problem = Problem::new(
            3,
            2,
            vec![
                (1, 2, vec![vec![3, 0], vec![5, 5]]),
                (2, 3, vec![vec![4, 4], vec![0, 9]]),
                (1, 3, vec![vec![1, 1], vec![1, 1]]),
            ],
        )
        .unwrap();
        let before = problem.total_cost(&[0, 0, 0]);
        let mut sim = Simulation::new(problem, &config(1)).unwrap();
        let outcome = sim.run().unwrap();
        assert_eq!(outcome.values, vec![0, 1, 0]);
        assert!(outcome.total_cost < before);
    }

    #[test]
    fn test_at_most_one_switcher_per_neighborhood() {
        let problem = crate::sim::testkit::fixture_problem(4, 41);
        let mut sim = Simulation::new(problem, &config(1)).unwrap();
        let outcome = sim.run().unwrap();

        let changed: Vec<bool> = outcome.values.iter().map(|&v| v != 0).collect();
        for i in 1..=4usize {
            for j in i + 1..=4 {
                if sim.problem().is_connected(i, j) {
                    assert!(
                        !(changed[i - 1] && changed[j - 1]),
                        "neighbors {i} and {j} both switched in one round"
                    );
                }
            }
        }
    }
}
