//! One PDSA round.
//!
//! Sharing fills the agent's per-value cost vector through the huddle; the
//! stochastic gate then either keeps the current value or runs the secure
//! argmin over the vector and reconstructs the winning value. The agent
//! signals the round barrier after the listener fires.

use crate::error::ProtocolError;
use crate::mpc::minmax::FindExtremum;
use crate::mpc::reconstruct::Reconstruct;
use crate::rounds::huddle::Huddle;
use crate::rounds::{bestvalue_key, mincost_key, wb_base};
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Outcome, Protocol, Step};
use crate::runtime::AgentId;
use rand::Rng;
use tracing::debug;

/// Id of agent `me`'s round-`r` PDSA instance.
pub fn pdsa_round_id(round: usize, me: AgentId) -> String {
    format!("pdsa-r{round}-a{me}")
}

enum PdsaPhase {
    Sharing,
    FindingBest,
    Updating,
}

/// State machine of one PDSA round on one agent.
pub struct PdsaRound {
    id: String,
    me: AgentId,
    round: usize,
    initial_value: usize,
    phase: PdsaPhase,
    expect: String,
}

impl PdsaRound {
    /// Round `round` for agent `me`, starting from its current value.
    pub fn new(round: usize, me: AgentId, initial_value: usize) -> Self {
        Self {
            id: pdsa_round_id(round, me),
            me,
            round,
            initial_value,
            phase: PdsaPhase::Sharing,
            expect: String::new(),
        }
    }
}

impl Protocol for PdsaRound {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::PdsaRound
    }

    fn on_start(&mut self, ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        let huddle = Huddle::new(self.round, Some(&self.id));
        self.expect = huddle.id().to_string();
        ctx.spawn_adopt(Box::new(huddle));
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
        if ctx.round != self.round {
            return Err(ProtocolError::WrongRound {
                expected: self.round,
                got: ctx.round,
                protocol: self.id.clone(),
            });
        }

        match self.phase {
            PdsaPhase::Sharing => {
                let gate: f64 = ctx.algo_rng.gen();
                if gate >= ctx.stochastic {
                    return Ok(Step::Complete(Outcome::Value(self.initial_value as u64)));
                }
                let domain = ctx.problem.domain_size();
                self.expect = format!("{}/min", self.id);
                let min = FindExtremum::min(
                    &self.expect.clone(),
                    Some(&self.id),
                    &wb_base(self.me),
                    0,
                    domain - 1,
                    &mincost_key(self.me),
                    &bestvalue_key(self.me),
                )?;
                ctx.spawn(Box::new(min));
                self.phase = PdsaPhase::FindingBest;
                Ok(Step::Continue)
            }
            PdsaPhase::FindingBest => {
                self.expect = format!("{}/rec", self.id);
                ctx.spawn(Box::new(Reconstruct::new(
                    &self.expect.clone(),
                    Some(&self.id),
                    &bestvalue_key(self.me),
                )));
                self.phase = PdsaPhase::Updating;
                Ok(Step::Continue)
            }
            PdsaPhase::Updating => {
                let Outcome::Value(new_value) = outcome else {
                    return Err(ProtocolError::Reconstruction(format!(
                        "best-value reveal of '{}' returned no value",
                        self.id
                    )));
                };
                Ok(Step::Complete(Outcome::Value(*new_value)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Algorithm;
    use crate::problem::Problem;
    use crate::sim::{Halting, RunConfig, Simulation};

    fn config(rounds: usize, stochastic: f64, initial: Option<usize>) -> RunConfig {
        RunConfig {
            algorithm: Algorithm::Pdsa,
            base_seed: 1,
            stochastic,
            halting: Halting::Rounds(rounds),
            initial_value: initial,
            paillier_bits: 128,
        }
    }

    #[test]
    fn test_two_agents_converge_to_the_zero_cost_pair() {
        let problem = Problem::new(
            2,
            3,
            vec![(1, 2, vec![vec![5, 1, 4], vec![2, 0, 7], vec![3, 6, 8]])],
        )
        .unwrap();
        let mut sim = Simulation::new(problem, &config(1, 1.0, Some(0))).unwrap();
        let outcome = sim.run().unwrap();
        assert_eq!(outcome.values, vec![1, 1]);
        assert_eq!(outcome.total_cost, 0);
        assert_eq!(outcome.rounds, vec![1, 1]);
    }

    #[test]
    fn test_accepted_moves_never_worsen_the_frozen_assignment() {
        let problem = crate::sim::testkit::fixture_problem(4, 31);
        let mut sim = Simulation::new(problem, &config(1, 1.0, Some(0))).unwrap();
        let outcome = sim.run().unwrap();

        let initial = vec![0usize; 4];
        let base_cost = sim.problem().total_cost(&initial);
        for (idx, &value) in outcome.values.iter().enumerate() {
            let mut moved = initial.clone();
            moved[idx] = value;
            assert!(
                sim.problem().total_cost(&moved) <= base_cost,
                "agent {} moved to {} and worsened the frozen assignment",
                idx + 1,
                value
            );
        }
    }

    #[test]
    fn test_zero_stochastic_keeps_all_values() {
        let problem = crate::sim::testkit::fixture_problem(3, 32);
        let mut sim = Simulation::new(problem, &config(2, 0.0, Some(1))).unwrap();
        let outcome = sim.run().unwrap();
        assert_eq!(outcome.values, vec![1, 1, 1]);
        assert_eq!(outcome.rounds, vec![2, 2, 2]);
    }
}
