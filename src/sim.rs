//! The discrete-event stepper driving a set of agents through one
//! iteration.
//!
//! Single-threaded and cooperative: every tick promotes last tick's sends,
//! calls each agent's `pre_step`, delivers each agent's inbox (senders in
//! sorted order, FIFO within a sender), and calls each agent's `post_step`.
//! No two agents ever execute simultaneously and no handler is re-entered,
//! so the only concurrency an agent perceives is messages from others
//! arriving between its ticks.

use crate::agent::{Agent, AgentConfig, Algorithm};
use crate::paillier::KeyManager;
use crate::problem::Problem;
use crate::runtime::transport::{create_network, Network};
use crate::runtime::AgentId;
use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Per-round tick allowance before the stepper declares the iteration
/// wedged; PMGM rounds run long sub-protocol chains but stay well below
/// this.
const TICKS_PER_ROUND: u64 = 100_000;

/// When an iteration halts.
#[derive(Clone, Copy, Debug)]
pub enum Halting {
    /// Stop once every agent has completed this many rounds.
    Rounds(usize),
    /// Stop when the wall clock budget is exhausted.
    Timeout(Duration),
}

/// Parameters of one iteration.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Algorithm to run.
    pub algorithm: Algorithm,
    /// Base seed for all per-agent streams.
    pub base_seed: u64,
    /// PDSA activity probability.
    pub stochastic: f64,
    /// Halting mode.
    pub halting: Halting,
    /// Forced common initial value; `None` draws per-agent values.
    pub initial_value: Option<usize>,
    /// Paillier modulus width for PMAXSUM.
    pub paillier_bits: u64,
}

impl RunConfig {
    /// Config with the customary defaults (stochastic 0.7, random initial
    /// values, 512-bit Paillier moduli).
    pub fn new(algorithm: Algorithm, base_seed: u64, halting: Halting) -> Self {
        Self {
            algorithm,
            base_seed,
            stochastic: 0.7,
            halting,
            initial_value: None,
            paillier_bits: 512,
        }
    }
}

/// What one iteration produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationOutcome {
    /// Final selected value per agent, in agent-id order.
    pub values: Vec<usize>,
    /// Completed round count per agent, in agent-id order.
    pub rounds: Vec<usize>,
    /// Wall-clock time of the iteration.
    pub runtime: Duration,
    /// Total assignment cost under the problem's constraints.
    pub total_cost: u64,
}

/// One iteration's worth of agents plus the message fabric.
pub struct Simulation {
    problem: Rc<Problem>,
    agents: Vec<Agent>,
    net: Rc<RefCell<Network>>,
    halting: Halting,
}

impl Simulation {
    /// Build the agents and the full-mesh network for `problem`.
    pub fn new(problem: Problem, config: &RunConfig) -> Result<Self> {
        let problem = Rc::new(problem);
        let ids: Vec<AgentId> = problem.agents().collect();
        let (net, transports) = create_network(&ids);
        let key_manager = Rc::new(RefCell::new(KeyManager::default()));
        let last_round = match config.halting {
            Halting::Rounds(n) => Some(n),
            Halting::Timeout(_) => None,
        };

        let mut agents = Vec::with_capacity(ids.len());
        for transport in transports {
            let agent_config = AgentConfig {
                algorithm: config.algorithm,
                base_seed: config.base_seed,
                stochastic: config.stochastic,
                last_round,
                initial_value: config.initial_value,
                paillier_bits: config.paillier_bits,
            };
            let agent = Agent::new(
                Rc::clone(&problem),
                agent_config,
                Box::new(transport),
                Rc::clone(&key_manager),
            )
            .context("creating agent")?;
            agents.push(agent);
        }

        Ok(Self {
            problem,
            agents,
            net,
            halting: config.halting,
        })
    }

    /// The problem this simulation runs on.
    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    /// Read access to an agent.
    pub fn agent(&self, id: AgentId) -> &Agent {
        &self.agents[id - 1]
    }

    pub(crate) fn agent_mut(&mut self, id: AgentId) -> &mut Agent {
        &mut self.agents[id - 1]
    }

    /// One simulated round: promote sends, pre-step, deliver, post-step.
    pub fn tick(&mut self) -> Result<()> {
        self.net.borrow_mut().advance();
        for agent in &mut self.agents {
            let id = agent.id();
            agent
                .pre_step()
                .with_context(|| format!("agent {id} pre-step"))?;
        }
        let ids: Vec<AgentId> = self.agents.iter().map(Agent::id).collect();
        for &id in &ids {
            let inbox = self.net.borrow_mut().drain_to(id);
            for (sender, msg) in inbox {
                self.agent_mut(id)
                    .deliver(msg, sender)
                    .with_context(|| format!("agent {id} handling message from {sender}"))?;
            }
        }
        for agent in &mut self.agents {
            let id = agent.id();
            agent
                .post_step()
                .with_context(|| format!("agent {id} post-step"))?;
        }
        Ok(())
    }

    /// Run the iteration to its halting condition and read off the results.
    /// In-flight protocols cannot veto termination: agents surface whatever
    /// value they hold.
    pub fn run(&mut self) -> Result<IterationOutcome> {
        let start = Instant::now();
        let tick_limit = match self.halting {
            Halting::Rounds(n) => (n as u64 + 2) * TICKS_PER_ROUND,
            Halting::Timeout(_) => u64::MAX,
        };

        let mut ticks = 0u64;
        loop {
            let done = match self.halting {
                Halting::Rounds(_) => self.agents.iter().all(Agent::is_stopped),
                Halting::Timeout(budget) => start.elapsed() >= budget,
            };
            if done {
                break;
            }
            if ticks >= tick_limit {
                bail!("iteration made no progress after {ticks} ticks");
            }
            self.tick()?;
            ticks += 1;
        }

        for agent in &mut self.agents {
            agent.stop();
        }
        let values: Vec<usize> = self.agents.iter().map(Agent::selected_value).collect();
        let rounds: Vec<usize> = self.agents.iter().map(Agent::rounds_completed).collect();
        let outcome = IterationOutcome {
            total_cost: self.problem.total_cost(&values),
            values,
            rounds,
            runtime: start.elapsed(),
        };
        for agent in &mut self.agents {
            agent.shutdown();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Shared fixtures for protocol-level tests: a settled simulation whose
    //! agents have bootstrapped but run no rounds, plus helpers to drive an
    //! injected protocol to completion and to collect shares across agents.

    use super::*;
    use crate::runtime::protocol::{Outcome, Protocol};
    use crate::share::Share;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn fixture_problem(n: usize, seed: u64) -> Problem {
        let mut rng = StdRng::seed_from_u64(seed);
        Problem::random(n, 3, 0.6, 10, &mut rng).unwrap()
    }

    /// A bootstrapped, round-less simulation of `n` agents.
    pub(crate) fn fixture(n: usize, algorithm: Algorithm, seed: u64) -> Simulation {
        let config = RunConfig {
            algorithm,
            base_seed: seed,
            stochastic: 1.0,
            halting: Halting::Rounds(0),
            initial_value: None,
            paillier_bits: 128,
        };
        let mut sim = Simulation::new(fixture_problem(n, seed), &config).unwrap();
        settle(&mut sim);
        sim
    }

    /// Tick until every agent has left its round loop and the fabric is
    /// quiet.
    pub(crate) fn settle(sim: &mut Simulation) {
        for _ in 0..50_000 {
            if sim.agents.iter().all(Agent::is_stopped) && sim.net.borrow().is_idle() {
                return;
            }
            sim.tick().unwrap();
        }
        panic!("simulation did not settle");
    }

    /// Inject `proto` on `agent` and tick until it completes.
    pub(crate) fn run_protocol(
        sim: &mut Simulation,
        agent: AgentId,
        proto: Box<dyn Protocol>,
    ) -> Outcome {
        let id = proto.id().to_string();
        sim.agent_mut(agent).inject(proto).unwrap();
        for _ in 0..500_000 {
            if let Some(outcome) = sim.agent(agent).find_event(&id) {
                return outcome;
            }
            sim.tick().unwrap();
        }
        panic!("protocol '{id}' did not complete");
    }

    /// Every agent's share of `key`, in agent-id order.
    pub(crate) fn collect_shares(sim: &Simulation, key: &str) -> Vec<Share> {
        sim.agents
            .iter()
            .filter_map(|a| a.storage().get(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::R_KEY;

    fn pdsa_config(seed: u64, rounds: usize) -> RunConfig {
        RunConfig {
            algorithm: Algorithm::Pdsa,
            base_seed: seed,
            stochastic: 1.0,
            halting: Halting::Rounds(rounds),
            initial_value: None,
            paillier_bits: 128,
        }
    }

    #[test]
    fn test_identical_runs_are_identical() {
        let config = pdsa_config(77, 2);
        let run = |config: &RunConfig| {
            let mut sim =
                Simulation::new(testkit::fixture_problem(4, config.base_seed), config).unwrap();
            sim.run().unwrap()
        };
        let first = run(&config);
        let second = run(&config);
        assert_eq!(first.values, second.values);
        assert_eq!(first.rounds, second.rounds);
        assert_eq!(first.total_cost, second.total_cost);
    }

    #[test]
    fn test_agents_stay_in_lockstep() {
        let config = pdsa_config(5, 2);
        let mut sim = Simulation::new(testkit::fixture_problem(3, 5), &config).unwrap();
        for _ in 0..500_000 {
            if sim.agents.iter().all(Agent::is_stopped) {
                break;
            }
            sim.tick().unwrap();
            // round counters only ever advance together, tick by tick
            let rounds: Vec<usize> = sim.agents.iter().map(Agent::rounds_completed).collect();
            assert!(rounds.iter().all(|&r| r == rounds[0]), "rounds diverged: {rounds:?}");
        }
        assert!(sim.agents.iter().all(Agent::is_stopped));
    }

    #[test]
    fn test_storage_purged_after_every_barrier() {
        let config = pdsa_config(11, 1);
        let mut sim = Simulation::new(testkit::fixture_problem(3, 11), &config).unwrap();
        for _ in 0..500_000 {
            sim.tick().unwrap();
            if sim.agents.iter().all(|a| a.rounds_completed() >= 1) {
                break;
            }
        }
        for agent in &sim.agents {
            assert!(agent.rounds_completed() >= 1);
            assert_eq!(agent.storage().count(), agent.storage().sticky_count());
            assert!(agent.storage().has(R_KEY));
        }
    }

    #[test]
    fn test_storage_empty_after_iteration() {
        let config = pdsa_config(13, 1);
        let mut sim = Simulation::new(testkit::fixture_problem(3, 13), &config).unwrap();
        let outcome = sim.run().unwrap();
        assert_eq!(outcome.rounds, vec![1, 1, 1]);
        for agent in &sim.agents {
            assert_eq!(agent.storage().count(), 0);
        }
    }

    #[test]
    fn test_timeout_halting() {
        let config = RunConfig {
            halting: Halting::Timeout(Duration::from_millis(200)),
            ..pdsa_config(17, 0)
        };
        let mut sim = Simulation::new(testkit::fixture_problem(3, 17), &config).unwrap();
        let outcome = sim.run().unwrap();
        let domain = sim.problem().domain_size();
        assert!(outcome.values.iter().all(|&v| v < domain));
    }
}
