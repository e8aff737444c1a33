//! The per-agent orchestrator.
//!
//! An agent owns its share storage, dispatcher, transport endpoint and two
//! PRNG streams, and drives the round loop: bootstrap once, then per round
//! start a round protocol plus the round barrier, update the selected value
//! on round completion, signal the barrier, and purge non-sticky state when
//! the barrier completes. Everything the agent does runs through a single
//! action queue, so message handling is strictly sequential and never
//! re-entrant.
//!
//! The two PRNG streams are deliberately independent: algorithm randomness
//! (initial values, the PDSA gate) is seeded from `base_seed + id`,
//! cryptographic randomness (polynomial coefficients, masks, Paillier keys)
//! from `base_seed + id + 1000`, so reproducing a problem run never pins
//! the crypto stream and vice versa.

use crate::error::ProtocolError;
use crate::field;
use crate::maxsum::{MaxsumRound, MaxsumState};
use crate::mpc::arithmetic::local_op_responder;
use crate::mpc::distribute::distribute_responder;
use crate::mpc::multiply::multiply_responder;
use crate::mpc::reconstruct::reconstruct_responder;
use crate::paillier::{self, e_key_name, f_key_name, KeyManager};
use crate::problem::Problem;
use crate::rounds::barrier::Barrier;
use crate::rounds::bootstrap::Bootstrap;
use crate::rounds::huddle::Huddle;
use crate::rounds::pdsa::PdsaRound;
use crate::rounds::pmgm::PmgmRound;
use crate::rounds::{barrier_id, boot_barrier_id};
use crate::runtime::dispatcher::{AgentEvent, Dispatcher};
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::protocol::{Ctx, Effects, Outcome, Protocol, SpawnRequest};
use crate::runtime::transport::Transport;
use crate::runtime::AgentId;
use crate::storage::ShareStorage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

/// The privacy-preserving algorithms the runtime implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Privacy-preserving distributed stochastic algorithm.
    Pdsa,
    /// Privacy-preserving maximum gain messaging.
    Pmgm,
    /// Privacy-preserving Max-Sum over Paillier.
    Pmaxsum,
}

/// Per-agent runtime parameters.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Algorithm to run.
    pub algorithm: Algorithm,
    /// Base seed; the agent derives its two streams from it.
    pub base_seed: u64,
    /// PDSA activity probability in `[0, 1]`.
    pub stochastic: f64,
    /// Round budget; `None` runs until the stepper halts the iteration.
    pub last_round: Option<usize>,
    /// Forced initial value; `None` draws one from the algorithm stream.
    pub initial_value: Option<usize>,
    /// Paillier modulus width for PMAXSUM keys.
    pub paillier_bits: u64,
}

enum AgentPhase {
    Boot,
    BootWait,
    Ready,
    InRound,
    AwaitBarrier,
    Stopped,
}

enum Action {
    Deliver(Message, AgentId),
    Start(SpawnRequest),
}

/// One agent of the DCOP runtime.
pub struct Agent {
    id: AgentId,
    problem: Rc<Problem>,
    config: AgentConfig,
    participants: Vec<AgentId>,
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher,
    storage: ShareStorage,
    crypto_rng: ChaCha12Rng,
    algo_rng: ChaCha12Rng,
    maxsum: MaxsumState,
    selected_value: usize,
    round: usize,
    phase: AgentPhase,
    local_queue: Rc<RefCell<VecDeque<Message>>>,
    actions: VecDeque<Action>,
    #[cfg(test)]
    observed: Vec<AgentEvent>,
}

impl Agent {
    /// Build the agent owning `transport`. PMAXSUM agents generate and
    /// register their two Paillier keypairs here.
    pub fn new(
        problem: Rc<Problem>,
        config: AgentConfig,
        mut transport: Box<dyn Transport>,
        key_manager: Rc<RefCell<KeyManager>>,
    ) -> Result<Self, ProtocolError> {
        let id = transport.local_id();
        let participants = transport.participants();
        if participants.len() != problem.num_agents() {
            return Err(ProtocolError::Config(format!(
                "transport knows {} participants but the problem has {} agents",
                participants.len(),
                problem.num_agents()
            )));
        }
        if !(0.0..=1.0).contains(&config.stochastic) {
            return Err(ProtocolError::Config(format!(
                "stochastic parameter {} outside [0, 1]",
                config.stochastic
            )));
        }

        let local_queue = Rc::new(RefCell::new(VecDeque::new()));
        let queue = Rc::clone(&local_queue);
        transport.set_local_callback(Box::new(move |msg| queue.borrow_mut().push_back(msg)));

        let mut algo_rng = ChaCha12Rng::seed_from_u64(config.base_seed + id as u64);
        let mut crypto_rng = ChaCha12Rng::seed_from_u64(config.base_seed + id as u64 + 1000);

        if config.algorithm == Algorithm::Pmaxsum {
            let mut manager = key_manager.borrow_mut();
            manager.insert(
                &e_key_name(id),
                paillier::generate_keypair(config.paillier_bits, &mut crypto_rng)?,
            );
            manager.insert(
                &f_key_name(id),
                paillier::generate_keypair(config.paillier_bits, &mut crypto_rng)?,
            );
        }

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_responder(ProtocolKind::Distribute, distribute_responder);
        dispatcher.register_responder(ProtocolKind::Reconstruct, reconstruct_responder);
        dispatcher.register_responder(ProtocolKind::LocalOp, local_op_responder);
        dispatcher.register_responder(ProtocolKind::Multiply, multiply_responder);
        dispatcher.register_responder(ProtocolKind::Barrier, Barrier::responder);
        dispatcher.register_responder(ProtocolKind::Huddle, Huddle::responder);
        dispatcher.register_responder(
            ProtocolKind::MaxsumFinal,
            crate::maxsum::MarginalArgmin::responder,
        );

        let selected_value = match config.initial_value {
            Some(v) => {
                if v >= problem.domain_size() {
                    return Err(ProtocolError::Config(format!(
                        "initial value {v} outside the domain of size {}",
                        problem.domain_size()
                    )));
                }
                v
            }
            None => algo_rng.gen_range(0..problem.domain_size()),
        };

        Ok(Self {
            id,
            maxsum: MaxsumState::new(key_manager),
            problem,
            config,
            participants,
            transport,
            dispatcher,
            storage: ShareStorage::new(),
            crypto_rng,
            algo_rng,
            selected_value,
            round: 0,
            phase: AgentPhase::Boot,
            local_queue,
            actions: VecDeque::new(),
            #[cfg(test)]
            observed: Vec::new(),
        })
    }

    /// The agent's id.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// The currently selected value.
    pub fn selected_value(&self) -> usize {
        self.selected_value
    }

    /// Number of completed rounds.
    pub fn rounds_completed(&self) -> usize {
        self.round
    }

    /// Whether the agent has exited its round loop.
    pub fn is_stopped(&self) -> bool {
        matches!(self.phase, AgentPhase::Stopped)
    }

    /// Read access to the share store.
    pub fn storage(&self) -> &ShareStorage {
        &self.storage
    }

    /// Halt the round loop; in-flight protocols are abandoned and the
    /// current selected value stands.
    pub fn stop(&mut self) {
        self.phase = AgentPhase::Stopped;
    }

    /// Inter-iteration deep cleanup: drop all shares, all protocol
    /// instances, queued work, and the PMAXSUM carry-over state.
    pub fn shutdown(&mut self) {
        self.stop();
        self.storage.clear_all();
        self.dispatcher.clear_all();
        self.maxsum.reset();
        self.actions.clear();
        self.local_queue.borrow_mut().clear();
    }

    /// Called by the stepper at the start of every simulated round.
    pub fn pre_step(&mut self) -> Result<(), ProtocolError> {
        match self.phase {
            AgentPhase::Boot => {
                let topology = self.config.algorithm == Algorithm::Pmgm;
                let mask = self.config.algorithm != Algorithm::Pmaxsum;
                let bootstrap = Bootstrap::new(self.id, mask, topology);
                self.actions.push_back(Action::Start(SpawnRequest {
                    proto: Box::new(bootstrap),
                    adopt: false,
                }));
                self.actions.push_back(Action::Start(SpawnRequest {
                    proto: Box::new(Barrier::new(&boot_barrier_id(), 0, None)),
                    adopt: true,
                }));
                self.phase = AgentPhase::BootWait;
            }
            AgentPhase::Ready => {
                if self
                    .config
                    .last_round
                    .is_some_and(|last| self.round >= last)
                {
                    self.phase = AgentPhase::Stopped;
                } else {
                    self.start_round();
                }
            }
            _ => {}
        }
        self.pump()
    }

    /// Called by the stepper with one inbound message.
    pub fn deliver(&mut self, msg: Message, sender: AgentId) -> Result<(), ProtocolError> {
        self.actions.push_back(Action::Deliver(msg, sender));
        self.pump()
    }

    /// Called by the stepper at the end of every simulated round.
    pub fn post_step(&mut self) -> Result<(), ProtocolError> {
        self.pump()
    }

    fn start_round(&mut self) {
        let round = self.round;
        let proto: Box<dyn Protocol> = match self.config.algorithm {
            Algorithm::Pdsa => Box::new(PdsaRound::new(round, self.id, self.selected_value)),
            Algorithm::Pmgm => Box::new(PmgmRound::new(round, self.id, self.selected_value)),
            Algorithm::Pmaxsum => Box::new(MaxsumRound::new(
                round,
                self.id,
                self.config.last_round.unwrap_or(usize::MAX),
            )),
        };
        self.actions.push_back(Action::Start(SpawnRequest {
            proto,
            adopt: false,
        }));
        self.actions.push_back(Action::Start(SpawnRequest {
            proto: Box::new(Barrier::new(&barrier_id(round), round, None)),
            adopt: true,
        }));
        self.phase = AgentPhase::InRound;
    }

    /// Drain the action queue, routing effects and agent-level completions.
    fn pump(&mut self) -> Result<(), ProtocolError> {
        loop {
            while let Some(msg) = {
                let mut queue = self.local_queue.borrow_mut();
                queue.pop_front()
            } {
                self.actions.push_back(Action::Deliver(msg, self.id));
            }

            let Some(action) = self.actions.pop_front() else {
                return Ok(());
            };

            let mut effects = Effects::default();
            let events = {
                let mut ctx = Ctx {
                    me: self.id,
                    participants: &self.participants,
                    round: self.round,
                    current_value: self.selected_value,
                    prime: field::MERSENNE_31,
                    stochastic: self.config.stochastic,
                    storage: &mut self.storage,
                    crypto_rng: &mut self.crypto_rng,
                    algo_rng: &mut self.algo_rng,
                    problem: &self.problem,
                    maxsum: &mut self.maxsum,
                    effects: &mut effects,
                };
                match action {
                    Action::Deliver(msg, sender) => {
                        self.dispatcher.deliver(&msg, sender, &mut ctx)?
                    }
                    Action::Start(request) => self.dispatcher.start(request, &mut ctx)?,
                }
            };

            for (to, msg) in effects.sends {
                self.transport.send(msg, to)?;
            }
            for spawn in effects.spawns {
                self.actions.push_back(Action::Start(spawn));
            }
            for event in events {
                self.handle_event(event)?;
            }
        }
    }

    fn handle_event(&mut self, event: AgentEvent) -> Result<(), ProtocolError> {
        match event.kind {
            ProtocolKind::Bootstrap => {
                self.broadcast_signal(&boot_barrier_id(), 0)?;
            }
            ProtocolKind::Barrier if event.id == boot_barrier_id() => {
                self.phase = AgentPhase::Ready;
            }
            ProtocolKind::Barrier => {
                self.storage.clear_non_sticky();
                self.dispatcher.clear_all();
                self.round += 1;
                self.phase = AgentPhase::Ready;
            }
            ProtocolKind::PdsaRound | ProtocolKind::PmgmRound | ProtocolKind::MaxsumRound => {
                let Outcome::Value(value) = &event.outcome else {
                    return Err(ProtocolError::Reconstruction(format!(
                        "round '{}' completed without a value",
                        event.id
                    )));
                };
                let value = *value as usize;
                if value >= self.problem.domain_size() {
                    return Err(ProtocolError::Reconstruction(format!(
                        "round '{}' produced value {} outside the domain",
                        event.id, value
                    )));
                }
                self.selected_value = value;
                self.broadcast_signal(&barrier_id(self.round), self.round)?;
                self.phase = AgentPhase::AwaitBarrier;
            }
            _ => {
                debug!(agent = self.id, id = %event.id, "ignoring completion");
            }
        }
        #[cfg(test)]
        self.observed.push(event);
        Ok(())
    }

    fn broadcast_signal(&mut self, id: &str, round: usize) -> Result<(), ProtocolError> {
        let msg = Barrier::signal(id, round, self.id);
        for &participant in &self.participants.clone() {
            self.transport.send(msg.clone(), participant)?;
        }
        Ok(())
    }

    /// Start an externally built protocol on this agent (tests only).
    #[cfg(test)]
    pub(crate) fn inject(&mut self, proto: Box<dyn Protocol>) -> Result<(), ProtocolError> {
        self.actions.push_back(Action::Start(SpawnRequest {
            proto,
            adopt: false,
        }));
        self.pump()
    }

    /// Outcome of an observed top-level completion (tests only).
    #[cfg(test)]
    pub(crate) fn find_event(&self, id: &str) -> Option<Outcome> {
        self.observed
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.outcome.clone())
    }
}
