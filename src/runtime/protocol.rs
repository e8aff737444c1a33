//! The protocol state-machine contract and the execution context handed to
//! every handler.
//!
//! A protocol instance never blocks: it reacts to `on_start`, incoming
//! messages and child completions, enqueues sends and child spawns into the
//! [Ctx], and either continues or completes. The dispatcher applies the
//! queued effects after the handler returns, so no handler ever re-enters
//! the dispatcher for its own inbound traffic.

use crate::error::ProtocolError;
use crate::maxsum::MaxsumState;
use crate::problem::Problem;
use crate::runtime::message::{Message, ProtocolKind};
use crate::runtime::{round_tag, AgentId};
use crate::share::Share;
use crate::storage::ShareStorage;
use rand_chacha::ChaCha12Rng;

/// Handler result: keep running or finish with an [Outcome].
pub enum Step {
    /// The instance stays registered and keeps receiving events.
    Continue,
    /// The instance is done; the dispatcher removes it and notifies the
    /// parent (or the agent, for top-level protocols).
    Complete(Outcome),
}

/// What a completed protocol hands to its listener. Most protocols signal
/// through the pre-agreed output storage key and complete with [Outcome::Done];
/// reconstructions carry the recovered plaintext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Completed; results, if any, are under the agreed storage keys.
    Done,
    /// Completed with a public value (reconstructions, round results).
    Value(u64),
}

/// A child-spawn request queued by a handler.
pub struct SpawnRequest {
    /// The instance to register and start.
    pub proto: Box<dyn Protocol>,
    /// When set and an instance with the same id already exists (created by
    /// an early-arriving message), adopt that instance instead of starting a
    /// duplicate.
    pub adopt: bool,
}

/// Effects accumulated during one handler invocation.
#[derive(Default)]
pub struct Effects {
    /// Messages to deliver (self-sends take the local fast path).
    pub sends: Vec<(AgentId, Message)>,
    /// Protocols to start once the current handler has returned.
    pub spawns: Vec<SpawnRequest>,
}

/// Execution context of one handler invocation on one agent.
pub struct Ctx<'a> {
    /// The agent this dispatcher belongs to.
    pub me: AgentId,
    /// All participating agents, sorted, including `me`.
    pub participants: &'a [AgentId],
    /// The agent's current round number.
    pub round: usize,
    /// The agent's currently selected value.
    pub current_value: usize,
    /// The working prime.
    pub prime: u64,
    /// PDSA activity probability.
    pub stochastic: f64,
    /// The agent's share store.
    pub storage: &'a mut ShareStorage,
    /// Cryptographic stream: polynomial coefficients, masks, offsets.
    pub crypto_rng: &'a mut ChaCha12Rng,
    /// Algorithm stream: stochastic gates, value picks.
    pub algo_rng: &'a mut ChaCha12Rng,
    /// The DCOP instance (full-mesh view over `cost_matrix`).
    pub problem: &'a Problem,
    /// PMAXSUM carry-over state and key manager handle.
    pub maxsum: &'a mut MaxsumState,
    /// Effect buffers drained by the dispatcher.
    pub effects: &'a mut Effects,
}

impl Ctx<'_> {
    /// Storage tag of the current round.
    pub fn tag(&self) -> String {
        round_tag(self.round)
    }

    /// Reconstruction threshold, `floor(N/2)`.
    pub fn threshold(&self) -> usize {
        (self.participants.len() / 2).max(1)
    }

    /// Queue a message to one participant.
    pub fn send(&mut self, to: AgentId, msg: Message) {
        self.effects.sends.push((to, msg));
    }

    /// Queue a message to every participant, `me` included.
    pub fn broadcast(&mut self, msg: &Message) {
        for &a in self.participants {
            self.effects.sends.push((a, msg.clone()));
        }
    }

    /// Queue a child protocol start.
    pub fn spawn(&mut self, proto: Box<dyn Protocol>) {
        self.effects.spawns.push(SpawnRequest {
            proto,
            adopt: false,
        });
    }

    /// Queue a child start that adopts an existing same-id instance if one
    /// was already created by an early-arriving message.
    pub fn spawn_adopt(&mut self, proto: Box<dyn Protocol>) {
        self.effects.spawns.push(SpawnRequest { proto, adopt: true });
    }

    /// Fetch a share, raising the fatal missing-share error if absent.
    pub fn get_share(&self, key: &str) -> Result<Share, ProtocolError> {
        self.storage
            .get(key)
            .ok_or_else(|| ProtocolError::MissingShare {
                key: key.to_string(),
                agent: self.me,
                round: self.round,
            })
    }
}

/// A protocol instance driven by the dispatcher.
pub trait Protocol {
    /// Instance id. Sub-protocol ids are derived from the parent's id plus a
    /// local sequence number, so any participant can derive them.
    fn id(&self) -> &str;

    /// Protocol type tag.
    fn kind(&self) -> ProtocolKind;

    /// Id of the parent instance completions are reported to; `None` for
    /// top-level protocols (their completions go to the agent) and for
    /// responders.
    fn parent(&self) -> Option<&str> {
        None
    }

    /// Called once when the dispatcher registers the instance. Responders
    /// built by factories are driven purely by messages and keep the default.
    fn on_start(&mut self, _ctx: &mut Ctx) -> Result<Step, ProtocolError> {
        Ok(Step::Continue)
    }

    /// Handle one inbound message.
    fn on_message(
        &mut self,
        msg: &Message,
        sender: AgentId,
        ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError>;

    /// Handle completion of a child spawned by this instance.
    fn on_child_complete(
        &mut self,
        _child: &str,
        _outcome: &Outcome,
        _ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        Ok(Step::Continue)
    }

    /// Called instead of `on_start` when a same-id instance already existed:
    /// the existing instance takes over the initiator role of the spawn that
    /// arrived late.
    fn on_adopt(
        &mut self,
        _parent: Option<String>,
        _ctx: &mut Ctx,
    ) -> Result<Step, ProtocolError> {
        Ok(Step::Continue)
    }
}
