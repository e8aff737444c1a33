//! Message transport between agents.
//!
//! The [Transport] trait is the only way protocol code reaches other agents.
//! Self-addressed messages take the local fast path: they are handed to a
//! callback the agent installs and never touch the stepper's queues, which
//! keeps round accounting and completion counting uniform between the
//! initiator and remote responders.
//!
//! [SimTransport] is the in-process implementation over the simulation's
//! per-ordered-pair FIFO queues; [create_network] builds the full mesh for a
//! set of agents.

use crate::error::ProtocolError;
use crate::runtime::message::Message;
use crate::runtime::AgentId;
use itertools::Itertools;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Callback receiving self-addressed messages.
pub type LocalCallback = Box<dyn FnMut(Message)>;

/// Agent-side view of the message fabric.
pub trait Transport {
    /// Id of the owning agent.
    fn local_id(&self) -> AgentId;

    /// All peers, sorted, excluding the local agent.
    fn neighbors(&self) -> Vec<AgentId>;

    /// All participants, sorted, including the local agent.
    fn participants(&self) -> Vec<AgentId>;

    /// Send one message. Self-sends are delivered synchronously through the
    /// local callback when one is installed; unknown recipients fail loudly.
    fn send(&mut self, msg: Message, to: AgentId) -> Result<(), ProtocolError>;

    /// Send a copy of `msg` to each listed recipient.
    fn multicast(&mut self, msg: &Message, to: &[AgentId]) -> Result<(), ProtocolError> {
        for &a in to {
            self.send(msg.clone(), a)?;
        }
        Ok(())
    }

    /// Send a copy of `msg` to every participant, the local agent included.
    fn broadcast(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        let all = self.participants();
        self.multicast(msg, &all)
    }

    /// Install the local fast-path callback.
    fn set_local_callback(&mut self, cb: LocalCallback);
}

/// The simulation's message fabric: one FIFO queue per ordered agent pair.
///
/// Sends land in the `next` generation; [Network::advance] promotes them for
/// delivery, so a message sent during tick `T` is delivered at `T + 1` and
/// per-pair order is preserved.
pub struct Network {
    ids: Vec<AgentId>,
    current: HashMap<(AgentId, AgentId), VecDeque<Message>>,
    next: HashMap<(AgentId, AgentId), VecDeque<Message>>,
}

impl Network {
    /// Build the fabric for the given agents.
    pub fn new(ids: &[AgentId]) -> Self {
        Self {
            ids: ids.iter().copied().sorted().collect(),
            current: HashMap::new(),
            next: HashMap::new(),
        }
    }

    /// The participating agents, sorted.
    pub fn ids(&self) -> &[AgentId] {
        &self.ids
    }

    fn enqueue(&mut self, from: AgentId, to: AgentId, msg: Message) -> Result<(), ProtocolError> {
        if !self.ids.contains(&to) {
            return Err(ProtocolError::UnreachableRecipient { agent: to });
        }
        self.next.entry((from, to)).or_default().push_back(msg);
        Ok(())
    }

    /// Promote pending sends into the deliverable generation.
    pub fn advance(&mut self) {
        for (pair, mut queue) in std::mem::take(&mut self.next) {
            self.current.entry(pair).or_default().append(&mut queue);
        }
    }

    /// Drain every deliverable message addressed to `to`, senders in sorted
    /// order, FIFO within each sender.
    pub fn drain_to(&mut self, to: AgentId) -> Vec<(AgentId, Message)> {
        let mut out = Vec::new();
        for &from in &self.ids {
            if let Some(queue) = self.current.get_mut(&(from, to)) {
                out.extend(queue.drain(..).map(|m| (from, m)));
            }
        }
        out
    }

    /// Whether any message is deliverable or pending.
    pub fn is_idle(&self) -> bool {
        self.current.values().all(VecDeque::is_empty)
            && self.next.values().all(VecDeque::is_empty)
    }
}

/// [Transport] implementation over a shared [Network].
pub struct SimTransport {
    me: AgentId,
    net: Rc<RefCell<Network>>,
    local: Option<LocalCallback>,
}

impl SimTransport {
    /// Transport endpoint for agent `me`.
    pub fn new(me: AgentId, net: Rc<RefCell<Network>>) -> Self {
        Self {
            me,
            net,
            local: None,
        }
    }
}

impl Transport for SimTransport {
    fn local_id(&self) -> AgentId {
        self.me
    }

    fn neighbors(&self) -> Vec<AgentId> {
        self.net
            .borrow()
            .ids()
            .iter()
            .copied()
            .filter(|&a| a != self.me)
            .collect()
    }

    fn participants(&self) -> Vec<AgentId> {
        self.net.borrow().ids().to_vec()
    }

    fn send(&mut self, msg: Message, to: AgentId) -> Result<(), ProtocolError> {
        if to == self.me {
            if let Some(cb) = self.local.as_mut() {
                cb(msg);
                return Ok(());
            }
        }
        self.net.borrow_mut().enqueue(self.me, to, msg)
    }

    fn set_local_callback(&mut self, cb: LocalCallback) {
        self.local = Some(cb);
    }
}

/// Build a [Network] plus one [SimTransport] endpoint per agent.
pub fn create_network(ids: &[AgentId]) -> (Rc<RefCell<Network>>, Vec<SimTransport>) {
    let net = Rc::new(RefCell::new(Network::new(ids)));
    let transports = ids
        .iter()
        .sorted()
        .map(|&a| SimTransport::new(a, Rc::clone(&net)))
        .collect();
    (net, transports)
}
