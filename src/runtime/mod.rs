//! Protocol runtime: typed in-process messages, the transport abstraction,
//! the per-agent dispatcher and the protocol state-machine contract.
//!
//! Everything an agent does happens through protocol instances registered
//! with its [dispatcher::Dispatcher]; the dispatcher is the single point of
//! entry for all cross-instance delivery.

pub mod dispatcher;
pub mod message;
pub mod protocol;
pub mod transport;

/// Agent identifier. Agents are numbered `1..=N`; the id doubles as the
/// Shamir evaluation index of the shares the agent holds.
pub type AgentId = usize;

/// Storage tag scoping an entry to one round.
pub fn round_tag(round: usize) -> String {
    format!("round-{round}")
}
