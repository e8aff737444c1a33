//! Round protocols: the barrier, the huddle, the one-time bootstrap, and
//! the PDSA / PMGM round state machines.
//!
//! Storage keys and protocol ids are derived from agent ids and round
//! numbers alone, so every participant can derive the id of any
//! sub-protocol from the parent's id plus local knowledge.

pub mod barrier;
pub mod bootstrap;
pub mod huddle;
pub mod pdsa;
pub mod pmgm;

use crate::runtime::AgentId;

/// Base key of agent `i`'s per-value cost vector; entry `x` lives at
/// `Wb_{i}[x]`.
pub fn wb_base(agent: AgentId) -> String {
    format!("Wb_{agent}")
}

/// Key of the share of agent `i`'s current value.
pub fn currval_key(agent: AgentId) -> String {
    format!("currValue_{agent}")
}

/// Key of the share of agent `i`'s minimum reachable cost.
pub fn mincost_key(agent: AgentId) -> String {
    format!("minCost_{agent}")
}

/// Key of the share of the value realizing agent `i`'s minimum cost.
pub fn bestvalue_key(agent: AgentId) -> String {
    format!("bestValue_{agent}")
}

/// Base key of agent `i`'s unit-vector encoding of its current value.
pub fn evec_base(agent: AgentId) -> String {
    format!("evec_{agent}")
}

/// Key of the share of agent `i`'s current cost.
pub fn curcost_key(agent: AgentId) -> String {
    format!("currentCost_{agent}")
}

/// Key of the share of agent `i`'s potential gain.
pub fn gain_key(agent: AgentId) -> String {
    format!("gain_{agent}")
}

/// Base key of agent `i`'s neighborhood-relevant gain vector; entry `j`
/// lives at `g_{i}[j]`.
pub fn g_base(agent: AgentId) -> String {
    format!("g_{agent}")
}

/// Key of the sticky topology indicator: a share of 1 iff the constraint
/// `(i, j)` is real.
pub fn n_key(i: AgentId, j: AgentId) -> String {
    format!("n_{i}_{j}")
}

/// Id of the end-of-round barrier.
pub fn barrier_id(round: usize) -> String {
    format!("barrier-r{round}")
}

/// Id of the bootstrap barrier run before round 0.
pub fn boot_barrier_id() -> String {
    "barrier-boot".to_string()
}

/// Id of the intra-round barrier PMGM uses once every agent's gain share is
/// in place.
pub fn gains_barrier_id(round: usize) -> String {
    format!("barrier-gains-r{round}")
}

/// Id of the round-`r` huddle, shared by all agents.
pub fn huddle_id(round: usize) -> String {
    format!("huddle-r{round}")
}
