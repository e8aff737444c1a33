//! Error taxonomy of the protocol core.
//!
//! Every error below is fatal for the iteration that raises it: primitives
//! and round protocols never recover on their own, they surface a
//! [ProtocolError] and the embedding aborts the iteration. Stale callbacks
//! (a sub-protocol reporting into a phase that no longer expects it) are not
//! errors and are merely logged at debug level by the protocols themselves.

use crate::runtime::AgentId;

/// Fatal conditions raised by the protocol engine.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Bad startup parameters (unknown algorithm, zero participants, empty
    /// domain, prime/bit-count mismatch).
    #[error("configuration error: {0}")]
    Config(String),

    /// A protocol asked storage for a share that is not there. Always an
    /// orchestration bug, never a recoverable condition.
    #[error("missing share '{key}' on agent {agent} in round {round}")]
    MissingShare {
        /// Storage key that was requested.
        key: String,
        /// Agent whose storage was queried.
        agent: AgentId,
        /// Round the agent was in at the time.
        round: usize,
    },

    /// A sub-protocol or contribution reported a round number that does not
    /// match its parent. Indicates id-generation or dispatch corruption.
    #[error("protocol '{protocol}' expected round {expected}, got {got}")]
    WrongRound {
        /// Round the receiving instance lives in.
        expected: usize,
        /// Round carried by the offending message or callback.
        got: usize,
        /// Id of the instance that noticed the mismatch.
        protocol: String,
    },

    /// Lagrange interpolation could not be carried out.
    #[error("reconstruction failed: {0}")]
    Reconstruction(String),

    /// A modular inverse does not exist (gcd != 1).
    #[error("no inverse of {value} modulo {modulus}")]
    NoInverse {
        /// Element whose inverse was requested.
        value: u64,
        /// Modulus used.
        modulus: u64,
    },

    /// The transport has no route to a participant.
    #[error("unreachable recipient {agent}")]
    UnreachableRecipient {
        /// The agent the message was addressed to.
        agent: AgentId,
    },
}
