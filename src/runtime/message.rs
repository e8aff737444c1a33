//! In-process protocol messages.
//!
//! Messages are native typed records, not bytes: the transport never leaves
//! the process. Every message carries the id of the protocol instance it
//! belongs to, the protocol type (so a responder can be built on demand for
//! an id the receiver has never seen), the sender, and a typed payload.

use crate::maxsum::MaxsumPayload;
use crate::mpc::arithmetic::LocalOp;
use crate::runtime::AgentId;
use crate::share::Share;

/// Protocol type tag, used to pick the responder factory for messages that
/// arrive for an unknown instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Shamir-share a plaintext value to all participants.
    Distribute,
    /// Shamir-share a vector, entry by entry.
    VectorDistribute,
    /// Collect shares and interpolate the plaintext at the initiator.
    Reconstruct,
    /// A share-local operation (add, sub, scalar multiply, ...).
    LocalOp,
    /// Degree-reducing share multiplication.
    Multiply,
    /// Dot product of two shared vectors.
    DotProduct,
    /// Least significant bit of a shared value.
    Lsb,
    /// Public value vs. bit-shared value comparison.
    BitCompare,
    /// Test whether a shared value is at least p/2.
    HalfPrimeCompare,
    /// Strict less-than on two shared values.
    Compare,
    /// Zero test on a shared value.
    IsZero,
    /// Tournament minimum over a shared vector.
    FindMin,
    /// Tournament maximum over a shared vector.
    FindMax,
    /// All-agent rendezvous.
    Barrier,
    /// Cost-contribution exchange at the start of a round.
    Huddle,
    /// One-time distribution of the sticky bootstrap secrets.
    Bootstrap,
    /// One PDSA round.
    PdsaRound,
    /// One PMGM round.
    PmgmRound,
    /// One PMAXSUM round.
    MaxsumRound,
    /// PMAXSUM final-round masked-argmin exchange.
    MaxsumFinal,
}

/// A protocol message.
#[derive(Clone, Debug)]
pub struct Message {
    /// Instance id, globally unique per initiator invocation (shared-id
    /// protocols such as the barrier and the huddle use one id per round).
    pub protocol_id: String,
    /// Protocol type.
    pub kind: ProtocolKind,
    /// Sending agent.
    pub sender: AgentId,
    /// Route to the receiver-side responder instance instead of the
    /// initiator registered under `protocol_id`.
    pub to_responder: bool,
    /// Marks acks and replies addressed to an initiator that may already be
    /// gone; such messages are dropped quietly instead of warning.
    pub is_completion: bool,
    /// Type-specific payload.
    pub payload: Payload,
}

impl Message {
    /// A request from an initiator to the responders on every participant.
    pub fn request(protocol_id: &str, kind: ProtocolKind, sender: AgentId, payload: Payload) -> Self {
        Self {
            protocol_id: protocol_id.to_string(),
            kind,
            sender,
            to_responder: true,
            is_completion: false,
            payload,
        }
    }

    /// An ack or data reply addressed back to the initiator.
    pub fn reply(protocol_id: &str, kind: ProtocolKind, sender: AgentId, payload: Payload) -> Self {
        Self {
            protocol_id: protocol_id.to_string(),
            kind,
            sender,
            to_responder: false,
            is_completion: true,
            payload,
        }
    }

    /// Traffic of a shared-id protocol (barrier, huddle, round instances):
    /// routed to the instance itself on every agent.
    pub fn shared(protocol_id: &str, kind: ProtocolKind, sender: AgentId, payload: Payload) -> Self {
        Self {
            protocol_id: protocol_id.to_string(),
            kind,
            sender,
            to_responder: false,
            is_completion: false,
            payload,
        }
    }
}

/// Typed message payloads. Field elements travel as `u64`.
#[derive(Clone, Debug)]
pub enum Payload {
    /// One participant's share of a distributed value.
    DistributeShare {
        /// Storage key to file the share under.
        key: String,
        /// The receiving participant's share.
        share: Share,
        /// Store sticky instead of tagged.
        sticky: bool,
    },
    /// Ask each peer for its share of `key`.
    ReconstructRequest {
        /// Storage key of the shares to collect.
        key: String,
    },
    /// A peer's share sent back for reconstruction.
    ReconstructShare {
        /// The peer's share.
        share: Share,
    },
    /// Perform a share-local operation and store it under `out`.
    LocalOpRequest {
        /// The operation to apply.
        op: LocalOp,
        /// Output storage key.
        out: String,
    },
    /// Start a multiplication: compute the masked local product of `a`, `b`.
    MultiplyRequest {
        /// Storage key of the left factor.
        a: String,
        /// Storage key of the right factor.
        b: String,
    },
    /// A peer's masked degree-doubled product share.
    MaskedProduct {
        /// The masked product share.
        share: Share,
    },
    /// Publicly reconstructed masked product; peers unmask locally.
    Unmask {
        /// The revealed value of `a*b + r`.
        masked: u64,
        /// Output storage key for the unmasked product share.
        out: String,
    },
    /// Completion ack carrying no data.
    Ack,
    /// A huddle cost-contribution slice: the receiver's shares of the
    /// sender's per-value cost row toward `target`.
    HuddleContribution {
        /// Round the contribution belongs to.
        round: usize,
        /// Agent whose work-benefit vector this contributes to.
        target: AgentId,
        /// The receiver's share of each of the M row entries.
        entries: Vec<Share>,
    },
    /// Barrier signal for `round`.
    BarrierSignal {
        /// Round being signalled complete.
        round: usize,
    },
    /// PMAXSUM traffic.
    Maxsum(MaxsumPayload),
}
