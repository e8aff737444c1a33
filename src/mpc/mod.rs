//! The MPC primitive library.
//!
//! Every primitive follows one shape: an **initiator** on the agent that
//! wants the computation broadcasts a typed request; every participant (the
//! initiator included, via the transport's local fast path) runs a
//! **responder** that performs the local share operation, stores the result
//! under the requested output key, and acks; the initiator counts acks to
//! the participant count and then reports to its listener. Composite
//! primitives (dot product, comparisons, the zero test, the tournaments)
//! never touch shares themselves: they only sequence child primitives.
//!
//! Output keys are always chosen by the caller up front, so completion
//! carries no data except for reconstructions, which hand the initiator the
//! recovered plaintext.

pub mod arithmetic;
pub mod compare;
pub mod distribute;
pub mod minmax;
pub mod multiply;
pub mod reconstruct;

/// Storage key of the sticky multiplication mask share.
pub const R_KEY: &str = "r-key";

/// Storage key of bit `b` of the multiplication mask (bit 0 is the LSB).
pub fn r_key_bit(b: usize) -> String {
    format!("r-key[{b}]")
}

/// Key of entry `i` of the vector stored under `base`.
pub fn vector_key(base: &str, i: usize) -> String {
    format!("{base}[{i}]")
}
