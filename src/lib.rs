//! # Privacy-preserving DCOP runtime
//!
//! A framework in which N cooperating agents, each holding only its local
//! slice of a joint cost function, converge toward a low-cost global
//! assignment without any agent learning another's private constraint
//! costs.
//!
//! Three subsystems make up the core:
//!
//! - an MPC protocol engine over Shamir secret sharing ([mpc], [shamir],
//!   [share], [storage]) composing primitives into higher-level operators
//!   through a uniform initiator/responder pattern;
//! - the privacy-preserving round protocols PDSA and PMGM ([rounds]) plus
//!   the Paillier-based PMAXSUM ([maxsum], [paillier]), synchronized by a
//!   barrier between rounds;
//! - the per-agent protocol dispatcher and transport ([runtime]) that
//!   multiplex every concurrent protocol instance and route messages,
//!   driven by the discrete-event stepper in [sim].
//!
//! The protocols assume honest-but-curious participants; there is no
//! malicious-security layer. [agent] ties everything together per agent,
//! and the `dcop` binary batches iterations over randomly generated
//! problems ([problem], [cli_utils]).
#![warn(missing_docs)]

pub mod agent;
pub mod cli_utils;
pub mod error;
pub mod field;
pub mod maxsum;
pub mod mpc;
pub mod paillier;
pub mod problem;
pub mod rounds;
pub mod runtime;
pub mod shamir;
pub mod share;
pub mod sim;
pub mod storage;
