//! CLI (CommandLine Interface) utilities for the batch driver.
//!
//! Here you can see the knobs of a run through enum types and the args
//! struct. See the algorithm modules for what the options actually do.

use crate::agent::Algorithm;
use crate::error::ProtocolError;
use crate::problem::Problem;
use crate::sim::Halting;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

/// Algorithm selection tag.
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum AlgorithmArg {
    /// Privacy-preserving distributed stochastic algorithm.
    Pdsa,
    /// Privacy-preserving maximum gain messaging.
    Pmgm,
    /// Privacy-preserving Max-Sum (Paillier).
    Pmaxsum,
}

impl Display for AlgorithmArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgorithmArg::Pdsa => write!(f, "pdsa"),
            AlgorithmArg::Pmgm => write!(f, "pmgm"),
            AlgorithmArg::Pmaxsum => write!(f, "pmaxsum"),
        }
    }
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Pdsa => Algorithm::Pdsa,
            AlgorithmArg::Pmgm => Algorithm::Pmgm,
            AlgorithmArg::Pmaxsum => Algorithm::Pmaxsum,
        }
    }
}

/// Constraint-graph generators.
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum TopologyArg {
    /// Erdős–Rényi: every pair constrained with the configured density.
    Random,
    /// Barabási–Albert preferential attachment.
    ScaleFree,
}

impl Display for TopologyArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyArg::Random => write!(f, "random"),
            TopologyArg::ScaleFree => write!(f, "scale-free"),
        }
    }
}

/// Arguments of the batch driver.
/// This struct implements [clap::Parser] to make the binary take
/// CommandLine arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, next_line_help = true)]
pub struct RunArgs {
    /// Number of agents.
    #[arg(short = 'N', long, default_value_t = 5)]
    pub num_agents: usize,

    /// Size of each agent's value domain.
    #[arg(short = 'M', long, default_value_t = 3)]
    pub domain_size: usize,

    /// Constraint density for the random topology.
    #[arg(short = 'd', long, default_value_t = 0.4)]
    pub density: f64,

    /// Attachment degree for the scale-free topology.
    #[arg(long, default_value_t = 2)]
    pub attach: usize,

    /// Largest constraint cost the generator draws.
    #[arg(long, default_value_t = 100)]
    pub max_cost: u64,

    /// Topology generator.
    #[arg(short = 't', long = "topology", default_value_t = TopologyArg::Random)]
    pub topology: TopologyArg,

    /// Algorithm to run.
    #[arg(short = 'a', long = "algorithm", default_value_t = AlgorithmArg::Pdsa)]
    pub algorithm: AlgorithmArg,

    /// Number of iterations in the batch.
    #[arg(short = 'i', long, default_value_t = 10)]
    pub iterations: usize,

    /// Base seed; iteration k runs with base_seed + k.
    #[arg(short = 's', long, default_value_t = 42)]
    pub base_seed: u64,

    /// Rounds per iteration; 0 switches to the wall-clock budget.
    #[arg(short = 'r', long, default_value_t = 50)]
    pub last_round: usize,

    /// Wall-clock budget per iteration in milliseconds, used when
    /// last_round is 0.
    #[arg(long, default_value_t = 0)]
    pub timeout_ms: u64,

    /// PDSA activity probability.
    #[arg(long, default_value_t = 0.7)]
    pub stochastic: f64,

    /// Paillier modulus width for PMAXSUM.
    #[arg(long, default_value_t = 512)]
    pub paillier_bits: u64,

    /// Results CSV path.
    #[arg(short = 'o', long, default_value = "results.csv")]
    pub out: PathBuf,

    /// Also export each iteration's cost matrices next to the results.
    #[arg(long, default_value_t = false)]
    pub export_problems: bool,

    /// Print each iteration's result.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

impl RunArgs {
    /// The halting mode the arguments select.
    pub fn halting(&self) -> Result<Halting, ProtocolError> {
        if self.last_round > 0 {
            Ok(Halting::Rounds(self.last_round))
        } else if self.timeout_ms > 0 {
            Ok(Halting::Timeout(Duration::from_millis(self.timeout_ms)))
        } else {
            Err(ProtocolError::Config(
                "either last_round or timeout_ms must be positive".into(),
            ))
        }
    }

    /// Generate iteration `k`'s problem instance from its seed.
    pub fn build_problem(&self, seed: u64) -> Result<Problem, ProtocolError> {
        let mut rng = StdRng::seed_from_u64(seed);
        match self.topology {
            TopologyArg::Random => Problem::random(
                self.num_agents,
                self.domain_size,
                self.density,
                self.max_cost,
                &mut rng,
            ),
            TopologyArg::ScaleFree => Problem::random_scale_free(
                self.num_agents,
                self.domain_size,
                self.attach,
                self.max_cost,
                &mut rng,
            ),
        }
    }
}
