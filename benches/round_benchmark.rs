use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::{criterion_group, criterion_main};
use privacy_dcop::agent::Algorithm;
use privacy_dcop::problem::Problem;
use privacy_dcop::sim::{Halting, RunConfig, Simulation};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn run_iteration(algorithm: Algorithm, num_agents: usize, rounds: usize) {
    let mut rng = StdRng::seed_from_u64(1);
    let problem = Problem::random(num_agents, 3, 0.5, 50, &mut rng).unwrap();
    let config = RunConfig {
        algorithm,
        base_seed: 1,
        stochastic: 1.0,
        halting: Halting::Rounds(rounds),
        initial_value: None,
        paillier_bits: 128,
    };
    let mut sim = Simulation::new(problem, &config).unwrap();
    sim.run().unwrap();
}

fn bench_pdsa(c: &mut Criterion) {
    let mut group = c.benchmark_group("pdsa_round_time");
    for num_agents in [3, 5, 7] {
        group.bench_with_input(
            BenchmarkId::new("agents", num_agents),
            &num_agents,
            |b, &n| b.iter(|| run_iteration(Algorithm::Pdsa, n, 1)),
        );
    }
    group.finish();
}

fn bench_pmgm(c: &mut Criterion) {
    let mut group = c.benchmark_group("pmgm_round_time");
    group.sample_size(10);
    for num_agents in [3, 5] {
        group.bench_with_input(
            BenchmarkId::new("agents", num_agents),
            &num_agents,
            |b, &n| b.iter(|| run_iteration(Algorithm::Pmgm, n, 1)),
        );
    }
    group.finish();
}

fn bench_pmaxsum(c: &mut Criterion) {
    let mut group = c.benchmark_group("pmaxsum_round_time");
    group.sample_size(10);
    for num_agents in [3, 5] {
        group.bench_with_input(
            BenchmarkId::new("agents", num_agents),
            &num_agents,
            |b, &n| b.iter(|| run_iteration(Algorithm::Pmaxsum, n, 4)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pdsa, bench_pmgm, bench_pmaxsum);
criterion_main!(benches);
