use anyhow::{Context, Result};
use clap::Parser;
use privacy_dcop::cli_utils::RunArgs;
use privacy_dcop::problem::Problem;
use privacy_dcop::sim::{RunConfig, Simulation};
use std::fs::File;
use std::io::Write;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = RunArgs::parse();
    run(args)
}

fn run(args: RunArgs) -> Result<()> {
    let halting = args.halting().context("invalid halting configuration")?;

    let mut results = File::create(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    writeln!(
        results,
        "Iteration,Seed,Runtime_ms,TotalCost,MaxRounds,AgentValues"
    )?;

    let mut problems_out = if args.export_problems {
        let path = args.out.with_extension("problems.csv");
        let mut file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        writeln!(file, "Iteration,AgentI,AgentJ,Row,Costs")?;
        Some(file)
    } else {
        None
    };

    let mut completed = 0usize;
    for iteration in 0..args.iterations {
        let seed = args.base_seed + iteration as u64;
        let problem = args
            .build_problem(seed)
            .with_context(|| format!("generating problem for iteration {iteration}"))?;

        if let Some(file) = problems_out.as_mut() {
            export_problem(file, iteration, &problem)?;
        }

        let config = RunConfig {
            algorithm: args.algorithm.into(),
            base_seed: seed,
            stochastic: args.stochastic,
            halting,
            initial_value: None,
            paillier_bits: args.paillier_bits,
        };

        let outcome = Simulation::new(problem, &config).and_then(|mut sim| sim.run());
        match outcome {
            Ok(outcome) => {
                let max_rounds = outcome.rounds.iter().copied().max().unwrap_or(0);
                writeln!(
                    results,
                    "{},{},{},{},{},\"{:?}\"",
                    iteration,
                    seed,
                    outcome.runtime.as_millis(),
                    outcome.total_cost,
                    max_rounds,
                    outcome.values,
                )?;
                if args.verbose {
                    println!(
                        "iteration {iteration}: cost {} after {} rounds",
                        outcome.total_cost, max_rounds
                    );
                }
                completed += 1;
            }
            Err(err) => {
                eprintln!("iteration {iteration} aborted: {err:#}");
            }
        }
    }

    println!(
        "{completed}/{} iterations completed, results in {}",
        args.iterations,
        args.out.display()
    );
    Ok(())
}

fn export_problem(file: &mut File, iteration: usize, problem: &Problem) -> Result<()> {
    for i in problem.agents() {
        for j in problem.agents() {
            if i < j && problem.is_connected(i, j) {
                let matrix = problem.cost_matrix(i, j);
                for (row, costs) in matrix.iter().enumerate() {
                    let joined = costs
                        .iter()
                        .map(u64::to_string)
                        .collect::<Vec<_>>()
                        .join(";");
                    writeln!(file, "{iteration},{i},{j},{row},{joined}")?;
                }
            }
        }
    }
    Ok(())
}
