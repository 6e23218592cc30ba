use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use bc2cnf::cnf::TranslateOpts;
use bc2cnf::parse;
use bc2cnf::solve::{solve, SolveResult};

/// Decide the satisfiability of a Boolean constraint circuit with the
/// embedded SAT solver.
#[derive(Parser)]
#[command(name = "bcsat", version)]
struct Cli {
    /// Input circuit file (stdin if omitted)
    circuit: Option<PathBuf>,

    /// Verbose diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Preserve all satisfying assignments, not only satisfiability
    #[arg(long)]
    all: bool,

    /// Skip the simplifier (structural sharing still runs)
    #[arg(long)]
    nosimplify: bool,

    /// Do not print a satisfying truth assignment
    #[arg(long)]
    nosolution: bool,

    /// Standard Tseitin translation with variables for NOT gates
    #[arg(long)]
    nots: bool,

    /// Plaisted-Greenbaum polarity encoding
    #[arg(long = "polarity-cnf")]
    polarity_cnf: bool,

    /// Permute the CNF variable indices with the given seed
    #[arg(long = "permute-cnf", value_name = "SEED")]
    permute_cnf: Option<u32>,

    /// List the input gate names in the verbose stream
    #[arg(long = "print-inputs")]
    print_inputs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "info" } else { "warn" })
        .with_target(false)
        .init();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bcsat: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let text = match &cli.circuit {
        Some(p) => fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?,
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            text
        }
    };
    let mut circuit = parse::parse_circuit(&text).context("parsing the circuit")?;
    info!(gates = circuit.count_gates(), "circuit parsed");
    if cli.print_inputs {
        info!("input gates: {}", circuit.input_gate_names().join(" "));
    }

    if circuit.apply_assignments().is_err() {
        println!("Unsatisfiable");
        return Ok(());
    }
    circuit.remove_underscore_names();

    let opts = TranslateOpts {
        simplify: !cli.nosimplify,
        coi: true,
        notless: !cli.nots,
        polarity: cli.polarity_cnf,
        preserve_all: cli.all,
        permute_seed: cli.permute_cnf,
    };
    match solve(&mut circuit, &opts) {
        SolveResult::Unsat => println!("Unsatisfiable"),
        SolveResult::Sat(assignment) => {
            println!("Satisfiable");
            if !cli.nosolution {
                for (name, value) in assignment {
                    println!("{} := {}", name, if value { "T" } else { "F" });
                }
            }
        }
    }
    Ok(())
}
