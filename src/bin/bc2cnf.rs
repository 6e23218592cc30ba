use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use bc2cnf::circuit::Circuit;
use bc2cnf::cnf::{self, Prepared, TranslateOpts};
use bc2cnf::parse;

/// Translate a Boolean constraint circuit into a CNF formula in the DIMACS
/// format.
#[derive(Parser)]
#[command(name = "bc2cnf", version)]
struct Cli {
    /// Input circuit file (stdin if omitted)
    circuit: Option<PathBuf>,

    /// Output CNF file (stdout if omitted)
    cnf: Option<PathBuf>,

    /// Verbose diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Preserve all satisfying assignments, not only satisfiability
    #[arg(long)]
    all: bool,

    /// Skip the simplifier (structural sharing still runs)
    #[arg(long)]
    nosimplify: bool,

    /// Include every gate in the CNF, not only the cone of influence
    #[arg(long)]
    nocoi: bool,

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

fn read_input(path: &Option<PathBuf>) -> anyhow::Result<String> {
    match path {
        Some(p) => fs::read_to_string(p).with_context(|| format!("reading {}", p.display())),
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            Ok(text)
        }
    }
}

fn open_output(path: &Option<PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    match path {
        Some(p) => {
            let f = fs::File::create(p).with_context(|| format!("creating {}", p.display()))?;
            Ok(Box::new(BufWriter::new(f)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
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
            eprintln!("bc2cnf: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let text = read_input(&cli.circuit)?;
    let mut circuit: Circuit = parse::parse_circuit(&text).context("parsing the circuit")?;
    info!(gates = circuit.count_gates(), "circuit parsed");
    if cli.print_inputs {
        info!("input gates: {}", circuit.input_gate_names().join(" "));
    }

    let mut out = open_output(&cli.cnf)?;

    if circuit.apply_assignments().is_err() {
        info!("contradictory assignments; the circuit is unsatisfiable");
        cnf::write_trivial_unsat(&mut out)?;
        return Ok(());
    }
    circuit.remove_underscore_names();

    let opts = TranslateOpts {
        simplify: !cli.nosimplify,
        coi: !cli.nocoi,
        notless: !cli.nots,
        polarity: cli.polarity_cnf,
        preserve_all: cli.all,
        permute_seed: cli.permute_cnf,
    };
    match cnf::prepare(&mut circuit, &opts) {
        Err(_) => {
            info!("the circuit is unsatisfiable");
            cnf::write_trivial_unsat(&mut out)?;
        }
        Ok(Prepared::TriviallySat) => {
            info!("the circuit was decided during translation");
            cnf::write_trivial_sat(&circuit, &mut out)?;
        }
        Ok(Prepared::Cnf(numbering)) => {
            cnf::write_dimacs(&circuit, &numbering, &opts, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}
