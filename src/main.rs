use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pceas::options::SimulatorOptions;
use pceas::simulator::Simulator;

/// Simulator for secure multi-party circuit evaluation (CEPS / CEAS).
#[derive(Debug, Parser)]
#[command(name = "pceas")]
struct Args {
    /// Path to the options file.
    options: PathBuf,

    /// Dump per-step messages and per-party commitment tables.
    #[arg(short, long)]
    verbose: bool,

    /// Base seed for the party RNGs; omit for entropy seeding.
    #[arg(long)]
    seed: Option<u64>,

    /// Simulated length of one communication round in milliseconds.
    #[arg(long, default_value = "0")]
    round_length_ms: u64,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = match SimulatorOptions::from_path(&args.options) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let mut sim = Simulator::new(options).with_round_length(Duration::from_millis(args.round_length_ms));
    if let Some(seed) = args.seed {
        sim = sim.with_seed(seed);
    }

    match sim.run() {
        Ok(_) => {
            println!("End");
        }
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    }
}
