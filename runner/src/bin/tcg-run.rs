//! Run one instrumentation plugin over a guest program.
//!
//! # Usage
//!
//! ```bash
//! # Hamming-weight leakage of every instruction
//! tcg-run --program prog.json --plugin sca-hw
//!
//! # Stop after 1000 instructions with exit code 3, saving a snapshot first
//! tcg-run --program prog.json --plugin stoptrigger \
//!     -o icount=1000:3 -o savevm=snap --snapshot-dir snapshots
//!
//! # Four vCPUs on their own threads
//! tcg-run --program prog.json --plugin sca-hw --vcpus 4 --threaded --system
//! ```
//!
//! Plugin output goes to stdout, diagnostics to stderr (`RUST_LOG`).

use clap::Parser;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process;
use tcg_plugin_api::sim::Scheduling;
use tcg_plugin_api::ConfigError;
use tcg_runner::{run_with_output, RunOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tcg-run")]
#[command(about = "Drive a TCG instrumentation plugin over a simulated guest")]
#[command(version)]
struct Cli {
    /// Guest program description (JSON).
    #[arg(short, long)]
    program: PathBuf,

    /// Plugin to install: sca-hw, stoptrigger, skipinsn or execlog.
    #[arg(long)]
    plugin: String,

    /// Plugin option in key=value form; may be repeated.
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Number of vCPUs.
    #[arg(long, default_value = "1")]
    vcpus: usize,

    /// Run every vCPU on its own thread instead of round robin.
    #[arg(long)]
    threaded: bool,

    /// Report system emulation to the plugin.
    #[arg(long)]
    system: bool,

    /// Per-vCPU instruction budget (0 = unlimited).
    #[arg(long, default_value = "1000000")]
    max_insns: u64,

    /// Directory receiving snapshots saved during the run.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = RunOptions {
        program: cli.program,
        plugin: cli.plugin,
        args: cli.options,
        vcpus: cli.vcpus,
        scheduling: if cli.threaded {
            Scheduling::Threaded
        } else {
            Scheduling::RoundRobin
        },
        max_insns: (cli.max_insns != 0).then_some(cli.max_insns),
        system_emulation: cli.system,
        snapshot_dir: cli.snapshot_dir,
    };

    let report = match run_with_output(&options, BufWriter::new(io::stdout())) {
        Ok(report) => report,
        Err(err) => {
            if err.downcast_ref::<ConfigError>().is_some() {
                eprintln!("{}: {:#}", options.plugin, err);
            } else {
                eprintln!("Error: {:#}", err);
            }
            process::exit(1);
        }
    };

    process::exit(report.exit_code());
}
