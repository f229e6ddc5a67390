//! Command-line batch driver for the benchmark engine.
//!
//! Runs TaskSpec corpora against configured sessions, summarizes earlier runs,
//! and cleans result directories.

mod cli;
mod report;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use engine::exit_codes;
use engine::io::session::SessionError;

#[derive(Parser)]
#[command(name = "bench", version, about = "Benchmark batch driver for LLM agents")]
struct Cli {
    /// Fallback log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        #[arg(long, default_value = "bench.toml")]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one batch over a tasks directory.
    Run {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        logs: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rerun tasks that already have a result marker.
        #[arg(long)]
        force: bool,
    },
    /// Run every entry of a plan file in order.
    Plan {
        file: PathBuf,
        /// Config for entries that do not name their own.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show which tasks load and which are rejected.
    List {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Aggregate result markers and metadata under a logs directory.
    Report {
        #[arg(long)]
        logs: PathBuf,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete per-task result directories.
    Clean {
        #[arg(long)]
        logs: PathBuf,
        /// Only identities starting with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    engine::logging::init(&cli.log_level);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Init { config, force } => cli::init_config(&config, force),
        Command::Run {
            tasks,
            logs,
            config,
            force,
        } => cli::run_batch(&tasks, &logs, config.as_deref(), force),
        Command::Plan { file, config } => cli::run_plan(&file, config.as_deref()),
        Command::List { tasks, config } => cli::list_tasks(&tasks, config.as_deref()),
        Command::Report { logs, json } => cli::report(&logs, json),
        Command::Clean { logs, prefix } => cli::clean(&logs, prefix.as_deref()),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<SessionError>().is_some() {
        exit_codes::SESSION
    } else {
        exit_codes::INVALID
    }
}
