//! CLI command implementations. Each returns the process exit code.

use std::path::Path;

use anyhow::{Context, Result, bail};
use engine::batch::{self, BatchParams};
use engine::core::types::Counter;
use engine::exit_codes;
use engine::io::config::{BenchConfig, load_config, load_plan, write_config};
use engine::io::recorder::clean_records;
use engine::io::session::{SessionError, SessionRegistry};
use engine::io::task_spec::load_corpus;
use tracing::{debug, info};

use crate::report::aggregate;

fn bench_config(path: Option<&Path>) -> Result<BenchConfig> {
    let cfg = match path {
        Some(path) => load_config(path)?,
        None => {
            debug!("no config given, using defaults");
            BenchConfig::default()
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Write the default config to `path`.
pub fn init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", path.display());
    }
    write_config(path, &BenchConfig::default())?;
    println!("init: config={}", path.display());
    Ok(exit_codes::OK)
}

/// Run a single batch.
pub fn run_batch(tasks: &Path, logs: &Path, config: Option<&Path>, force: bool) -> Result<i32> {
    let mut config = bench_config(config)?;
    if force {
        config.run.resume = false;
    }
    info!(tasks = %tasks.display(), logs = %logs.display(), resume = config.run.resume, "starting batch");
    let outcome = batch::run_batch(&BatchParams {
        tasks: tasks.to_path_buf(),
        logs: logs.to_path_buf(),
        config,
    })?;
    println!("run: {}", outcome.counter);
    println!(
        "run: rejected={} summary={}",
        outcome.rejected,
        outcome.summary_path.display()
    );
    Ok(exit_codes::OK)
}

/// Run every plan entry; the exit code reflects the worst failing entry.
pub fn run_plan(file: &Path, config: Option<&Path>) -> Result<i32> {
    let plan = load_plan(file)?;
    let default_config = bench_config(config)?;
    let outcomes = batch::run_plan(&plan, &default_config);

    let mut code = exit_codes::OK;
    let mut total = Counter::default();
    for (index, entry) in outcomes.iter().enumerate() {
        match &entry.result {
            Ok(outcome) => {
                total.absorb(&outcome.counter);
                println!(
                    "plan: entry={} tasks={} {}",
                    index,
                    entry.tasks.display(),
                    outcome.counter
                );
            }
            Err(err) => {
                println!(
                    "plan: entry={} tasks={} failed: {:#}",
                    index,
                    entry.tasks.display(),
                    err
                );
                let entry_code = if err.downcast_ref::<SessionError>().is_some() {
                    exit_codes::SESSION
                } else {
                    exit_codes::INVALID
                };
                code = code.max(entry_code);
            }
        }
    }
    println!("plan: entries={} {}", outcomes.len(), total);
    Ok(code)
}

/// Print accepted tasks with their session key, then rejected ones with the reason.
pub fn list_tasks(tasks: &Path, config: Option<&Path>) -> Result<i32> {
    let config = bench_config(config)?;
    let registry = SessionRegistry::from_config(&config);
    let corpus = load_corpus(tasks, |spec| registry.admit(spec))
        .with_context(|| format!("load tasks from {}", tasks.display()))?;
    for spec in &corpus.accepted {
        println!("{}\t{}\tsteps={}", spec.identity, spec.key, spec.step_budget);
    }
    for rejection in &corpus.rejected {
        println!("rejected\t{}\t{}", rejection.identity, rejection.reason);
    }
    Ok(exit_codes::OK)
}

/// Summarize a logs directory.
pub fn report(logs: &Path, json: bool) -> Result<i32> {
    let (summary, warnings) = aggregate(logs)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize report")?
        );
    } else {
        let overall = &summary.overall;
        println!(
            "report: tasks={} passed={} failed={} errored={}",
            overall.total(),
            overall.passed,
            overall.failed,
            overall.errored
        );
        if let Some(avg) = overall.avg_duration_ms {
            println!("report: avg_duration_secs={:.2}", avg / 1000.0);
        }
        for (kind, stats) in &summary.kinds {
            let avg = stats
                .avg_duration_ms
                .map(|avg| format!("{:.2}", avg / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "report: kind {} {}/{} passed, {} errored, avg_duration_secs={}",
                kind,
                stats.passed,
                stats.total(),
                stats.errored,
                avg
            );
        }
    }
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(exit_codes::OK)
}

/// Remove task result directories, optionally limited to an identity prefix.
pub fn clean(logs: &Path, prefix: Option<&str>) -> Result<i32> {
    let removed = clean_records(logs, prefix)?;
    for identity in &removed {
        debug!(task = %identity, "removed");
    }
    println!(
        "clean: logs={} removed={}",
        logs.display(),
        removed.len()
    );
    Ok(exit_codes::OK)
}
