//! Batch driver: load a corpus, schedule it, and write the batch summary.
//!
//! [`run_plan`] runs several batches in sequence; a failing entry is logged
//! and the next one still runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument};

use crate::agent::{Agent, AgentSettings};
use crate::core::types::Counter;
use crate::io::config::{BenchConfig, Plan, load_config};
use crate::io::model::{ModelEndpoint, OpenAiEndpoint};
use crate::io::prompt::PromptEngine;
use crate::io::recorder::{BatchSummary, FsRecorder, ResultRecorder, write_summary};
use crate::io::session::SessionRegistry;
use crate::io::task_spec::load_corpus;
use crate::scheduler::{Scheduler, SchedulerSettings};

/// Inputs of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchParams {
    pub tasks: PathBuf,
    pub logs: PathBuf,
    pub config: BenchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub counter: Counter,
    pub rejected: usize,
    pub summary_path: PathBuf,
}

/// Run one batch against the configured sessions and model.
pub fn run_batch(params: &BatchParams) -> Result<BatchOutcome> {
    params.config.validate()?;
    let mut registry = SessionRegistry::from_config(&params.config);
    let endpoint = OpenAiEndpoint::from_config(&params.config.model)?;
    let mut recorder = FsRecorder::new(&params.logs);
    run_batch_with(params, &mut registry, endpoint, &mut recorder)
}

/// Run one batch with caller-supplied sessions, endpoint, and recorder.
#[instrument(skip_all, fields(tasks = %params.tasks.display()))]
pub fn run_batch_with<E, R>(
    params: &BatchParams,
    registry: &mut SessionRegistry,
    endpoint: E,
    recorder: &mut R,
) -> Result<BatchOutcome>
where
    E: ModelEndpoint,
    R: ResultRecorder + ?Sized,
{
    let started_at = Utc::now();
    let corpus = load_corpus(&params.tasks, |spec| registry.admit(spec))?;
    info!(
        accepted = corpus.accepted.len(),
        rejected = corpus.rejected.len(),
        "corpus loaded"
    );

    let prompts = PromptEngine::new(params.config.agent.system_template.as_deref())?;
    let mut agent = Agent::new(endpoint, AgentSettings::from(&params.config.agent), prompts);
    let settings = SchedulerSettings::from(&params.config);
    let report = Scheduler::new(&mut agent, recorder, &settings).run(registry, &corpus.accepted)?;

    let summary = BatchSummary {
        tasks_root: params.tasks.clone(),
        started_at: started_at.to_rfc3339(),
        ended_at: Utc::now().to_rfc3339(),
        counter: report.counter,
        tasks: report.tasks,
        rejected: corpus.rejected,
    };
    let summary_path = write_summary(&params.logs, &summary)?;
    info!(summary = %summary_path.display(), "{}", summary.counter);
    Ok(BatchOutcome {
        counter: summary.counter,
        rejected: summary.rejected.len(),
        summary_path,
    })
}

/// Result of one plan entry.
#[derive(Debug)]
pub struct EntryOutcome {
    pub tasks: PathBuf,
    pub logs: PathBuf,
    pub result: Result<BatchOutcome>,
}

/// Build each entry's parameters: its own config file, or `default_config`.
pub fn plan_params(plan: &Plan, default_config: &BenchConfig) -> Vec<Result<BatchParams>> {
    plan.entries
        .iter()
        .map(|entry| {
            let mut config = match &entry.config {
                Some(path) => load_config(path)
                    .with_context(|| format!("load plan entry config {}", path.display()))?,
                None => default_config.clone(),
            };
            if let Some(resume) = entry.resume {
                config.run.resume = resume;
            }
            Ok(BatchParams {
                tasks: entry.tasks.clone(),
                logs: entry.logs.clone(),
                config,
            })
        })
        .collect()
}

/// Run every plan entry with [`run_batch`].
pub fn run_plan(plan: &Plan, default_config: &BenchConfig) -> Vec<EntryOutcome> {
    run_plan_with(plan, default_config, run_batch)
}

/// Run every plan entry in order with `run`, isolating entry failures.
pub fn run_plan_with<F>(plan: &Plan, default_config: &BenchConfig, mut run: F) -> Vec<EntryOutcome>
where
    F: FnMut(&BatchParams) -> Result<BatchOutcome>,
{
    plan.entries
        .iter()
        .zip(plan_params(plan, default_config))
        .enumerate()
        .map(|(index, (entry, params))| {
            let result = params.and_then(|params| run(&params));
            match &result {
                Ok(outcome) => info!(entry = index, "{}", outcome.counter),
                Err(err) => error!(entry = index, error = %format!("{err:#}"), "plan entry failed"),
            }
            EntryOutcome {
                tasks: entry.tasks.clone(),
                logs: entry.logs.clone(),
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::PlanEntry;
    use anyhow::bail;
    use std::path::Path;

    fn entry(tasks: &str, resume: Option<bool>) -> PlanEntry {
        PlanEntry {
            tasks: PathBuf::from(tasks),
            logs: PathBuf::from(format!("{tasks}-logs")),
            config: None,
            resume,
        }
    }

    #[test]
    fn plan_entries_run_in_order_and_failures_are_isolated() {
        let plan = Plan {
            entries: vec![entry("a", None), entry("b", Some(false)), entry("c", None)],
        };
        let mut seen = Vec::new();
        let outcomes = run_plan_with(&plan, &BenchConfig::default(), |params| {
            seen.push((params.tasks.clone(), params.config.run.resume));
            if params.tasks == Path::new("b") {
                bail!("session exploded");
            }
            Ok(BatchOutcome {
                counter: Counter::default(),
                rejected: 0,
                summary_path: params.logs.join("SUM.json"),
            })
        });

        assert_eq!(
            seen,
            vec![
                (PathBuf::from("a"), true),
                (PathBuf::from("b"), false),
                (PathBuf::from("c"), true),
            ]
        );
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
    }

    #[test]
    fn unreadable_entry_config_fails_only_that_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut broken = entry("a", None);
        broken.config = Some(temp.path().join("broken.toml"));
        std::fs::write(temp.path().join("broken.toml"), "[agent]\nbogus = 1\n").expect("write");
        let plan = Plan {
            entries: vec![broken, entry("b", None)],
        };
        let mut runs = 0;
        let outcomes = run_plan_with(&plan, &BenchConfig::default(), |params| {
            runs += 1;
            Ok(BatchOutcome {
                counter: Counter::default(),
                rejected: 0,
                summary_path: params.logs.clone(),
            })
        });
        assert_eq!(runs, 1);
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
    }
}
