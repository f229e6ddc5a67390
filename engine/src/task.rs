//! Per-task state machine: initialize, predict, evaluate.
//!
//! Control signals are values, never errors: the prediction loop threads a
//! [`StepFlow`] out of action execution and ends with a [`StopReason`] that
//! evaluation compares against the task's stop rule. Any `Err` leaving
//! [`Task::run`] is an unexpected failure the scheduler records as errored.

use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::agent::Agent;
use crate::core::actions::Action;
use crate::core::rule::{
    EvalRule, FailedRule, StateSnapshot, evaluate_near, evaluate_states, message_lines,
};
use crate::core::types::{ObsKind, Primitive, StepFlow, StopReason, TaskOutcome};
use crate::io::config::PacingConfig;
use crate::io::model::ModelEndpoint;
use crate::io::prompt::SystemPrompt;
use crate::io::recorder::{ResultRecorder, StepRecord};
use crate::io::session::SessionSlot;
use crate::io::task_spec::TaskSpec;

/// Full init-step sequences attempted before a task fails initialization.
pub const CONFIG_RETRY: u32 = 5;

/// Pauses applied while a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    pub wait: Duration,
    pub action_pause: Duration,
}

impl From<&PacingConfig> for Pacing {
    fn from(cfg: &PacingConfig) -> Self {
        Self {
            wait: Duration::from_secs(cfg.wait_secs),
            action_pause: Duration::from_millis(cfg.action_pause_ms),
        }
    }
}

/// How one task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    /// `None` when initialization failed and prediction never ran.
    pub stop_reason: Option<StopReason>,
    pub failed_rule: Option<FailedRule>,
    pub init_attempts: u32,
    pub steps: u32,
    pub overflow_retries: usize,
    pub transient_retries: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Prediction {
    steps: u32,
    overflow_retries: usize,
    transient_retries: usize,
}

/// One TaskSpec bound to its session for a single run.
pub struct Task<'a> {
    spec: &'a TaskSpec,
    slot: &'a mut SessionSlot,
    pacing: &'a Pacing,
    observations: &'a BTreeSet<ObsKind>,
}

impl<'a> Task<'a> {
    pub fn new(
        spec: &'a TaskSpec,
        slot: &'a mut SessionSlot,
        pacing: &'a Pacing,
        observations: &'a BTreeSet<ObsKind>,
    ) -> Self {
        Self {
            spec,
            slot,
            pacing,
            observations,
        }
    }

    #[instrument(skip_all, fields(task = %self.spec.identity))]
    pub fn run<E, R>(&mut self, agent: &mut Agent<E>, recorder: &mut R) -> Result<TaskReport>
    where
        E: ModelEndpoint,
        R: ResultRecorder + ?Sized,
    {
        let Some(init_attempts) = self.initialize() else {
            warn!(attempts = CONFIG_RETRY, "initialization failed");
            return Ok(TaskReport {
                outcome: TaskOutcome::Failed,
                stop_reason: None,
                failed_rule: None,
                init_attempts: CONFIG_RETRY,
                steps: 0,
                overflow_retries: 0,
                transient_retries: 0,
            });
        };

        agent.begin(&SystemPrompt {
            key: &self.spec.key,
            instruction: &self.spec.instruction,
            budget: self.spec.step_budget,
        })?;
        let mut prediction = Prediction::default();
        let reason = self.predict(agent, recorder, &mut prediction)?;
        info!(?reason, steps = prediction.steps, "prediction finished");

        let failed_rule = self.evaluate(reason)?;
        let outcome = if failed_rule.is_none() {
            TaskOutcome::Passed
        } else {
            TaskOutcome::Failed
        };
        info!(?outcome, ?failed_rule, "evaluation finished");
        Ok(TaskReport {
            outcome,
            stop_reason: Some(reason),
            failed_rule,
            init_attempts,
            steps: prediction.steps,
            overflow_retries: prediction.overflow_retries,
            transient_retries: prediction.transient_retries,
        })
    }

    /// Run up to [`CONFIG_RETRY`] attempts; `Some(attempts)` once one fully succeeds.
    fn initialize(&mut self) -> Option<u32> {
        for attempt in 1..=CONFIG_RETRY {
            match self.init_attempt() {
                Ok(true) => {
                    debug!(attempt, "initialized");
                    return Some(attempt);
                }
                Ok(false) => warn!(attempt, "init step reported failure"),
                Err(err) => warn!(attempt, error = %format!("{err:#}"), "init attempt failed"),
            }
        }
        None
    }

    fn init_attempt(&mut self) -> Result<bool> {
        let SessionSlot { session, adapter } = &mut *self.slot;
        session
            .restore_baseline(&self.spec.snapshot)
            .context("restore baseline")?;
        for step in &self.spec.init_steps {
            if !adapter
                .run_step(session.as_mut(), step)
                .with_context(|| format!("init step {}", step.func))?
            {
                debug!(func = %step.func, "init step failed, abandoning attempt");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn predict<E, R>(
        &mut self,
        agent: &mut Agent<E>,
        recorder: &mut R,
        prediction: &mut Prediction,
    ) -> Result<StopReason>
    where
        E: ModelEndpoint,
        R: ResultRecorder + ?Sized,
    {
        let budget = self.spec.step_budget;
        for index in 0..budget {
            let observation = self
                .slot
                .session
                .observe(self.observations)
                .context("observe session")?;
            let reply = agent.step(index + 1, budget, &observation)?;
            prediction.steps = index + 1;
            prediction.overflow_retries += reply.overflow_retries;
            prediction.transient_retries += reply.transient_retries as usize;

            let response = reply.turn.text();
            recorder.append_step(
                &self.spec.identity,
                &StepRecord {
                    index,
                    actions: reply.actions.iter().map(|a| a.source().to_string()).collect(),
                    response: &response,
                    observation: &observation,
                    payload: &reply.payload,
                },
            )?;

            match self.execute_actions(&reply.actions)? {
                StepFlow::Continue => {}
                StepFlow::Done => return Ok(StopReason::Done),
                StepFlow::Fail => return Ok(StopReason::Fail),
            }
        }
        Ok(StopReason::Timeout)
    }

    fn execute_actions(&mut self, actions: &[Action]) -> Result<StepFlow> {
        for action in actions {
            match action {
                Action::Signal(Primitive::Done) => return Ok(StepFlow::Done),
                Action::Signal(Primitive::Fail) => return Ok(StepFlow::Fail),
                Action::Signal(Primitive::Wait) => {
                    debug!(secs = self.pacing.wait.as_secs(), "waiting");
                    thread::sleep(self.pacing.wait);
                }
                Action::Signal(Primitive::Timeout) => {}
                Action::Command(command) => {
                    let outcome = self
                        .slot
                        .session
                        .execute(command)
                        .with_context(|| format!("execute {command:?}"))?;
                    if !outcome.ok {
                        debug!(command, "command reported an error");
                    }
                    thread::sleep(self.pacing.action_pause);
                }
            }
        }
        Ok(StepFlow::Continue)
    }

    /// `None` when every rule passes, otherwise the first failing rule.
    fn evaluate(&mut self, reason: StopReason) -> Result<Option<FailedRule>> {
        let spec = self.spec;
        let mut checklist: Vec<(usize, &EvalRule)> = spec.rules.iter().enumerate().collect();

        if let Some(position) = checklist.iter().position(|(_, rule)| rule.is_stop()) {
            let (index, rule) = checklist.remove(position);
            if let EvalRule::Stop(expected) = rule
                && *expected != reason
            {
                debug!(?expected, ?reason, "stop reason mismatch");
                return Ok(Some(failed(index, rule)));
            }
        }

        let needs_snapshot = checklist
            .iter()
            .any(|(_, rule)| matches!(rule, EvalRule::States(_) | EvalRule::Near { .. }));
        let snapshot = if needs_snapshot {
            self.slot.session.snapshot().context("snapshot session state")?
        } else {
            StateSnapshot::new()
        };

        for (index, rule) in checklist {
            if !self.check(rule, &snapshot)? {
                return Ok(Some(failed(index, rule)));
            }
        }
        Ok(None)
    }

    fn check(&mut self, rule: &EvalRule, snapshot: &StateSnapshot) -> Result<bool> {
        let SessionSlot { session, adapter } = &mut *self.slot;
        let passed = match rule {
            EvalRule::Stop(_) => true,
            EvalRule::States(states) => evaluate_states(states, snapshot),
            EvalRule::Near {
                key,
                value,
                tolerance,
            } => evaluate_near(key, *value, *tolerance, snapshot),
            EvalRule::Info { key, lines } => {
                let messages = adapter
                    .info(session.as_mut(), key)
                    .with_context(|| format!("info {key}"))?;
                message_lines(messages.as_slice()) == *lines
            }
            EvalRule::File { path, needle } => session
                .read_file(Path::new(path))?
                .is_some_and(|contents| contents.contains(needle.as_str())),
        };
        Ok(passed)
    }
}

fn failed(index: usize, rule: &EvalRule) -> FailedRule {
    FailedRule {
        index,
        kind: rule.kind().to_string(),
    }
}

/// Run a task against a session that must already be open.
pub fn run_task<E, R>(
    spec: &TaskSpec,
    slot: &mut SessionSlot,
    pacing: &Pacing,
    observations: &BTreeSet<ObsKind>,
    agent: &mut Agent<E>,
    recorder: &mut R,
) -> Result<TaskReport>
where
    E: ModelEndpoint,
    R: ResultRecorder + ?Sized,
{
    debug_assert!(slot.session.is_open(), "session must be open");
    Task::new(spec, slot, pacing, observations).run(agent, recorder)
}
