//! Session-group scheduler.
//!
//! Tasks are folded into groups sharing a session key. Each group opens its
//! session once, runs every pending member, and closes the session even when a
//! member fails. A group whose members all carry a result marker is skipped
//! without opening its session.
//!
//! Per-task failures become errored outcomes and never stop the batch. Session
//! open/close failures ([`SessionError`]) abort the whole batch.

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{error, info, info_span, warn};

use crate::agent::Agent;
use crate::core::grouping::group_by_session;
use crate::core::types::{Counter, ObsKind, SessionKey, TaskOutcome};
use crate::io::config::BenchConfig;
use crate::io::model::ModelEndpoint;
use crate::io::recorder::{ResultRecorder, TaskMeta, TaskSummary};
use crate::io::session::{SessionAction, SessionError, SessionRegistry, SessionSlot};
use crate::io::task_spec::TaskSpec;
use crate::task::{Pacing, TaskReport, run_task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub pacing: Pacing,
    pub observations: BTreeSet<ObsKind>,
    /// Pause after a session opens, before its first task.
    pub boot_settle: Duration,
    /// Skip tasks that already carry a result marker.
    pub resume: bool,
}

impl From<&BenchConfig> for SchedulerSettings {
    fn from(cfg: &BenchConfig) -> Self {
        Self {
            pacing: Pacing::from(&cfg.pacing),
            observations: cfg.run.observations.clone(),
            boot_settle: Duration::from_secs(cfg.pacing.boot_settle_secs),
            resume: cfg.run.resume,
        }
    }
}

/// Outcome of one scheduled batch, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub counter: Counter,
    pub tasks: Vec<TaskSummary>,
}

impl BatchReport {
    fn push(&mut self, spec: &TaskSpec, outcome: Option<TaskOutcome>) {
        match outcome {
            None => self.counter.ignored += 1,
            Some(TaskOutcome::Passed) => self.counter.passed += 1,
            Some(TaskOutcome::Failed) => self.counter.failed += 1,
            Some(TaskOutcome::Errored) => self.counter.skipped += 1,
        }
        self.tasks.push(TaskSummary {
            identity: spec.identity.clone(),
            session: spec.key.to_string(),
            outcome,
        });
    }
}

pub struct Scheduler<'a, E, R: ?Sized> {
    agent: &'a mut Agent<E>,
    recorder: &'a mut R,
    settings: &'a SchedulerSettings,
}

impl<'a, E, R> Scheduler<'a, E, R>
where
    E: ModelEndpoint,
    R: ResultRecorder + ?Sized,
{
    pub fn new(
        agent: &'a mut Agent<E>,
        recorder: &'a mut R,
        settings: &'a SchedulerSettings,
    ) -> Self {
        Self {
            agent,
            recorder,
            settings,
        }
    }

    /// Run every spec, one session group at a time.
    pub fn run(
        &mut self,
        registry: &mut SessionRegistry,
        specs: &[TaskSpec],
    ) -> Result<BatchReport> {
        let members: Vec<&TaskSpec> = specs.iter().collect();
        let groups = group_by_session(members, |spec: &&TaskSpec| spec.key.clone());
        let mut report = BatchReport::default();

        for group in groups {
            let mut pending = Vec::new();
            for spec in group.members {
                if self.settings.resume && self.recorder.has_result(&spec.identity)? {
                    report.push(spec, None);
                } else {
                    pending.push(spec);
                }
            }
            if pending.is_empty() {
                info!(session = %group.key, "every task already complete, not opening session");
                continue;
            }

            let slot = registry
                .slot_mut(&group.key)
                .ok_or_else(|| anyhow!("no session registered for {}", group.key))?;
            self.run_group(&group.key, slot, &pending, &mut report)?;
        }
        Ok(report)
    }

    fn run_group(
        &mut self,
        key: &SessionKey,
        slot: &mut SessionSlot,
        pending: &[&TaskSpec],
        report: &mut BatchReport,
    ) -> Result<()> {
        let span = info_span!("session", session = %key);
        let _guard = span.enter();

        info!(tasks = pending.len(), "opening session");
        slot.session
            .open()
            .map_err(|err| session_error(key, SessionAction::Open, &err))?;
        if !self.settings.boot_settle.is_zero() {
            thread::sleep(self.settings.boot_settle);
        }

        let members = self.run_members(slot, pending, report);

        info!("closing session");
        let closed = slot.session.close();
        members?;
        closed.map_err(|err| session_error(key, SessionAction::Close, &err))?;
        Ok(())
    }

    fn run_members(
        &mut self,
        slot: &mut SessionSlot,
        pending: &[&TaskSpec],
        report: &mut BatchReport,
    ) -> Result<()> {
        for spec in pending {
            let outcome = self.run_member(spec, slot)?;
            report.push(spec, Some(outcome));
        }
        Ok(())
    }

    /// Run one task inside its failure boundary. Only [`SessionError`] escapes.
    fn run_member(&mut self, spec: &TaskSpec, slot: &mut SessionSlot) -> Result<TaskOutcome> {
        let span = info_span!("task", task = %spec.identity);
        let _guard = span.enter();

        let started_at = Utc::now();
        let clock = Instant::now();
        let attempt = self.attempt(spec, slot);

        let (outcome, report, error_text) = match attempt {
            Ok(report) => (report.outcome, Some(report), None),
            Err(err) if err.downcast_ref::<SessionError>().is_some() => return Err(err),
            Err(err) => {
                let text = format!("{err:#}");
                error!(error = %text, "task errored");
                (TaskOutcome::Errored, None, Some(text))
            }
        };

        let meta = TaskMeta {
            identity: spec.identity.clone(),
            kind: spec.key.kind.clone(),
            sort: spec.key.class.as_str().to_string(),
            spec_path: spec.path.clone(),
            spec_sha256: spec.sha256.clone(),
            outcome,
            stop_reason: report.as_ref().and_then(|r| r.stop_reason),
            failed_rule: report.as_ref().and_then(|r| r.failed_rule.clone()),
            steps: report.as_ref().map_or(0, |r| r.steps),
            init_attempts: report.as_ref().map_or(0, |r| r.init_attempts),
            overflow_retries: report.as_ref().map_or(0, |r| r.overflow_retries),
            transient_retries: report.as_ref().map_or(0, |r| r.transient_retries),
            error: error_text,
            started_at: started_at.to_rfc3339(),
            ended_at: Utc::now().to_rfc3339(),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if let Err(err) = self.recorder.write_meta(&spec.identity, &meta) {
            warn!(error = %format!("{err:#}"), "failed to write task meta");
        }
        info!(?outcome, "task finished");
        Ok(outcome)
    }

    fn attempt(&mut self, spec: &TaskSpec, slot: &mut SessionSlot) -> Result<TaskReport> {
        self.recorder.begin_task(&spec.identity)?;
        let report = run_task(
            spec,
            slot,
            &self.settings.pacing,
            &self.settings.observations,
            &mut *self.agent,
            &mut *self.recorder,
        )?;
        match report.outcome {
            TaskOutcome::Passed => self.recorder.write_result(&spec.identity, true)?,
            TaskOutcome::Failed => self.recorder.write_result(&spec.identity, false)?,
            TaskOutcome::Errored => {}
        }
        Ok(report)
    }
}

fn session_error(key: &SessionKey, action: SessionAction, err: &anyhow::Error) -> anyhow::Error {
    SessionError {
        key: key.clone(),
        action,
        message: format!("{err:#}"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSettings;
    use crate::core::types::SessionClass;
    use crate::io::prompt::PromptEngine;
    use crate::io::session::AppAdapter;
    use crate::test_support::{MemoryRecorder, ScriptedEndpoint, ScriptedSession, spec_builder};
    use serde_json::json;

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            pacing: Pacing {
                wait: Duration::ZERO,
                action_pause: Duration::ZERO,
            },
            observations: BTreeSet::from([ObsKind::Textual]),
            boot_settle: Duration::ZERO,
            resume: true,
        }
    }

    fn register(registry: &mut SessionRegistry, class: SessionClass, session: ScriptedSession) {
        registry.register(
            SessionKey::new("App", class),
            Box::new(session),
            AppAdapter::default(),
        );
    }

    fn agent() -> Agent<ScriptedEndpoint> {
        Agent::new(
            ScriptedEndpoint::new(Vec::new()),
            AgentSettings {
                context_window: 3,
                retries: 0,
                backoff: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            PromptEngine::default(),
        )
    }

    #[test]
    fn groups_open_once_and_tally_outcomes() {
        let raw = ScriptedSession::default().with_state(json!({"color": "red"}));
        let raw_calls = raw.calls();
        let vm = ScriptedSession::default();
        let vm_calls = vm.calls();
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, raw);
        register(&mut registry, SessionClass::Vm, vm);

        let specs = vec![
            spec_builder("a")
                .rule(json!({"type": "states", "key": "color", "value": "red"}))
                .build(),
            spec_builder("b").key("App", SessionClass::Vm).build(),
            spec_builder("c")
                .rule(json!({"type": "states", "key": "color", "value": "blue"}))
                .build(),
        ];
        let mut agent = agent();
        let mut recorder = MemoryRecorder::default();
        let settings = settings();
        let report = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect("run");

        assert_eq!(report.counter.passed, 2);
        assert_eq!(report.counter.failed, 1);
        let order: Vec<&str> = report.tasks.iter().map(|t| t.identity.as_str()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
        assert_eq!((raw_calls.borrow().opens, raw_calls.borrow().closes), (1, 1));
        assert_eq!((vm_calls.borrow().opens, vm_calls.borrow().closes), (1, 1));
        assert_eq!(recorder.results.get("c"), Some(&false));
        assert_eq!(recorder.metas["c"].failed_rule.as_ref().map(|r| r.index), Some(0));
    }

    #[test]
    fn complete_group_is_not_opened() {
        let session = ScriptedSession::default();
        let calls = session.calls();
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, session);
        let specs = vec![spec_builder("a").build()];
        let mut recorder = MemoryRecorder::default();
        recorder.results.insert("a".to_string(), true);

        let mut agent = agent();
        let settings = settings();
        let report = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect("run");
        assert_eq!(report.counter.ignored, 1);
        assert_eq!(report.tasks[0].outcome, None);
        assert_eq!(calls.borrow().opens, 0);
    }

    #[test]
    fn errored_task_is_skipped_and_batch_continues() {
        let session = ScriptedSession::default().with_error("boom");
        let calls = session.calls();
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, session);
        let specs = vec![spec_builder("a").build(), spec_builder("b").build()];
        let mut agent = Agent::new(
            ScriptedEndpoint::new(vec![Ok("```\nboom\n```".into())]),
            AgentSettings {
                context_window: 3,
                retries: 0,
                backoff: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
            PromptEngine::default(),
        );
        let mut recorder = MemoryRecorder::default();
        let settings = settings();
        let report = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect("run");

        assert_eq!(report.counter.skipped, 1);
        assert_eq!(report.counter.passed, 1);
        assert!(!recorder.results.contains_key("a"));
        assert_eq!(recorder.metas["a"].outcome, TaskOutcome::Errored);
        let error = recorder.metas["a"].error.as_deref().unwrap_or_default();
        assert!(error.contains("boom"));
        assert_eq!(calls.borrow().closes, 1);
    }

    #[test]
    fn open_failure_aborts_with_session_error() {
        let session = ScriptedSession {
            fail_open: true,
            ..ScriptedSession::default()
        };
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, session);
        let specs = vec![spec_builder("a").build()];
        let mut agent = agent();
        let mut recorder = MemoryRecorder::default();
        let settings = settings();
        let err = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect_err("open failure");
        let session_err = err.downcast_ref::<SessionError>().expect("session error");
        assert_eq!(session_err.action, SessionAction::Open);
        assert!(recorder.begun.is_empty());
    }

    #[test]
    fn close_failure_surfaces_after_members_ran() {
        let session = ScriptedSession {
            fail_close: true,
            ..ScriptedSession::default()
        };
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, session);
        let specs = vec![spec_builder("a").build()];
        let mut agent = agent();
        let mut recorder = MemoryRecorder::default();
        let settings = settings();
        let err = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect_err("close failure");
        assert_eq!(
            err.downcast_ref::<SessionError>().map(|e| e.action),
            Some(SessionAction::Close)
        );
        assert_eq!(recorder.results.get("a"), Some(&true));
    }

    #[test]
    fn forced_run_ignores_existing_markers() {
        let mut registry = SessionRegistry::default();
        register(&mut registry, SessionClass::Raw, ScriptedSession::default());
        let specs = vec![spec_builder("a").build()];
        let mut recorder = MemoryRecorder::default();
        recorder.results.insert("a".to_string(), false);
        let mut agent = agent();
        let settings = SchedulerSettings {
            resume: false,
            ..settings()
        };
        let report = Scheduler::new(&mut agent, &mut recorder, &settings)
            .run(&mut registry, &specs)
            .expect("run");
        assert_eq!(report.counter.passed, 1);
        assert_eq!(recorder.results.get("a"), Some(&true));
    }
}
