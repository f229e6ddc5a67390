//! Test-only doubles for sessions, model endpoints, and recorders, plus
//! builders for TaskSpecs and on-disk corpora.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::rule::{EvalRule, RuleSpec, StateSnapshot};
use crate::core::types::{ObsKind, SessionClass, SessionKey};
use crate::core::window::Turn;
use crate::io::model::{CallError, ModelEndpoint};
use crate::io::recorder::{ResultRecorder, StepRecord, TaskMeta};
use crate::io::session::{CommandOutcome, Observation, Session};
use crate::io::task_spec::{DEFAULT_SNAPSHOT, InitStep, TaskSpec, sha256_hex};

/// Calls observed by a [`ScriptedSession`], shared so tests can inspect them
/// after the session moved into a registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionCalls {
    pub opens: usize,
    pub closes: usize,
    pub restores: usize,
    pub snapshots: usize,
    pub executed: Vec<String>,
}

pub type SharedCalls = Rc<RefCell<SessionCalls>>;

/// In-memory session. Unknown commands succeed silently.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    pub replies: BTreeMap<String, CommandOutcome>,
    /// State merged into the snapshot when the command runs.
    pub effects: BTreeMap<String, StateSnapshot>,
    /// Commands whose execution returns `Err`.
    pub errors: BTreeSet<String>,
    pub state: StateSnapshot,
    pub reported_version: Option<String>,
    pub fail_open: bool,
    pub fail_close: bool,
    pub open: bool,
    pub calls: SharedCalls,
}

impl ScriptedSession {
    pub fn calls(&self) -> SharedCalls {
        Rc::clone(&self.calls)
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = object(state);
        self
    }

    pub fn with_effect(mut self, command: &str, state: Value) -> Self {
        self.effects.insert(command.to_string(), object(state));
        self
    }

    pub fn with_reply(mut self, command: &str, ok: bool) -> Self {
        let outcome = CommandOutcome {
            ok,
            messages: Vec::new(),
        };
        self.replies.insert(command.to_string(), outcome);
        self
    }

    pub fn with_messages(mut self, command: &str, messages: &[&str]) -> Self {
        let messages = messages.iter().map(|m| m.to_string()).collect();
        self.replies
            .insert(command.to_string(), CommandOutcome::ok(messages));
        self
    }

    pub fn with_error(mut self, command: &str) -> Self {
        self.errors.insert(command.to_string());
        self
    }
}

fn object(value: Value) -> StateSnapshot {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

impl Session for ScriptedSession {
    fn open(&mut self) -> Result<()> {
        self.calls.borrow_mut().opens += 1;
        if self.fail_open {
            bail!("scripted open failure");
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.calls.borrow_mut().closes += 1;
        self.open = false;
        if self.fail_close {
            bail!("scripted close failure");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn version(&self) -> Option<&str> {
        self.reported_version.as_deref()
    }

    fn restore_baseline(&mut self, _snapshot: &str) -> Result<()> {
        self.calls.borrow_mut().restores += 1;
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutcome> {
        self.calls.borrow_mut().executed.push(command.to_string());
        if self.errors.contains(command) {
            bail!("scripted failure: {command}");
        }
        if let Some(effect) = self.effects.get(command) {
            self.state
                .extend(effect.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(self
            .replies
            .get(command)
            .cloned()
            .unwrap_or_else(|| CommandOutcome::ok(Vec::new())))
    }

    fn observe(&mut self, channels: &BTreeSet<ObsKind>) -> Result<Observation> {
        let executed = self.calls.borrow().executed.len();
        Ok(Observation {
            textual: channels
                .contains(&ObsKind::Textual)
                .then(|| format!("{executed} commands executed")),
            screenshot: channels
                .contains(&ObsKind::Screenshot)
                .then(|| vec![0x89, b'P', b'N', b'G']),
            a11y_tree: channels
                .contains(&ObsKind::A11yTree)
                .then(|| "window\n  canvas".to_string()),
        })
    }

    fn snapshot(&mut self) -> Result<StateSnapshot> {
        self.calls.borrow_mut().snapshots += 1;
        Ok(self.state.clone())
    }
}

/// Payloads seen by a [`ScriptedEndpoint`].
#[derive(Debug, Default, Clone)]
pub struct EndpointProbe {
    payloads: Rc<RefCell<Vec<Vec<Turn>>>>,
}

impl EndpointProbe {
    pub fn payload_sizes(&self) -> Vec<usize> {
        self.payloads.borrow().iter().map(Vec::len).collect()
    }

    pub fn calls(&self) -> usize {
        self.payloads.borrow().len()
    }

    pub fn payloads(&self) -> Vec<Vec<Turn>> {
        self.payloads.borrow().clone()
    }
}

/// Endpoint replaying a script of replies, then a fixed fallback reply.
#[derive(Debug)]
pub struct ScriptedEndpoint {
    script: Vec<std::result::Result<String, CallError>>,
    fallback: String,
    probe: EndpointProbe,
}

impl ScriptedEndpoint {
    /// Replies are consumed in order; afterwards every call answers `DONE`.
    pub fn new(mut script: Vec<std::result::Result<String, CallError>>) -> Self {
        script.reverse();
        Self {
            script,
            fallback: "```\nDONE\n```".to_string(),
            probe: EndpointProbe::default(),
        }
    }

    pub fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = reply.to_string();
        self
    }

    pub fn probe(&self) -> EndpointProbe {
        self.probe.clone()
    }
}

impl ModelEndpoint for ScriptedEndpoint {
    fn complete(&mut self, payload: &[Turn]) -> std::result::Result<String, CallError> {
        self.probe.payloads.borrow_mut().push(payload.to_vec());
        self.script
            .pop()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Step as kept by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStep {
    pub index: u32,
    pub actions: Vec<String>,
    pub response: String,
    pub payload_len: usize,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    pub results: BTreeMap<String, bool>,
    pub metas: BTreeMap<String, TaskMeta>,
    pub begun: Vec<String>,
    steps: BTreeMap<String, Vec<RecordedStep>>,
}

impl MemoryRecorder {
    pub fn steps(&self, identity: &str) -> &[RecordedStep] {
        self.steps.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl ResultRecorder for MemoryRecorder {
    fn has_result(&self, identity: &str) -> Result<bool> {
        Ok(self.results.contains_key(identity))
    }

    fn begin_task(&mut self, identity: &str) -> Result<()> {
        self.begun.push(identity.to_string());
        self.steps.remove(identity);
        Ok(())
    }

    fn append_step(&mut self, identity: &str, step: &StepRecord<'_>) -> Result<()> {
        self.steps
            .entry(identity.to_string())
            .or_default()
            .push(RecordedStep {
                index: step.index,
                actions: step.actions.clone(),
                response: step.response.to_string(),
                payload_len: step.payload.len(),
            });
        Ok(())
    }

    fn write_result(&mut self, identity: &str, passed: bool) -> Result<()> {
        self.results.insert(identity.to_string(), passed);
        Ok(())
    }

    fn write_meta(&mut self, identity: &str, meta: &TaskMeta) -> Result<()> {
        self.metas.insert(identity.to_string(), meta.clone());
        Ok(())
    }
}

/// Start a TaskSpec for session `App:Raw` with a five-step budget and no rules.
pub fn spec_builder(identity: &str) -> SpecBuilder {
    SpecBuilder {
        identity: identity.to_string(),
        key: SessionKey::new("App", SessionClass::Raw),
        steps: 5,
        instruction: "Do the task.".to_string(),
        init_steps: Vec::new(),
        rules: Vec::new(),
        version: None,
        snapshot: DEFAULT_SNAPSHOT.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SpecBuilder {
    identity: String,
    key: SessionKey,
    steps: u32,
    instruction: String,
    init_steps: Vec<InitStep>,
    rules: Vec<EvalRule>,
    version: Option<String>,
    snapshot: String,
}

impl SpecBuilder {
    pub fn key(mut self, kind: &str, class: SessionClass) -> Self {
        self.key = SessionKey::new(kind, class);
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn instruction(mut self, instruction: &str) -> Self {
        self.instruction = instruction.to_string();
        self
    }

    /// `args` must be a JSON object of keyword arguments.
    pub fn init_step(mut self, func: &str, args: Value) -> Self {
        self.init_steps.push(InitStep {
            func: func.to_string(),
            args: object(args),
        });
        self
    }

    /// Compile a rule from its JSON form, as it appears in `evaluate`.
    pub fn rule(mut self, raw: Value) -> Self {
        let spec: RuleSpec = serde_json::from_value(raw).expect("rule spec");
        self.rules.push(EvalRule::compile(&spec).expect("compile rule"));
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn snapshot(mut self, snapshot: &str) -> Self {
        self.snapshot = snapshot.to_string();
        self
    }

    pub fn build(self) -> TaskSpec {
        TaskSpec {
            path: PathBuf::from(format!("{}.json", self.identity)),
            sha256: sha256_hex(self.identity.as_bytes()),
            identity: self.identity,
            key: self.key,
            step_budget: self.steps,
            instruction: self.instruction,
            init_steps: self.init_steps,
            rules: self.rules,
            version: self.version,
            snapshot: self.snapshot,
        }
    }
}

/// Minimal valid TaskSpec document for `kind`/`sort` with the given rules.
pub fn task_json(kind: &str, sort: &str, evaluate: Value) -> Value {
    json!({
        "type": kind,
        "sort": sort,
        "steps": 5,
        "instruction": format!("Operate {kind}."),
        "initialize": [],
        "evaluate": evaluate,
    })
}

/// Write `identity.json` files under `root`, creating nested directories.
pub fn write_tasks(root: &Path, tasks: &[(&str, Value)]) {
    for (identity, doc) in tasks {
        let path = root.join(format!("{identity}.json"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create task dir");
        }
        let text = serde_json::to_string_pretty(doc).expect("serialize task");
        fs::write(&path, text).expect("write task");
    }
}

/// Temporary corpus holding the given tasks.
pub fn temp_corpus(tasks: &[(&str, Value)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tasks(dir.path(), tasks);
    dir
}
