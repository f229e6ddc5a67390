//! Session capability, app adapters, and the session registry.
//!
//! The [`Session`] trait is the only surface the engine uses to drive an
//! application. Whether the app runs directly or inside a VM is a choice of
//! implementation, not of task type. Tests use scripted sessions that record
//! every call without touching a real application.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::core::rule::StateSnapshot;
use crate::core::types::{ObsKind, SessionKey};
use crate::io::config::{BenchConfig, SessionConfig};
use crate::io::rest_session::RestSession;
use crate::io::task_spec::{InitStep, TaskSpec};

/// Reply to one executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub ok: bool,
    pub messages: Vec<String>,
}

impl CommandOutcome {
    pub fn ok(messages: Vec<String>) -> Self {
        Self { ok: true, messages }
    }

    pub fn failed(messages: Vec<String>) -> Self {
        Self {
            ok: false,
            messages,
        }
    }
}

/// Observation gathered for one prediction step. Unrequested channels stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub textual: Option<String>,
    pub screenshot: Option<Vec<u8>>,
    pub a11y_tree: Option<String>,
}

/// A live application or VM handle.
pub trait Session {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Version of the application behind the session: the configured one until
    /// the session opens, then the one the running application reported.
    /// Checked against a task's `version` at load time.
    fn version(&self) -> Option<&str>;

    /// Return to a clean baseline before an init attempt. The default assumes
    /// the session is already clean.
    fn restore_baseline(&mut self, _snapshot: &str) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutcome>;

    fn observe(&mut self, channels: &BTreeSet<ObsKind>) -> Result<Observation>;

    fn snapshot(&mut self) -> Result<StateSnapshot>;

    /// Read a file the application produced; `None` when it does not exist.
    fn read_file(&mut self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Open,
    Close,
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAction::Open => f.write_str("open"),
            SessionAction::Close => f.write_str("close"),
        }
    }
}

/// Session lifecycle failure. Fatal to the whole group, never counted per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub key: SessionKey,
    pub action: SessionAction,
    pub message: String,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} failed to {}: {}",
            self.key, self.action, self.message
        )
    }
}

impl std::error::Error for SessionError {}

/// Init-step handler: returns whether the step succeeded.
pub type StepHandler = Box<dyn Fn(&mut dyn Session, &Map<String, Value>) -> Result<bool>>;

/// `info` rule handler: returns the messages produced for `key`.
pub type InfoHandler = Box<dyn Fn(&mut dyn Session, &str) -> Result<Vec<String>>>;

/// Per-application capability table: init steps by name plus the info query.
#[derive(Default)]
pub struct AppAdapter {
    steps: BTreeMap<String, StepHandler>,
    info: Option<InfoHandler>,
}

impl fmt::Debug for AppAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppAdapter")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("info", &self.info.is_some())
            .finish()
    }
}

impl AppAdapter {
    pub fn with_step<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut dyn Session, &Map<String, Value>) -> Result<bool> + 'static,
    {
        self.steps.insert(name.into(), Box::new(handler));
        self
    }

    pub fn with_info<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut dyn Session, &str) -> Result<Vec<String>> + 'static,
    {
        self.info = Some(Box::new(handler));
        self
    }

    /// Build the adapter from config templates: each step renders its command
    /// with the step's kwargs and succeeds iff the session accepts it.
    pub fn from_config(cfg: &SessionConfig) -> Self {
        let mut adapter = AppAdapter::default();
        for (name, template) in &cfg.steps {
            let template = template.clone();
            adapter = adapter.with_step(name.clone(), move |session, args| {
                let command = render_command(&template, args)?;
                Ok(session.execute(&command)?.ok)
            });
        }
        if let Some(template) = cfg.info_command.clone() {
            adapter = adapter.with_info(move |session, key| {
                let mut args = Map::new();
                args.insert("key".to_string(), Value::String(key.to_string()));
                let command = render_command(&template, &args)?;
                let outcome = session.execute(&command)?;
                if !outcome.ok {
                    bail!("info command {command:?} failed: {}", outcome.messages.join("; "));
                }
                Ok(outcome.messages)
            });
        }
        adapter
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn run_step(&self, session: &mut dyn Session, step: &InitStep) -> Result<bool> {
        let handler = self
            .steps
            .get(&step.func)
            .ok_or_else(|| anyhow!("unknown init step {:?}", step.func))?;
        handler(session, &step.args)
    }

    pub fn info(&self, session: &mut dyn Session, key: &str) -> Result<Vec<String>> {
        let handler = self
            .info
            .as_ref()
            .ok_or_else(|| anyhow!("no info command configured"))?;
        handler(session, key)
    }
}

fn render_command(template: &str, args: &Map<String, Value>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, args)
        .with_context(|| format!("render command template {template:?}"))
}

/// A registered session and its adapter.
pub struct SessionSlot {
    pub session: Box<dyn Session>,
    pub adapter: AppAdapter,
}

/// Sessions by key. Owned by the scheduler and lent to tasks one at a time.
#[derive(Default)]
pub struct SessionRegistry {
    slots: BTreeMap<SessionKey, SessionSlot>,
}

impl SessionRegistry {
    pub fn register(&mut self, key: SessionKey, session: Box<dyn Session>, adapter: AppAdapter) {
        self.slots.insert(key, SessionSlot { session, adapter });
    }

    /// Register a [`RestSession`] for every configured session entry.
    pub fn from_config(cfg: &BenchConfig) -> Self {
        let mut registry = SessionRegistry::default();
        for session in &cfg.sessions {
            registry.register(
                session.key(),
                Box::new(RestSession::new(session.clone())),
                AppAdapter::from_config(session),
            );
        }
        registry
    }

    pub fn keys(&self) -> impl Iterator<Item = &SessionKey> {
        self.slots.keys()
    }

    pub fn slot_mut(&mut self, key: &SessionKey) -> Option<&mut SessionSlot> {
        self.slots.get_mut(key)
    }

    /// Load-time check that a spec can run here.
    pub fn admit(&self, spec: &TaskSpec) -> Result<()> {
        let slot = self
            .slots
            .get(&spec.key)
            .ok_or_else(|| anyhow!("no session registered for {}", spec.key))?;
        for (index, step) in spec.init_steps.iter().enumerate() {
            if !slot.adapter.has_step(&step.func) {
                bail!(
                    "initialize[{index}]: {} has no init step {:?}",
                    spec.key,
                    step.func
                );
            }
        }
        if let Some(wanted) = &spec.version {
            match slot.session.version() {
                Some(reported) if reported == wanted => {}
                Some(reported) => bail!(
                    "version mismatch: task wants {wanted}, {} reports {reported}",
                    spec.key
                ),
                None => bail!(
                    "version mismatch: task wants {wanted}, {} reports none",
                    spec.key
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionClass;
    use crate::test_support::{ScriptedSession, spec_builder};
    use serde_json::json;

    fn args(raw: Value) -> Map<String, Value> {
        raw.as_object().cloned().expect("object")
    }

    #[test]
    fn render_command_uses_kwargs() {
        let command = render_command("open {{ name }}", &args(json!({"name": "1abc"})))
            .expect("render");
        assert_eq!(command, "open 1abc");
    }

    #[test]
    fn render_command_rejects_missing_kwargs() {
        assert!(render_command("open {{ name }}", &Map::new()).is_err());
    }

    #[test]
    fn config_adapter_runs_steps_through_session() {
        let cfg: SessionConfig = toml::from_str(
            "kind = \"App\"\nsort = \"Raw\"\nbase_url = \"http://x\"\nstates_command = \"states\"\ninfo_command = \"info {{ key }}\"\n[steps]\nopen = \"open {{ name }}\"\n",
        )
        .expect("session config");
        let adapter = AppAdapter::from_config(&cfg);
        let mut session = ScriptedSession::default().with_messages("info models", &["#1\n#2"]);
        let calls = session.calls();

        let step = InitStep {
            func: "open".to_string(),
            args: args(json!({"name": "demo"})),
        };
        assert!(adapter.run_step(&mut session, &step).expect("run step"));
        let lines = adapter.info(&mut session, "models").expect("info");
        assert_eq!(lines, vec!["#1\n#2".to_string()]);
        assert_eq!(calls.borrow().executed, vec!["open demo", "info models"]);
    }

    #[test]
    fn admit_checks_registration_steps_and_version() {
        let mut registry = SessionRegistry::default();
        let key = SessionKey::new("App", SessionClass::Raw);
        let session = ScriptedSession {
            reported_version: Some("1.0".to_string()),
            ..ScriptedSession::default()
        };
        registry.register(
            key.clone(),
            Box::new(session),
            AppAdapter::default().with_step("open", |_, _| Ok(true)),
        );

        let ok = spec_builder("ok").version("1.0").build();
        registry.admit(&ok).expect("admitted");

        let mismatch = spec_builder("mismatch").version("2.0").build();
        let err = registry.admit(&mismatch).expect_err("version");
        assert!(err.to_string().contains("version mismatch"));

        let unknown = spec_builder("unknown").init_step("load", json!({})).build();
        assert!(registry.admit(&unknown).is_err());

        let elsewhere = spec_builder("vm").key("App", SessionClass::Vm).build();
        assert!(registry.admit(&elsewhere).is_err());
    }

    #[test]
    fn default_read_file_reports_missing_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.txt");
        let mut session = ScriptedSession::default();
        assert_eq!(session.read_file(&path).expect("read"), None);
        fs::write(&path, "hello").expect("write");
        assert_eq!(
            session.read_file(&path).expect("read"),
            Some("hello".to_string())
        );
    }
}
