//! Benchmark configuration (`bench.toml`) and batch plan files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::types::{ObsKind, SessionClass, SessionKey};

/// Benchmark configuration (TOML).
///
/// Missing sections fall back to defaults; unknown keys are rejected so typos
/// surface at load time instead of silently changing a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub pacing: PacingConfig,
    pub run: RunConfig,
    pub sessions: Vec<SessionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Turn-pairs sent upstream besides the system turn and the pending user turn.
    pub context_window: usize,

    /// Transient-failure retries per agent call.
    pub retries: u32,

    /// First retry pause; doubles per retry.
    pub retry_backoff_ms: u64,

    pub retry_backoff_max_ms: u64,

    /// Replaces the embedded system prompt template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_template: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context_window: 3,
            retries: 3,
            retry_backoff_ms: 1000,
            retry_backoff_max_ms: 30_000,
            system_template: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStyle {
    #[default]
    Openai,
}

/// How an upstream reply signals that the payload exceeded the model's input.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStyle {
    /// Non-success status with `error.code == "context_length_exceeded"`.
    #[default]
    ContextLength,
    /// Successful status with empty assistant content.
    EmptyContent,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub style: ModelStyle,
    pub base_url: String,
    pub model_name: String,

    /// Name of the environment variable holding the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    pub max_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub overflow: OverflowStyle,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            style: ModelStyle::Openai,
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model_name: "gpt-4o".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            proxy: None,
            max_tokens: 1500,
            top_p: 0.9,
            temperature: 0.5,
            timeout_secs: 120,
            overflow: OverflowStyle::ContextLength,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PacingConfig {
    /// Pause for a `WAIT` signal.
    pub wait_secs: u64,
    /// Pause after every executed command.
    pub action_pause_ms: u64,
    /// Pause after a session opens.
    pub boot_settle_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            wait_secs: 5,
            action_pause_ms: 500,
            boot_settle_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub observations: BTreeSet<ObsKind>,
    /// Skip tasks that already have a result marker.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            observations: BTreeSet::from([ObsKind::Textual]),
            resume: true,
        }
    }
}

/// One session driver and its app adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub kind: String,
    pub sort: SessionClass,
    pub base_url: String,

    /// Application version the tasks were written for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Command asking the running application for its version; checked
    /// against `version` every time the session opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_command: Option<String>,

    /// Argv spawning the application; empty means it is already running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launch: Vec<String>,

    /// Stdout prefix printed by the launched application once it accepts commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_line: Option<String>,

    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,

    /// Command whose reply carries the JSON state snapshot.
    pub states_command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_command: Option<String>,

    /// Template rendered with `key` for `info` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_command: Option<String>,

    /// Init-step name to command template rendered with the step's kwargs.
    #[serde(default)]
    pub steps: BTreeMap<String, String>,
}

fn default_boot_timeout_secs() -> u64 {
    30
}

impl SessionConfig {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.kind.clone(), self.sort)
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.context_window == 0 {
            return Err(anyhow!("agent.context_window must be > 0"));
        }
        if self.agent.retry_backoff_ms > self.agent.retry_backoff_max_ms {
            return Err(anyhow!(
                "agent.retry_backoff_ms must not exceed agent.retry_backoff_max_ms"
            ));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(anyhow!("model.base_url must be non-empty"));
        }
        if self.model.model_name.trim().is_empty() {
            return Err(anyhow!("model.model_name must be non-empty"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if !(self.model.top_p > 0.0 && self.model.top_p <= 1.0) {
            return Err(anyhow!("model.top_p must be in (0, 1]"));
        }
        if self.model.temperature.is_nan() || self.model.temperature < 0.0 {
            return Err(anyhow!("model.temperature must be >= 0"));
        }
        if self.run.observations.is_empty() {
            return Err(anyhow!("run.observations must name at least one channel"));
        }
        // Configured sessions are REST sessions, which only observe text.
        let unsupported = self
            .run
            .observations
            .iter()
            .find(|channel| **channel != ObsKind::Textual);
        if let (false, Some(channel)) = (self.sessions.is_empty(), unsupported) {
            bail!("run.observations: {channel:?} is not available from REST sessions");
        }
        let mut seen = BTreeSet::new();
        for session in &self.sessions {
            let key = session.key();
            session
                .validate()
                .with_context(|| format!("sessions[{key}]"))?;
            if !seen.insert(key.clone()) {
                bail!("duplicate session entry for {key}");
            }
        }
        Ok(())
    }

    pub fn session(&self, key: &SessionKey) -> Option<&SessionConfig> {
        self.sessions.iter().find(|session| session.key() == *key)
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            bail!("kind must be non-empty");
        }
        if self.base_url.trim().is_empty() {
            bail!("base_url must be non-empty");
        }
        if self.states_command.trim().is_empty() {
            bail!("states_command must be non-empty");
        }
        if self.launch.first().is_some_and(|program| program.trim().is_empty()) {
            bail!("launch must start with a program");
        }
        if self.boot_timeout_secs == 0 {
            bail!("boot_timeout_secs must be > 0");
        }
        if self.version_command.is_some() && self.version.is_none() {
            bail!("version_command needs a version to check against");
        }
        let env = minijinja::Environment::new();
        for (name, source) in &self.steps {
            env.template_from_str(source)
                .with_context(|| format!("steps.{name} is not a valid template"))?;
        }
        if let Some(source) = &self.info_command {
            env.template_from_str(source)
                .context("info_command is not a valid template")?;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `BenchConfig::default()`.
pub fn load_config(path: &Path) -> Result<BenchConfig> {
    if !path.exists() {
        let cfg = BenchConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BenchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BenchConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// One batch of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PlanEntry {
    pub tasks: PathBuf,
    pub logs: PathBuf,
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Overrides `run.resume` from the entry's config.
    #[serde(default)]
    pub resume: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

/// Load a plan file; relative paths resolve against the plan's directory.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut plan: Plan =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if plan.entries.is_empty() {
        bail!("plan {} has no entries", path.display());
    }
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for entry in &mut plan.entries {
        entry.tasks = base.join(&entry.tasks);
        entry.logs = base.join(&entry.logs);
        entry.config = entry.config.as_ref().map(|config| base.join(config));
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[agent]
context_window = 2

[model]
model_name = "local"
base_url = "http://127.0.0.1:8000/v1/chat/completions"
overflow = "empty_content"

[run]
observations = ["textual"]

[[sessions]]
kind = "ChimeraX"
sort = "Raw"
base_url = "http://127.0.0.1:6000/run"
version = "1.8"
version_command = "version"
launch = ["chimerax", "--nogui"]
ready_line = "REST server started"
states_command = "states"
info_command = "info {{ key }}"

[sessions.steps]
open = "open {{ name }}"
"#;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, BenchConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bench.toml");
        let cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("bench.toml.tmp").exists());
    }

    #[test]
    fn sample_fills_defaults() {
        let cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        cfg.validate().expect("valid");
        assert_eq!(cfg.agent.context_window, 2);
        assert_eq!(cfg.agent.retries, 3);
        assert_eq!(cfg.model.overflow, OverflowStyle::EmptyContent);
        assert_eq!(cfg.pacing.wait_secs, 5);
        let session = cfg
            .session(&SessionKey::new("ChimeraX", SessionClass::Raw))
            .expect("session");
        assert_eq!(session.boot_timeout_secs, 30);
        assert_eq!(session.steps["open"], "open {{ name }}");
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = toml::from_str::<BenchConfig>("[agent]\nwindow = 3\n").expect_err("unknown");
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn rejects_zero_context_window() {
        let mut cfg = BenchConfig::default();
        cfg.agent.context_window = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_sessions_and_bad_templates() {
        let mut cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        cfg.sessions.push(cfg.sessions[0].clone());
        assert!(cfg.validate().is_err());

        let mut cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        cfg.sessions[0]
            .steps
            .insert("broken".to_string(), "open {{ name".to_string());
        let err = cfg.validate().expect_err("bad template");
        assert!(format!("{err:#}").contains("steps.broken"));
    }

    #[test]
    fn rest_sessions_only_observe_text() {
        let mut cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        cfg.run.observations.insert(ObsKind::Screenshot);
        let err = cfg.validate().expect_err("screenshot");
        assert!(err.to_string().contains("Screenshot"));

        cfg.sessions.clear();
        cfg.validate().expect("no sessions configured");
    }

    #[test]
    fn version_command_requires_a_version() {
        let mut cfg: BenchConfig = toml::from_str(SAMPLE).expect("parse sample");
        cfg.sessions[0].version = None;
        let err = cfg.validate().expect_err("no version");
        assert!(format!("{err:#}").contains("version_command"));
    }

    #[test]
    fn plan_paths_resolve_against_plan_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.toml");
        fs::write(
            &path,
            "[[entries]]\ntasks = \"tasks/a\"\nlogs = \"logs/a\"\nresume = false\n\n[[entries]]\ntasks = \"tasks/b\"\nlogs = \"logs/b\"\nconfig = \"b.toml\"\n",
        )
        .expect("write plan");
        let plan = load_plan(&path).expect("load plan");
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].tasks, temp.path().join("tasks/a"));
        assert_eq!(plan.entries[0].resume, Some(false));
        assert_eq!(plan.entries[1].config, Some(temp.path().join("b.toml")));
    }

    #[test]
    fn empty_plan_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.toml");
        fs::write(&path, "").expect("write plan");
        assert!(load_plan(&path).is_err());
    }
}
