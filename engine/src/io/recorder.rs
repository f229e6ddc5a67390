//! Result recorder: durable per-task markers, trajectories, and batch summaries.
//!
//! Layout under the logs root, one directory per task identity:
//!
//! ```text
//! <logs>/<identity>/result.out            '0' or '1'; existence means "already run"
//! <logs>/<identity>/traj.jsonl            one entry per prediction step
//! <logs>/<identity>/step_<i>@<ts>.txt     textual observation
//! <logs>/<identity>/step_<i>@<ts>.png     screenshot
//! <logs>/<identity>/step_<i>@<ts>.a11y.txt
//! <logs>/<identity>/request.json          latest payload sent upstream
//! <logs>/<identity>/meta.json
//! <logs>/SUM@<ts>.json                    one per batch
//! ```
//!
//! Identities nest (`x/open` and `x/open/sub` may both be tasks), so a task
//! only ever removes its own files, never its directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::rule::FailedRule;
use crate::core::types::{Counter, StopReason, TaskOutcome};
use crate::core::window::Turn;
use crate::io::session::Observation;
use crate::io::task_spec::Rejection;

pub const RESULT_FILE: &str = "result.out";

/// Durable store consulted for resumability and fed by the task loop.
pub trait ResultRecorder {
    fn has_result(&self, identity: &str) -> Result<bool>;

    /// Prepare for a fresh run, dropping artifacts of an earlier incomplete attempt.
    fn begin_task(&mut self, identity: &str) -> Result<()>;

    fn append_step(&mut self, identity: &str, step: &StepRecord<'_>) -> Result<()>;

    fn write_result(&mut self, identity: &str, passed: bool) -> Result<()>;

    fn write_meta(&mut self, identity: &str, meta: &TaskMeta) -> Result<()>;
}

/// One prediction step, persisted before its actions execute.
#[derive(Debug, Clone)]
pub struct StepRecord<'a> {
    pub index: u32,
    pub actions: Vec<String>,
    /// Assistant reply the actions were parsed from.
    pub response: &'a str,
    pub observation: &'a Observation,
    pub payload: &'a [Turn],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrajectoryEntry {
    step_index: u32,
    timestamp: String,
    response: String,
    actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    textual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    a11y_tree: Option<String>,
}

/// Per-task metadata written once the task finishes (any outcome).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub identity: String,
    pub kind: String,
    pub sort: String,
    pub spec_path: PathBuf,
    pub spec_sha256: String,
    pub outcome: TaskOutcome,
    pub stop_reason: Option<StopReason>,
    pub failed_rule: Option<FailedRule>,
    pub steps: u32,
    pub init_attempts: u32,
    pub overflow_retries: usize,
    pub transient_retries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TaskPaths {
    pub dir: PathBuf,
    pub result_path: PathBuf,
    pub traj_path: PathBuf,
    pub request_path: PathBuf,
    pub meta_path: PathBuf,
}

impl TaskPaths {
    pub fn new(root: &Path, identity: &str) -> Self {
        let dir = identity
            .split('/')
            .fold(root.to_path_buf(), |dir, part| dir.join(part));
        Self {
            result_path: dir.join(RESULT_FILE),
            traj_path: dir.join("traj.jsonl"),
            request_path: dir.join("request.json"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn step_file(&self, index: u32, stamp: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("step_{index}@{stamp}.{suffix}"))
    }
}

/// Whether `name` is a file a task writes into its own directory.
fn is_task_artifact(name: &str) -> bool {
    matches!(name, RESULT_FILE | "traj.jsonl" | "request.json" | "meta.json")
        || name.starts_with("step_")
}

/// Remove the task artifacts in `dir`, leaving other files and subdirectories.
fn remove_artifacts(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if !entry.file_name().to_str().is_some_and(is_task_artifact) {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if file_type.is_file() {
            fs::remove_file(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Recorder writing the layout described in the module docs.
#[derive(Debug, Clone)]
pub struct FsRecorder {
    root: PathBuf,
}

impl FsRecorder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, identity: &str) -> TaskPaths {
        TaskPaths::new(&self.root, identity)
    }
}

impl ResultRecorder for FsRecorder {
    fn has_result(&self, identity: &str) -> Result<bool> {
        Ok(self.paths(identity).result_path.is_file())
    }

    fn begin_task(&mut self, identity: &str) -> Result<()> {
        let paths = self.paths(identity);
        debug!(task = identity, "removing stale artifacts");
        remove_artifacts(&paths.dir)?;
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create task dir {}", paths.dir.display()))
    }

    fn append_step(&mut self, identity: &str, step: &StepRecord<'_>) -> Result<()> {
        let paths = self.paths(identity);
        let now = Utc::now();
        let stamp = now.format("%Y%m%d-%H%M%S%.3f").to_string();
        let file_name = |path: PathBuf| -> Result<(PathBuf, String)> {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .with_context(|| format!("no file name in {}", path.display()))?;
            Ok((path, name))
        };

        let mut entry = TrajectoryEntry {
            step_index: step.index,
            timestamp: now.to_rfc3339(),
            response: step.response.to_string(),
            actions: step.actions.clone(),
            textual: None,
            screenshot: None,
            a11y_tree: None,
        };
        if let Some(text) = &step.observation.textual {
            let (path, name) = file_name(paths.step_file(step.index, &stamp, "txt"))?;
            write_text(&path, text)?;
            entry.textual = Some(name);
        }
        if let Some(png) = &step.observation.screenshot {
            let (path, name) = file_name(paths.step_file(step.index, &stamp, "png"))?;
            fs::write(&path, png).with_context(|| format!("write {}", path.display()))?;
            entry.screenshot = Some(name);
        }
        if let Some(tree) = &step.observation.a11y_tree {
            let (path, name) = file_name(paths.step_file(step.index, &stamp, "a11y.txt"))?;
            write_text(&path, tree)?;
            entry.a11y_tree = Some(name);
        }

        write_json(&paths.request_path, &step.payload)?;

        let mut line = serde_json::to_string(&entry).context("serialize trajectory entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.traj_path)
            .with_context(|| format!("open {}", paths.traj_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", paths.traj_path.display()))
    }

    fn write_result(&mut self, identity: &str, passed: bool) -> Result<()> {
        let paths = self.paths(identity);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create task dir {}", paths.dir.display()))?;
        write_text(&paths.result_path, if passed { "1" } else { "0" })
    }

    fn write_meta(&mut self, identity: &str, meta: &TaskMeta) -> Result<()> {
        let paths = self.paths(identity);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create task dir {}", paths.dir.display()))?;
        write_json(&paths.meta_path, meta)
    }
}

/// One task line of a batch summary. `outcome` is `None` for tasks already complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub identity: String,
    pub session: String,
    pub outcome: Option<TaskOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub tasks_root: PathBuf,
    pub started_at: String,
    pub ended_at: String,
    pub counter: Counter,
    pub tasks: Vec<TaskSummary>,
    pub rejected: Vec<Rejection>,
}

pub fn write_summary(root: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("create logs dir {}", root.display()))?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
    let path = root.join(format!("SUM@{stamp}.json"));
    write_json(&path, summary)?;
    Ok(path)
}

/// What the logs root says about one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub identity: String,
    pub dir: PathBuf,
    pub passed: Option<bool>,
    pub meta: Option<TaskMeta>,
}

/// Scan the logs root for task directories. Unreadable entries become warnings.
pub fn scan_records(root: &Path) -> Result<(Vec<TaskRecord>, Vec<String>)> {
    if !root.is_dir() {
        bail!("logs path {} is not a directory", root.display());
    }
    let mut records = Vec::new();
    let mut warnings = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_dir() || entry.path() == root {
            continue;
        }
        let dir = entry.path();
        let result_path = dir.join(RESULT_FILE);
        let meta_path = dir.join("meta.json");
        if !result_path.exists() && !meta_path.exists() {
            continue;
        }
        let identity = dir
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", dir.display(), root.display()))?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let passed = match fs::read_to_string(&result_path) {
            Ok(text) => match text.trim() {
                "1" => Some(true),
                "0" => Some(false),
                other => {
                    warnings.push(format!("{identity}: malformed result marker {other:?}"));
                    None
                }
            },
            Err(_) => None,
        };
        let meta = match fs::read_to_string(&meta_path) {
            Ok(text) => match serde_json::from_str::<TaskMeta>(&text) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warnings.push(format!("{identity}: malformed meta.json: {err}"));
                    None
                }
            },
            Err(_) => None,
        };
        records.push(TaskRecord {
            identity,
            dir: dir.to_path_buf(),
            passed,
            meta,
        });
    }
    for warning in &warnings {
        warn!("{warning}");
    }
    Ok((records, warnings))
}

/// Delete the results of tasks whose identity starts with `prefix` (all when
/// `None`). A task directory goes away once nothing else is left in it.
pub fn clean_records(root: &Path, prefix: Option<&str>) -> Result<Vec<String>> {
    let (records, _) = scan_records(root)?;
    let mut removed = Vec::new();
    // Nested identities come after their parent; children go first.
    for record in records.into_iter().rev() {
        if prefix.is_some_and(|prefix| !record.identity.starts_with(prefix)) {
            continue;
        }
        remove_artifacts(&record.dir)?;
        let empty = fs::read_dir(&record.dir)
            .with_context(|| format!("read {}", record.dir.display()))?
            .next()
            .is_none();
        if empty {
            fs::remove_dir(&record.dir)
                .with_context(|| format!("remove {}", record.dir.display()))?;
        }
        removed.push(record.identity);
    }
    removed.reverse();
    Ok(removed)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
