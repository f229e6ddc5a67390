//! TaskSpec discovery and loading.
//!
//! A task corpus is a directory tree of `*.json` files, one TaskSpec each.
//! Loading runs three gates in order: the embedded JSON Schema, strict serde
//! deserialization, then semantic checks and rule compilation. A file that
//! fails any gate is rejected and never attempted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, instrument};
use walkdir::WalkDir;

use crate::core::rule::{EvalRule, RuleSpec};
use crate::core::types::{SessionClass, SessionKey};

const TASK_SPEC_SCHEMA: &str = include_str!("../../schemas/task_spec.schema.json");

/// Baseline a VM-class session restores to when a spec does not name one.
pub const DEFAULT_SNAPSHOT: &str = "init_state";

/// On-disk TaskSpec document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskSpecFile {
    #[serde(rename = "type")]
    kind: String,
    sort: SessionClass,
    steps: u32,
    instruction: String,
    initialize: Vec<InitStep>,
    evaluate: Vec<RuleSpec>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    snapshot: Option<String>,
}

/// One initialization call: a registered step name plus its keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitStep {
    pub func: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

/// A loaded, validated TaskSpec.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Path relative to the corpus root without extension, `/`-separated.
    pub identity: String,
    pub path: PathBuf,
    pub sha256: String,
    pub key: SessionKey,
    pub step_budget: u32,
    pub instruction: String,
    pub init_steps: Vec<InitStep>,
    pub rules: Vec<EvalRule>,
    pub version: Option<String>,
    pub snapshot: String,
}

/// A corpus file that failed to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub identity: String,
    pub path: PathBuf,
    pub reason: String,
}

/// Every TaskSpec under a corpus root, split by load outcome.
#[derive(Debug, Default)]
pub struct Corpus {
    pub accepted: Vec<TaskSpec>,
    pub rejected: Vec<Rejection>,
}

pub fn compile_schema() -> Result<Validator> {
    let schema: Value =
        serde_json::from_str(TASK_SPEC_SCHEMA).context("parse embedded task spec schema")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile task spec schema: {err}"))
}

/// List every `*.json` file under `root` in lexicographic traversal order.
pub fn discover_task_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("tasks path {} is not a directory", root.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

pub fn task_identity(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    let stem = relative.with_extension("");
    let parts: Vec<String> = stem
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        bail!("empty task identity for {}", path.display());
    }
    Ok(parts.join("/"))
}

/// Parse and validate one TaskSpec document.
pub fn parse_task_spec(
    schema: &Validator,
    identity: &str,
    path: &Path,
    contents: &str,
) -> Result<TaskSpec> {
    let raw: Value = serde_json::from_str(contents).context("parse json")?;
    let messages: Vec<String> = schema.iter_errors(&raw).map(|err| err.to_string()).collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    let file: TaskSpecFile = serde_json::from_value(raw).context("deserialize task spec")?;

    if file.steps == 0 {
        bail!("steps must be > 0");
    }
    if file.instruction.trim().is_empty() {
        bail!("instruction must be non-empty");
    }
    if let Some(index) = file
        .initialize
        .iter()
        .position(|step| step.func.trim().is_empty())
    {
        bail!("initialize[{index}].func must be non-empty");
    }
    let rules = file
        .evaluate
        .iter()
        .enumerate()
        .map(|(index, spec)| EvalRule::compile(spec).with_context(|| format!("evaluate[{index}]")))
        .collect::<Result<Vec<_>>>()?;
    if rules.iter().filter(|rule| rule.is_stop()).count() > 1 {
        bail!("evaluate holds more than one stop rule");
    }

    Ok(TaskSpec {
        identity: identity.to_string(),
        path: path.to_path_buf(),
        sha256: sha256_hex(contents.as_bytes()),
        key: SessionKey::new(file.kind, file.sort),
        step_budget: file.steps,
        instruction: file.instruction,
        init_steps: file.initialize,
        rules,
        version: file.version,
        snapshot: file.snapshot.unwrap_or_else(|| DEFAULT_SNAPSHOT.to_string()),
    })
}

pub fn load_task_spec(schema: &Validator, root: &Path, path: &Path) -> Result<TaskSpec> {
    let identity = task_identity(root, path)?;
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_task_spec(schema, &identity, path, &contents)
        .with_context(|| format!("load task spec {}", path.display()))
}

/// Load every TaskSpec under `root`.
///
/// `admit` runs after a spec parses and lets the caller reject it against the
/// environment, e.g. a missing session or a version mismatch.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn load_corpus<F>(root: &Path, admit: F) -> Result<Corpus>
where
    F: Fn(&TaskSpec) -> Result<()>,
{
    let schema = compile_schema()?;
    let mut corpus = Corpus::default();
    for path in discover_task_files(root)? {
        let identity = task_identity(root, &path)?;
        let loaded = load_task_spec(&schema, root, &path)
            .and_then(|spec| admit(&spec).map(|()| spec));
        match loaded {
            Ok(spec) => {
                debug!(task = %spec.identity, key = %spec.key, "task accepted");
                corpus.accepted.push(spec);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(task = %identity, %reason, "task config rejected");
                corpus.rejected.push(Rejection {
                    identity,
                    path,
                    reason,
                });
            }
        }
    }
    Ok(corpus)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_a() -> Value {
        json!({
            "type": "ChimeraX",
            "sort": "Raw",
            "steps": 5,
            "instruction": "Color the model red.",
            "initialize": [{"func": "open", "name": "demo"}],
            "evaluate": [{"type": "states", "key": "color", "value": "red"}]
        })
    }

    fn parse(raw: &Value) -> Result<TaskSpec> {
        let schema = compile_schema().expect("schema");
        parse_task_spec(&schema, "demo", Path::new("demo.json"), &raw.to_string())
    }

    #[test]
    fn parses_minimal_spec() {
        let spec = parse(&scenario_a()).expect("parse");
        assert_eq!(spec.key, SessionKey::new("ChimeraX", SessionClass::Raw));
        assert_eq!(spec.step_budget, 5);
        assert_eq!(spec.init_steps[0].func, "open");
        assert_eq!(spec.init_steps[0].args["name"], "demo");
        assert_eq!(spec.rules.len(), 1);
        assert_eq!(spec.snapshot, DEFAULT_SNAPSHOT);
        assert_eq!(spec.sha256.len(), 64);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let mut raw = scenario_a();
        raw["extra"] = json!(true);
        let err = parse(&raw).expect_err("unknown key");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_zero_steps_and_bad_sort() {
        let mut raw = scenario_a();
        raw["steps"] = json!(0);
        assert!(parse(&raw).is_err());
        let mut raw = scenario_a();
        raw["sort"] = json!("Docker");
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn rejects_rule_without_discipline() {
        let mut raw = scenario_a();
        raw["evaluate"] = json!([{"type": "states", "key": "color"}]);
        let err = parse(&raw).expect_err("no discipline");
        assert!(format!("{err:#}").contains("evaluate[0]"));
    }

    #[test]
    fn rejects_two_stop_rules() {
        let mut raw = scenario_a();
        raw["evaluate"] = json!([
            {"type": "stop", "value": "DONE"},
            {"type": "stop", "value": "FAIL"}
        ]);
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn identity_is_relative_slash_path_without_extension() {
        let root = Path::new("/tasks");
        let identity =
            task_identity(root, Path::new("/tasks/ChimeraX/color/01.json")).expect("identity");
        assert_eq!(identity, "ChimeraX/color/01");
    }

    #[test]
    fn corpus_is_lexicographic_and_splits_rejections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("b")).expect("mkdir");
        fs::create_dir_all(root.join("a")).expect("mkdir");
        fs::write(root.join("b/2.json"), scenario_a().to_string()).expect("write");
        fs::write(root.join("a/1.json"), scenario_a().to_string()).expect("write");
        fs::write(root.join("a/0.json"), "{not json").expect("write");
        fs::write(root.join("a/notes.txt"), "ignored").expect("write");

        let corpus = load_corpus(root, |_| Ok(())).expect("corpus");
        let accepted: Vec<&str> = corpus
            .accepted
            .iter()
            .map(|spec| spec.identity.as_str())
            .collect();
        assert_eq!(accepted, vec!["a/1", "b/2"]);
        assert_eq!(corpus.rejected.len(), 1);
        assert_eq!(corpus.rejected[0].identity, "a/0");
    }

    #[test]
    fn admit_hook_rejects_specs() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("t.json"), scenario_a().to_string()).expect("write");
        let corpus = load_corpus(temp.path(), |spec| {
            bail!("no session registered for {}", spec.key)
        })
        .expect("corpus");
        assert!(corpus.accepted.is_empty());
        assert!(corpus.rejected[0].reason.contains("ChimeraX:Raw"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_corpus(&temp.path().join("missing"), |_| Ok(())).is_err());
    }
}
