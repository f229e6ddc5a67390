//! Evaluation rules and the snapshot predicate engine.
//!
//! A TaskSpec's `evaluate` array deserializes into [`RuleSpec`] values which are
//! compiled once at load time into [`EvalRule`]. Rules that only need the state
//! snapshot (`states`, `near`) are decided here; `info` and `file` rules need a
//! live session and are decided by the task using the comparison helpers below.

use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::predicate::{
    EntryMatcher, EntryMatcherSpec, KeyMatcher, KeySelectorSpec, Projection,
    ProjectionSelectorSpec, coerce_to_string,
};
use crate::core::types::{Primitive, StopReason};

/// State dump reported by a session: string keys to arbitrary (possibly nested) values,
/// iterated in the order the application reported them.
pub type StateSnapshot = Map<String, Value>;

const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Raw rule object as written in a TaskSpec.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RuleSpec {
    Stop {
        value: Primitive,
    },
    States {
        #[serde(default)]
        find: Option<EntryMatcherSpec>,
        #[serde(default)]
        key: Option<Value>,
        #[serde(default, deserialize_with = "present")]
        value: Option<Value>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        set: Option<Vec<String>>,
    },
    Info {
        key: String,
        value: Vec<String>,
    },
    File {
        key: String,
        value: String,
    },
    Near {
        key: String,
        value: f64,
        #[serde(default)]
        tolerance: Option<f64>,
    },
}

/// Keeps an explicit `null` distinct from a missing field.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// How a `states` rule finds the snapshot entry it inspects.
#[derive(Debug, Clone)]
pub enum KeyResolver {
    /// First entry satisfying the finder, key passed through the projection.
    FindThenProject {
        finder: EntryMatcher,
        projection: Projection,
    },
    /// First snapshot key satisfying the matcher.
    Matching(KeyMatcher),
    Literal(String),
}

impl KeyResolver {
    /// Resolve to a key present in the snapshot, or `None`.
    pub fn resolve<'a>(&self, snapshot: &'a StateSnapshot) -> Option<(&'a String, &'a Value)> {
        match self {
            KeyResolver::FindThenProject { finder, projection } => {
                let (found, _) = snapshot
                    .iter()
                    .find(|(key, value)| finder.matches(key, value))?;
                snapshot.get_key_value(&projection.apply(found))
            }
            KeyResolver::Matching(matcher) => snapshot.iter().find(|(key, _)| matcher.matches(key)),
            KeyResolver::Literal(key) => snapshot.get_key_value(key),
        }
    }
}

/// Comparison discipline of a `states` rule.
#[derive(Debug, Clone)]
pub enum Expectation {
    /// Regex against the string-coerced value.
    Pattern(Regex),
    /// Structural equality, no coercion.
    Value(Value),
    /// Unordered set of lines.
    Set(BTreeSet<String>),
    /// Null-check: passes iff nothing resolves.
    Absent,
}

#[derive(Debug, Clone)]
pub struct StatesRule {
    pub resolver: KeyResolver,
    pub expect: Expectation,
}

/// First rule that failed during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRule {
    /// Position in the task's `evaluate` array.
    pub index: usize,
    pub kind: String,
}

/// A compiled evaluation rule.
#[derive(Debug, Clone)]
pub enum EvalRule {
    Stop(StopReason),
    States(StatesRule),
    Info {
        key: String,
        lines: BTreeSet<String>,
    },
    File {
        path: String,
        needle: String,
    },
    Near {
        key: String,
        value: f64,
        tolerance: f64,
    },
}

impl EvalRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        match spec {
            RuleSpec::Stop { value } => {
                let reason = match value {
                    Primitive::Done => StopReason::Done,
                    Primitive::Fail => StopReason::Fail,
                    Primitive::Timeout => StopReason::Timeout,
                    Primitive::Wait => bail!("stop rule value must be DONE, FAIL or TIMEOUT"),
                };
                Ok(EvalRule::Stop(reason))
            }
            RuleSpec::States {
                find,
                key,
                value,
                pattern,
                set,
            } => {
                let resolver = compile_resolver(find.as_ref(), key.as_ref())?;
                let expect = compile_expectation(value.as_ref(), pattern.as_deref(), set.as_deref())?;
                Ok(EvalRule::States(StatesRule { resolver, expect }))
            }
            RuleSpec::Info { key, value } => {
                if key.trim().is_empty() {
                    bail!("info.key must be non-empty");
                }
                Ok(EvalRule::Info {
                    key: key.clone(),
                    lines: value.iter().cloned().collect(),
                })
            }
            RuleSpec::File { key, value } => {
                if key.trim().is_empty() {
                    bail!("file.key must be non-empty");
                }
                Ok(EvalRule::File {
                    path: key.clone(),
                    needle: value.clone(),
                })
            }
            RuleSpec::Near {
                key,
                value,
                tolerance,
            } => {
                let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);
                if !tolerance.is_finite() || tolerance < 0.0 {
                    bail!("near.tolerance must be a non-negative number");
                }
                Ok(EvalRule::Near {
                    key: key.clone(),
                    value: *value,
                    tolerance,
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EvalRule::Stop(_) => "stop",
            EvalRule::States(_) => "states",
            EvalRule::Info { .. } => "info",
            EvalRule::File { .. } => "file",
            EvalRule::Near { .. } => "near",
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, EvalRule::Stop(_))
    }
}

fn compile_resolver(find: Option<&EntryMatcherSpec>, key: Option<&Value>) -> Result<KeyResolver> {
    if let Some(find) = find {
        let finder = EntryMatcher::compile(find).context("states.find")?;
        let projection = match key {
            Some(raw) => {
                let spec: ProjectionSelectorSpec = serde_json::from_value(raw.clone())
                    .map_err(|err| anyhow!("states.key is not a projection: {err}"))?;
                Projection::compile(Some(&spec)).context("states.key")?
            }
            None => Projection::Identity,
        };
        return Ok(KeyResolver::FindThenProject { finder, projection });
    }
    let raw = key.ok_or_else(|| anyhow!("states.key is required without find"))?;
    let selector: KeySelectorSpec = serde_json::from_value(raw.clone())
        .map_err(|err| anyhow!("states.key is not a key selector: {err}"))?;
    match selector {
        KeySelectorSpec::Literal(key) => Ok(KeyResolver::Literal(key)),
        KeySelectorSpec::Matcher(spec) => Ok(KeyResolver::Matching(
            KeyMatcher::compile(&spec).context("states.key")?,
        )),
    }
}

fn compile_expectation(
    value: Option<&Value>,
    pattern: Option<&str>,
    set: Option<&[String]>,
) -> Result<Expectation> {
    match (value, pattern, set) {
        (Some(Value::Null), None, None) => Ok(Expectation::Absent),
        (Some(value), None, None) => Ok(Expectation::Value(value.clone())),
        (None, Some(pattern), None) => Ok(Expectation::Pattern(
            Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?,
        )),
        (None, None, Some(lines)) => Ok(Expectation::Set(lines.iter().cloned().collect())),
        (None, None, None) => bail!("states rule needs one of value, pattern, set"),
        _ => bail!("states rule must use only one of value, pattern, set"),
    }
}

/// Decide a `states` rule against one snapshot.
pub fn evaluate_states(rule: &StatesRule, snapshot: &StateSnapshot) -> bool {
    let resolved = rule.resolver.resolve(snapshot).map(|(_, value)| value);
    match (&rule.expect, resolved) {
        (Expectation::Absent, resolved) => resolved.is_none(),
        (_, None) => false,
        (Expectation::Pattern(re), Some(actual)) => re.is_match(&coerce_to_string(actual)),
        (Expectation::Value(expected), Some(actual)) => expected == actual,
        (Expectation::Set(expected), Some(actual)) => value_lines(actual) == *expected,
    }
}

/// Decide a `near` rule against one snapshot. Numeric strings are accepted.
pub fn evaluate_near(key: &str, expected: f64, tolerance: f64, snapshot: &StateSnapshot) -> bool {
    let actual = match snapshot.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    actual.is_some_and(|actual| (actual - expected).abs() <= tolerance)
}

/// Split command messages into the set of their non-empty trimmed lines.
pub fn message_lines<S: AsRef<str>>(messages: &[S]) -> BTreeSet<String> {
    messages
        .iter()
        .flat_map(|message| message.as_ref().lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_lines(value: &Value) -> BTreeSet<String> {
    match value {
        Value::Array(items) => items.iter().map(coerce_to_string).collect(),
        Value::String(s) => message_lines(&[s]),
        other => BTreeSet::from([coerce_to_string(other)]),
    }
}
