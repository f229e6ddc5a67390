//! Closed predicate mini-language for resolving keys inside a state snapshot.
//!
//! Rules in a TaskSpec describe *which* snapshot entry they inspect with small
//! JSON matcher objects instead of executable code. The `*Spec` types are the
//! serde shapes; [`KeyMatcher`], [`EntryMatcher`] and [`Projection`] are the
//! compiled forms (regexes built once at load time).

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Matcher over snapshot keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMatcherSpec {
    Eq(String),
    Regex(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    In(Vec<String>),
    All(Vec<KeyMatcherSpec>),
    Any(Vec<KeyMatcherSpec>),
    Not(Box<KeyMatcherSpec>),
}

/// Matcher over snapshot values, optionally scoped by a JSON pointer.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueMatcherSpec {
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default)]
    pub eq: Option<Value>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default, rename = "in")]
    pub one_of: Option<Vec<Value>>,
    #[serde(default)]
    pub exists: Option<bool>,
}

/// Matcher over `(key, value)` snapshot entries, used by `find`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMatcherSpec {
    Key(KeyMatcherSpec),
    Value(ValueMatcherSpec),
    All(Vec<EntryMatcherSpec>),
    Any(Vec<EntryMatcherSpec>),
    Not(Box<EntryMatcherSpec>),
}

/// Transformation applied to a found key to obtain the lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectionSpec {
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub strip_suffix: Option<String>,
    #[serde(default)]
    pub prepend: Option<String>,
    #[serde(default)]
    pub append: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub with: Option<String>,
}

/// The `key` field of a rule: a literal key or a key matcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KeySelectorSpec {
    Literal(String),
    Matcher(KeyMatcherSpec),
}

/// The `key` field of a rule that also carries `find`: a literal key or a projection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProjectionSelectorSpec {
    Literal(String),
    Transform(ProjectionSpec),
}

#[derive(Debug, Clone)]
pub enum KeyMatcher {
    Eq(String),
    Regex(Regex),
    Prefix(String),
    Suffix(String),
    Contains(String),
    In(BTreeSet<String>),
    All(Vec<KeyMatcher>),
    Any(Vec<KeyMatcher>),
    Not(Box<KeyMatcher>),
}

impl KeyMatcher {
    pub fn compile(spec: &KeyMatcherSpec) -> Result<Self> {
        Ok(match spec {
            KeyMatcherSpec::Eq(s) => KeyMatcher::Eq(s.clone()),
            KeyMatcherSpec::Regex(pattern) => KeyMatcher::Regex(compile_regex(pattern)?),
            KeyMatcherSpec::Prefix(s) => KeyMatcher::Prefix(s.clone()),
            KeyMatcherSpec::Suffix(s) => KeyMatcher::Suffix(s.clone()),
            KeyMatcherSpec::Contains(s) => KeyMatcher::Contains(s.clone()),
            KeyMatcherSpec::In(items) => KeyMatcher::In(items.iter().cloned().collect()),
            KeyMatcherSpec::All(items) => KeyMatcher::All(compile_keys(items)?),
            KeyMatcherSpec::Any(items) => KeyMatcher::Any(compile_keys(items)?),
            KeyMatcherSpec::Not(inner) => KeyMatcher::Not(Box::new(KeyMatcher::compile(inner)?)),
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Eq(s) => key == s,
            KeyMatcher::Regex(re) => re.is_match(key),
            KeyMatcher::Prefix(s) => key.starts_with(s.as_str()),
            KeyMatcher::Suffix(s) => key.ends_with(s.as_str()),
            KeyMatcher::Contains(s) => key.contains(s.as_str()),
            KeyMatcher::In(set) => set.contains(key),
            KeyMatcher::All(items) => items.iter().all(|m| m.matches(key)),
            KeyMatcher::Any(items) => items.iter().any(|m| m.matches(key)),
            KeyMatcher::Not(inner) => !inner.matches(key),
        }
    }
}

fn compile_keys(items: &[KeyMatcherSpec]) -> Result<Vec<KeyMatcher>> {
    items.iter().map(KeyMatcher::compile).collect()
}

#[derive(Debug, Clone)]
enum ValueTest {
    Eq(Value),
    Regex(Regex),
    In(Vec<Value>),
    Exists(bool),
}

#[derive(Debug, Clone)]
pub struct ValueMatcher {
    at: Option<String>,
    test: ValueTest,
}

impl ValueMatcher {
    pub fn compile(spec: &ValueMatcherSpec) -> Result<Self> {
        if let Some(pointer) = &spec.at
            && !pointer.is_empty()
            && !pointer.starts_with('/')
        {
            bail!("value matcher 'at' must be a JSON pointer starting with '/'");
        }
        let mut tests = Vec::new();
        if let Some(value) = &spec.eq {
            tests.push(ValueTest::Eq(value.clone()));
        }
        if let Some(pattern) = &spec.regex {
            tests.push(ValueTest::Regex(compile_regex(pattern)?));
        }
        if let Some(values) = &spec.one_of {
            tests.push(ValueTest::In(values.clone()));
        }
        if let Some(exists) = spec.exists {
            tests.push(ValueTest::Exists(exists));
        }
        if tests.len() != 1 {
            bail!("value matcher needs exactly one of eq, regex, in, exists");
        }
        Ok(Self {
            at: spec.at.clone(),
            test: tests.remove(0),
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        let target = match &self.at {
            Some(pointer) => value.pointer(pointer),
            None => Some(value),
        };
        match (&self.test, target) {
            (ValueTest::Exists(expected), target) => target.is_some() == *expected,
            (_, None) => false,
            (ValueTest::Eq(expected), Some(actual)) => expected == actual,
            (ValueTest::Regex(re), Some(actual)) => re.is_match(&coerce_to_string(actual)),
            (ValueTest::In(values), Some(actual)) => values.contains(actual),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EntryMatcher {
    Key(KeyMatcher),
    Value(ValueMatcher),
    All(Vec<EntryMatcher>),
    Any(Vec<EntryMatcher>),
    Not(Box<EntryMatcher>),
}

impl EntryMatcher {
    pub fn compile(spec: &EntryMatcherSpec) -> Result<Self> {
        Ok(match spec {
            EntryMatcherSpec::Key(key) => EntryMatcher::Key(KeyMatcher::compile(key)?),
            EntryMatcherSpec::Value(value) => EntryMatcher::Value(ValueMatcher::compile(value)?),
            EntryMatcherSpec::All(items) => EntryMatcher::All(compile_entries(items)?),
            EntryMatcherSpec::Any(items) => EntryMatcher::Any(compile_entries(items)?),
            EntryMatcherSpec::Not(inner) => {
                EntryMatcher::Not(Box::new(EntryMatcher::compile(inner)?))
            }
        })
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self {
            EntryMatcher::Key(matcher) => matcher.matches(key),
            EntryMatcher::Value(matcher) => matcher.matches(value),
            EntryMatcher::All(items) => items.iter().all(|m| m.matches(key, value)),
            EntryMatcher::Any(items) => items.iter().any(|m| m.matches(key, value)),
            EntryMatcher::Not(inner) => !inner.matches(key, value),
        }
    }
}

fn compile_entries(items: &[EntryMatcherSpec]) -> Result<Vec<EntryMatcher>> {
    items.iter().map(EntryMatcher::compile).collect()
}

#[derive(Debug, Clone)]
pub enum Projection {
    Identity,
    Literal(String),
    StripPrefix(String),
    StripSuffix(String),
    Prepend(String),
    Append(String),
    Replace(Regex, String),
}

impl Projection {
    pub fn compile(spec: Option<&ProjectionSelectorSpec>) -> Result<Self> {
        let spec = match spec {
            None => return Ok(Projection::Identity),
            Some(ProjectionSelectorSpec::Literal(key)) => {
                return Ok(Projection::Literal(key.clone()));
            }
            Some(ProjectionSelectorSpec::Transform(spec)) => spec,
        };
        let mut ops = Vec::new();
        if let Some(s) = &spec.strip_prefix {
            ops.push(Projection::StripPrefix(s.clone()));
        }
        if let Some(s) = &spec.strip_suffix {
            ops.push(Projection::StripSuffix(s.clone()));
        }
        if let Some(s) = &spec.prepend {
            ops.push(Projection::Prepend(s.clone()));
        }
        if let Some(s) = &spec.append {
            ops.push(Projection::Append(s.clone()));
        }
        match (&spec.replace, &spec.with) {
            (Some(pattern), Some(with)) => {
                ops.push(Projection::Replace(compile_regex(pattern)?, with.clone()));
            }
            (Some(_), None) => bail!("projection 'replace' requires 'with'"),
            (None, Some(_)) => bail!("projection 'with' requires 'replace'"),
            (None, None) => {}
        }
        if ops.len() != 1 {
            bail!(
                "projection needs exactly one of strip_prefix, strip_suffix, prepend, append, replace"
            );
        }
        Ok(ops.remove(0))
    }

    pub fn apply(&self, key: &str) -> String {
        match self {
            Projection::Identity => key.to_string(),
            Projection::Literal(literal) => literal.clone(),
            Projection::StripPrefix(prefix) => {
                key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string()
            }
            Projection::StripSuffix(suffix) => {
                key.strip_suffix(suffix.as_str()).unwrap_or(key).to_string()
            }
            Projection::Prepend(prefix) => format!("{prefix}{key}"),
            Projection::Append(suffix) => format!("{key}{suffix}"),
            Projection::Replace(re, with) => re.replace_all(key, with.as_str()).into_owned(),
        }
    }
}

/// Canonical string form used by regex comparisons: strings as-is, everything else as compact JSON.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))
}
