//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between the task state machine, the
//! agent loop, and the scheduler. They carry no I/O and serialize to stable
//! snake/upper-case strings used in trajectories and metadata.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Fixed vocabulary an agent's action stream may use to end or pause a prediction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Primitive {
    Done,
    Fail,
    Wait,
    Timeout,
}

impl Primitive {
    /// Primitives an agent may emit itself. `TIMEOUT` is only ever raised by the engine.
    pub const EMITTABLE: [Primitive; 3] = [Primitive::Done, Primitive::Fail, Primitive::Wait];

    pub fn as_str(self) -> &'static str {
        match self {
            Primitive::Done => "DONE",
            Primitive::Fail => "FAIL",
            Primitive::Wait => "WAIT",
            Primitive::Timeout => "TIMEOUT",
        }
    }

    /// One-line usage hint rendered into the system prompt.
    pub fn describe(self) -> &'static str {
        match self {
            Primitive::Done => "When you think the task is done, return DONE.",
            Primitive::Fail => {
                "When you think the task can not be done, return FAIL. Try your best before giving up."
            }
            Primitive::Wait => "When you think you have to wait for some time, return WAIT.",
            Primitive::Timeout => "Raised by the runner when the step budget is exhausted.",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Primitive {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DONE" => Ok(Primitive::Done),
            "FAIL" => Ok(Primitive::Fail),
            "WAIT" => Ok(Primitive::Wait),
            "TIMEOUT" => Ok(Primitive::Timeout),
            other => Err(anyhow!("unknown primitive '{other}'")),
        }
    }
}

/// Why the prediction loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopReason {
    Done,
    Fail,
    Timeout,
}

impl StopReason {
    pub fn as_primitive(self) -> Primitive {
        match self {
            StopReason::Done => Primitive::Done,
            StopReason::Fail => Primitive::Fail,
            StopReason::Timeout => Primitive::Timeout,
        }
    }
}

/// Result of executing one parsed action inside the prediction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFlow {
    Continue,
    Done,
    Fail,
}

/// Terminal classification of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Passed,
    Failed,
    Errored,
}

/// Whether a session runs the application directly or inside a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionClass {
    Raw,
    #[serde(rename = "VM")]
    Vm,
}

impl SessionClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionClass::Raw => "Raw",
            SessionClass::Vm => "VM",
        }
    }
}

impl fmt::Display for SessionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grouping key: tasks sharing a key share one session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub kind: String,
    pub class: SessionClass,
}

impl SessionKey {
    pub fn new(kind: impl Into<String>, class: SessionClass) -> Self {
        Self {
            kind: kind.into(),
            class,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.class)
    }
}

/// Observation channel an agent may request from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObsKind {
    Textual,
    Screenshot,
    A11yTree,
}

/// Aggregate task outcomes for one batch.
///
/// `skipped` counts tasks that errored; `ignored` counts tasks already complete
/// from an earlier run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

impl Counter {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.ignored
    }

    pub fn absorb(&mut self, other: &Counter) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.ignored += other.ignored;
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total tested: {} passed, {} failed, {} skipped, {} ignored.",
            self.total(),
            self.passed,
            self.failed,
            self.skipped,
            self.ignored
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_parse_from_upper_case_names() {
        for primitive in [
            Primitive::Done,
            Primitive::Fail,
            Primitive::Wait,
            Primitive::Timeout,
        ] {
            assert_eq!(primitive.as_str().parse::<Primitive>().expect("parse"), primitive);
        }
        assert!("done".parse::<Primitive>().is_err());
    }

    #[test]
    fn session_class_uses_spec_file_names() {
        let raw: SessionClass = serde_json::from_str("\"Raw\"").expect("raw");
        let vm: SessionClass = serde_json::from_str("\"VM\"").expect("vm");
        assert_eq!(raw, SessionClass::Raw);
        assert_eq!(vm, SessionClass::Vm);
        assert_eq!(SessionKey::new("ChimeraX", vm).to_string(), "ChimeraX:VM");
    }

    #[test]
    fn stop_reason_maps_to_primitive() {
        assert_eq!(StopReason::Timeout.as_primitive(), Primitive::Timeout);
        assert_eq!(
            serde_json::to_string(&StopReason::Done).expect("json"),
            "\"DONE\""
        );
    }

    #[test]
    fn counter_reports_totals() {
        let mut counter = Counter {
            passed: 2,
            failed: 1,
            skipped: 0,
            ignored: 3,
        };
        counter.absorb(&Counter {
            skipped: 1,
            ..Counter::default()
        });
        assert_eq!(
            counter.to_string(),
            "7 total tested: 2 passed, 1 failed, 1 skipped, 3 ignored."
        );
    }
}
