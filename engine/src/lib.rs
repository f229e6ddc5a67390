//! Benchmark execution engine for LLM agents driving real applications.
//!
//! A batch loads a corpus of TaskSpecs, folds them into groups sharing a
//! session, and runs every task through a fixed state machine: initialize the
//! application, let the agent act for a bounded number of turns, then evaluate
//! declarative rules against the final application state. The architecture
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (signals, predicates, rules,
//!   action parsing, conversation windowing, grouping). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, TaskSpec loading,
//!   sessions, model endpoints, prompts, the result recorder). Each sits behind
//!   a trait or plain data so tests can substitute doubles.
//!
//! Orchestration modules ([`agent`], [`task`], [`scheduler`], [`batch`]) wire
//! core logic to I/O.

pub mod agent;
pub mod batch;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
