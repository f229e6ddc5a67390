//! Conversational agent loop.
//!
//! The agent owns the full conversation and sends a bounded suffix of it
//! upstream. One call recovers from two failure kinds independently:
//!
//! - overflow: withdraw the pending user turn, shrink the window by one
//!   turn-pair, and resend; once the window is empty a further overflow is fatal.
//! - transient: withdraw the pending turn, back off, and resend with one retry
//!   fewer; running out of retries is fatal.
//!
//! Both fatal outcomes are task-scoped errors.

use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::actions::{Action, parse_actions};
use crate::core::window::{Content, ConversationState, Turn};
use crate::io::config::AgentConfig;
use crate::io::model::{CallError, ModelEndpoint};
use crate::io::prompt::{PromptEngine, SystemPrompt};
use crate::io::session::Observation;

/// The window shrank to nothing and the model still overflowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowUnsolvable {
    pub context_window: usize,
    pub detail: String,
}

impl fmt::Display for OverflowUnsolvable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "context overflow persists after shrinking a {}-pair window to zero: {}",
            self.context_window, self.detail
        )
    }
}

impl std::error::Error for OverflowUnsolvable {}

/// Transient failures outlasted the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesExhausted {
    pub attempts: u32,
    pub detail: String,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model call failed after {} attempts: {}",
            self.attempts, self.detail
        )
    }
}

impl std::error::Error for RetriesExhausted {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub context_window: usize,
    pub retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            context_window: cfg.context_window,
            retries: cfg.retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
            backoff_max: Duration::from_millis(cfg.retry_backoff_max_ms),
        }
    }
}

impl AgentSettings {
    /// Pause before the `attempt`-th retry (0-based): doubling, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Result of one successful agent step.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub turn: Turn,
    pub actions: Vec<Action>,
    /// Payload of the successful upstream call.
    pub payload: Vec<Turn>,
    pub overflow_retries: usize,
    pub transient_retries: u32,
}

pub struct Agent<E> {
    endpoint: E,
    settings: AgentSettings,
    prompts: PromptEngine,
    state: ConversationState,
}

impl<E: ModelEndpoint> Agent<E> {
    pub fn new(endpoint: E, settings: AgentSettings, prompts: PromptEngine) -> Self {
        Self {
            endpoint,
            settings,
            prompts,
            state: ConversationState::default(),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.state
    }

    /// Reset the conversation for a new task.
    pub fn begin(&mut self, system: &SystemPrompt<'_>) -> Result<()> {
        let text = self.prompts.render_system(system)?;
        self.state.begin(Turn::system(text));
        Ok(())
    }

    /// Build the user turn for a step (`step` is 1-based) and call the model.
    pub fn step(&mut self, step: u32, budget: u32, observation: &Observation) -> Result<AgentReply> {
        let contents = self.prompts.step_contents(step, budget, observation)?;
        self.call(contents)
    }

    /// Append a user turn and call upstream until a reply arrives or a budget runs out.
    #[instrument(skip_all, fields(model = %self.endpoint.model_name()))]
    pub fn call(&mut self, contents: Vec<Content>) -> Result<AgentReply> {
        if self.state.system().is_none() {
            return Err(anyhow!("agent called before begin()"));
        }
        let window = self.settings.context_window;
        let mut pending = Turn::user(contents);
        let mut shorten = 0usize;
        let mut retry = self.settings.retries;

        loop {
            self.state.push(pending);
            let payload = self.state.payload(window - shorten);
            let failure = match self.endpoint.complete(&payload) {
                Ok(text) => {
                    let turn = Turn::assistant(text);
                    self.state.push(turn.clone());
                    let actions = parse_actions(&turn.text());
                    debug!(actions = actions.len(), shorten, "model replied");
                    return Ok(AgentReply {
                        turn,
                        actions,
                        payload,
                        overflow_retries: shorten,
                        transient_retries: self.settings.retries - retry,
                    });
                }
                Err(failure) => failure,
            };
            pending = self
                .state
                .pop()
                .ok_or_else(|| anyhow!("conversation lost its pending user turn"))?;

            match failure {
                CallError::Overflow(detail) => {
                    if shorten == window {
                        return Err(OverflowUnsolvable {
                            context_window: window,
                            detail,
                        }
                        .into());
                    }
                    shorten += 1;
                    warn!(shorten, %detail, "context overflow, shrinking window");
                }
                CallError::Transient(detail) => {
                    if retry == 0 {
                        return Err(RetriesExhausted {
                            attempts: self.settings.retries + 1,
                            detail,
                        }
                        .into());
                    }
                    let pause = self.settings.backoff_for(self.settings.retries - retry);
                    retry -= 1;
                    warn!(retry, pause_ms = pause.as_millis() as u64, %detail, "model call failed, retrying");
                    thread::sleep(pause);
                }
            }
        }
    }
}
