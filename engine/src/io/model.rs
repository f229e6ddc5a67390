//! Model endpoint abstraction and the OpenAI-compatible HTTP implementation.
//!
//! The [`ModelEndpoint`] trait decouples the agent loop from the transport.
//! Tests use scripted endpoints that replay canned replies and failures.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::window::Turn;
use crate::io::config::{ModelConfig, OverflowStyle};

/// Why an upstream call produced no usable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The payload exceeded the model's input capacity.
    Overflow(String),
    /// Network failure, bad status, or a malformed/empty body.
    Transient(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Overflow(detail) => write!(f, "context overflow: {detail}"),
            CallError::Transient(detail) => write!(f, "transient failure: {detail}"),
        }
    }
}

impl std::error::Error for CallError {}

pub trait ModelEndpoint {
    /// Send the payload and return the assistant text.
    fn complete(&mut self, payload: &[Turn]) -> std::result::Result<String, CallError>;

    fn model_name(&self) -> &str;
}

/// Chat-completions endpoint.
pub struct OpenAiEndpoint {
    cfg: ModelConfig,
    client: Client,
    api_key: Option<String>,
}

impl OpenAiEndpoint {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(cfg.timeout_secs));
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?,
            );
        }
        let client = builder.build().context("build http client")?;
        let api_key = match &cfg.api_key_env {
            Some(name) => {
                let key = std::env::var(name).ok().filter(|key| !key.trim().is_empty());
                if key.is_none() {
                    warn!(env = %name, "api key env var unset; sending unauthenticated requests");
                }
                key
            }
            None => None,
        };
        Ok(Self {
            cfg: cfg.clone(),
            client,
            api_key,
        })
    }

    fn request_body(&self, payload: &[Turn]) -> Value {
        json!({
            "model": self.cfg.model_name,
            "messages": payload,
            "max_tokens": self.cfg.max_tokens,
            "top_p": self.cfg.top_p,
            "temperature": self.cfg.temperature,
        })
    }
}

impl ModelEndpoint for OpenAiEndpoint {
    #[instrument(skip_all, fields(model = %self.cfg.model_name, turns = payload.len()))]
    fn complete(&mut self, payload: &[Turn]) -> std::result::Result<String, CallError> {
        let mut request = self
            .client
            .post(&self.cfg.base_url)
            .json(&self.request_body(payload));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|err| CallError::Transient(format!("send: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| CallError::Transient(format!("read body: {err}")))?;
        debug!(status, bytes = body.len(), "model replied");
        classify_reply(self.cfg.overflow, status, &body)
    }

    fn model_name(&self) -> &str {
        &self.cfg.model_name
    }
}

/// Map a chat-completions reply to assistant text or a [`CallError`].
pub fn classify_reply(
    style: OverflowStyle,
    status: u16,
    body: &str,
) -> std::result::Result<String, CallError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if !(200..300).contains(&status) {
        let code = parsed
            .as_ref()
            .and_then(|value| value.pointer("/error/code"))
            .and_then(Value::as_str);
        if style == OverflowStyle::ContextLength && code == Some("context_length_exceeded") {
            return Err(CallError::Overflow(format!("status {status}")));
        }
        return Err(CallError::Transient(format!(
            "status {status}: {}",
            snippet(body)
        )));
    }
    let parsed = parsed.ok_or_else(|| CallError::Transient("malformed json body".to_string()))?;
    let content = parsed
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::Transient("reply missing choices[0].message.content".to_string()))?;
    if content.trim().is_empty() {
        if style == OverflowStyle::EmptyContent {
            return Err(CallError::Overflow("empty content".to_string()));
        }
        return Err(CallError::Transient("empty content".to_string()));
    }
    Ok(content.to_string())
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 200;
    match body.char_indices().nth(LIMIT) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}
