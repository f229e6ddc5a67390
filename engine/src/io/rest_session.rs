//! Session driver for applications exposing a REST command endpoint.
//!
//! Commands go out as `GET {base_url}?command=...`; the JSON reply carries a
//! `"log messages"` object of message lists by level and an `"error"` field
//! that is `null` on success.
//!
//! Only the textual channel is observed; screenshots and accessibility trees
//! need a [`Session`] implementation that can capture them.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::rule::StateSnapshot;
use crate::core::types::ObsKind;
use crate::io::config::SessionConfig;
use crate::io::session::{CommandOutcome, Observation, Session};

const LOG_LEVELS: [&str; 4] = ["note", "info", "warning", "error"];

pub struct RestSession {
    cfg: SessionConfig,
    client: Option<Client>,
    child: Option<Child>,
    /// Version the running application reported on open.
    reported_version: Option<String>,
    /// Messages produced since the last textual observation.
    pending_log: Vec<String>,
}

impl RestSession {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            cfg,
            client: None,
            child: None,
            reported_version: None,
            pending_log: Vec::new(),
        }
    }

    /// Ask the application for its version and compare it with the configured one.
    fn check_version(&mut self) -> Result<()> {
        let Some(command) = self.cfg.version_command.clone() else {
            return Ok(());
        };
        let reported = reply_version(&self.call(&command)?)
            .ok_or_else(|| anyhow!("{command:?} did not report a version"))?;
        match &self.cfg.version {
            Some(expected) if *expected != reported => {
                bail!("application reports version {reported}, configured for {expected}")
            }
            _ => {}
        }
        debug!(version = %reported, "version confirmed");
        self.reported_version = Some(reported);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.client = None;
        self.reported_version = None;
        if let Some(mut child) = self.child.take() {
            child.kill().context("kill application process")?;
            child.wait().context("reap application process")?;
        }
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        let Some((program, args)) = self.cfg.launch.split_first() else {
            return Ok(());
        };
        let Some(ready) = self.cfg.ready_line.clone() else {
            let child = Command::new(program)
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("spawn {program}"))?;
            self.child = Some(child);
            return Ok(());
        };
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {program}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{program} stdout not captured"))?;
        let (tx, rx) = mpsc::channel();
        // The reader keeps draining stdout after readiness so the app never blocks on a full pipe.
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if line.starts_with(&ready) {
                    let _ = tx.send(());
                }
            }
        });
        let timeout = Duration::from_secs(self.cfg.boot_timeout_secs);
        if rx.recv_timeout(timeout).is_err() {
            let _ = child.kill();
            let _ = child.wait();
            bail!(
                "{program} did not report readiness within {}s",
                timeout.as_secs()
            );
        }
        self.child = Some(child);
        Ok(())
    }

    fn call(&self, command: &str) -> Result<Value> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("session {} is not open", self.cfg.key()))?;
        let response = client
            .get(&self.cfg.base_url)
            .query(&[("command", command)])
            .send()
            .with_context(|| format!("send {command:?}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{command:?} returned status {status}");
        }
        response
            .json::<Value>()
            .with_context(|| format!("parse reply to {command:?}"))
    }
}

/// Split a REST reply into its outcome.
pub fn reply_outcome(reply: &Value) -> CommandOutcome {
    let mut messages = Vec::new();
    if let Some(levels) = reply.get("log messages").and_then(Value::as_object) {
        for level in LOG_LEVELS {
            if let Some(items) = levels.get(level).and_then(Value::as_array) {
                messages.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }
    }
    let ok = reply.get("error").is_none_or(Value::is_null);
    CommandOutcome { ok, messages }
}

/// Version string from a reply: a string `"value"`, else the first logged line.
pub fn reply_version(reply: &Value) -> Option<String> {
    if let Some(version) = reply.get("value").and_then(Value::as_str) {
        return Some(version.trim().to_string()).filter(|v| !v.is_empty());
    }
    let outcome = reply_outcome(reply);
    if !outcome.ok {
        return None;
    }
    outcome
        .messages
        .iter()
        .map(|message| message.trim())
        .find(|message| !message.is_empty())
        .map(str::to_string)
}

/// Extract the state snapshot from a reply to the states command.
///
/// Accepts either a `"value"` object or a JSON object printed as the log.
pub fn reply_snapshot(reply: &Value) -> Result<StateSnapshot> {
    if let Some(value) = reply.get("value").and_then(Value::as_object) {
        return Ok(value.clone());
    }
    let outcome = reply_outcome(reply);
    if !outcome.ok {
        bail!("states command failed: {}", outcome.messages.join("; "));
    }
    let text = outcome.messages.join("\n");
    match serde_json::from_str::<Value>(text.trim()).context("parse state snapshot")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("state snapshot is not an object: {other}")),
    }
}

impl Session for RestSession {
    #[instrument(skip_all, fields(key = %self.cfg.key()))]
    fn open(&mut self) -> Result<()> {
        let client = Client::builder()
            .build()
            .context("build http client")?;
        self.launch()?;
        self.client = Some(client);
        self.pending_log.clear();
        if let Err(err) = self.check_version() {
            if let Err(release) = self.release() {
                warn!(error = %format!("{release:#}"), "release after failed open");
            }
            return Err(err);
        }
        info!(base_url = %self.cfg.base_url, "session open");
        Ok(())
    }

    #[instrument(skip_all, fields(key = %self.cfg.key()))]
    fn close(&mut self) -> Result<()> {
        self.release()?;
        info!("session closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    fn version(&self) -> Option<&str> {
        self.reported_version
            .as_deref()
            .or(self.cfg.version.as_deref())
    }

    fn restore_baseline(&mut self, snapshot: &str) -> Result<()> {
        let Some(command) = self.cfg.reset_command.clone() else {
            return Ok(());
        };
        debug!(snapshot, "restoring baseline");
        let outcome = reply_outcome(&self.call(&command)?);
        if !outcome.ok {
            bail!("reset command failed: {}", outcome.messages.join("; "));
        }
        self.pending_log.clear();
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutcome> {
        let outcome = reply_outcome(&self.call(command)?);
        debug!(command, ok = outcome.ok, "executed");
        self.pending_log.extend(outcome.messages.iter().cloned());
        Ok(outcome)
    }

    fn observe(&mut self, channels: &BTreeSet<ObsKind>) -> Result<Observation> {
        let mut observation = Observation::default();
        for channel in channels {
            match channel {
                ObsKind::Textual => {
                    observation.textual = Some(std::mem::take(&mut self.pending_log).join("\n"));
                }
                ObsKind::Screenshot | ObsKind::A11yTree => {
                    warn!(?channel, "channel not supported by REST sessions");
                }
            }
        }
        Ok(observation)
    }

    fn snapshot(&mut self) -> Result<StateSnapshot> {
        let command = self.cfg.states_command.clone();
        reply_snapshot(&self.call(&command)?)
    }
}

impl Drop for RestSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::net::TcpListener;

    /// Answer every request with `body` on a local port; returns the base URL.
    fn serve(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut line = String::new();
                while reader.read_line(&mut line).is_ok_and(|read| read > 2) {
                    line.clear();
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/run")
    }

    fn session(launch: Vec<String>, ready_line: Option<&str>) -> RestSession {
        RestSession::new(config("http://127.0.0.1:9/run", launch, ready_line))
    }

    fn versioned(base_url: &str) -> RestSession {
        let mut cfg = config(base_url, Vec::new(), None);
        cfg.version_command = Some("version".to_string());
        RestSession::new(cfg)
    }

    fn config(base_url: &str, launch: Vec<String>, ready_line: Option<&str>) -> SessionConfig {
        SessionConfig {
            kind: "App".to_string(),
            sort: crate::core::types::SessionClass::Raw,
            base_url: base_url.to_string(),
            version: Some("0.4".to_string()),
            version_command: None,
            launch,
            ready_line: ready_line.map(str::to_string),
            boot_timeout_secs: 5,
            states_command: "states".to_string(),
            reset_command: None,
            info_command: None,
            steps: Default::default(),
        }
    }

    #[test]
    fn reply_outcome_collects_messages_and_error() {
        let ok = reply_outcome(&json!({
            "log messages": {"note": ["opened 1abc"], "warning": ["slow"]},
            "error": null
        }));
        assert!(ok.ok);
        assert_eq!(ok.messages, vec!["opened 1abc", "slow"]);

        let failed = reply_outcome(&json!({
            "log messages": {"error": ["no such model"]},
            "error": {"type": "UserError"}
        }));
        assert!(!failed.ok);
        assert_eq!(failed.messages, vec!["no such model"]);
    }

    #[test]
    fn reply_snapshot_accepts_value_or_logged_json() {
        let from_value = reply_snapshot(&json!({"value": {"color": "red"}, "error": null}))
            .expect("value snapshot");
        assert_eq!(from_value["color"], "red");

        let from_log = reply_snapshot(&json!({
            "log messages": {"note": ["{\"count\": 2}"]},
            "error": null
        }))
        .expect("log snapshot");
        assert_eq!(from_log["count"], 2);

        assert!(reply_snapshot(&json!({"log messages": {"note": ["[1]"]}})).is_err());
    }

    #[test]
    fn reply_version_reads_value_or_first_logged_line() {
        assert_eq!(reply_version(&json!({"value": " 1.8 "})).as_deref(), Some("1.8"));
        assert_eq!(
            reply_version(&json!({"log messages": {"info": ["", "UCSF ChimeraX version: 1.8"]}}))
                .as_deref(),
            Some("UCSF ChimeraX version: 1.8")
        );
        assert_eq!(
            reply_version(&json!({"log messages": {"error": ["boom"]}, "error": {"type": "E"}})),
            None
        );
    }

    #[test]
    fn open_confirms_the_running_version() {
        let mut session = versioned(&serve(r#"{"value": "0.4", "error": null}"#));
        session.open().expect("open");
        assert!(session.is_open());
        assert_eq!(session.version(), Some("0.4"));
        session.close().expect("close");
    }

    #[test]
    fn open_refuses_a_different_running_version() {
        let mut session = versioned(&serve(r#"{"value": "0.5", "error": null}"#));
        let err = session.open().expect_err("version mismatch");
        assert!(format!("{err:#}").contains("reports version 0.5"));
        assert!(!session.is_open());
    }

    #[test]
    fn closed_session_refuses_commands() {
        let mut session = session(Vec::new(), None);
        assert!(!session.is_open());
        assert!(session.execute("open 1abc").is_err());
        assert_eq!(session.version(), Some("0.4"));
    }

    #[cfg(unix)]
    #[test]
    fn launch_waits_for_ready_line() {
        let launch = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo booting; echo REST server started; sleep 30".to_string(),
        ];
        let mut session = session(launch, Some("REST server started"));
        session.open().expect("open");
        assert!(session.is_open());
        session.close().expect("close");
        assert!(!session.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn launch_times_out_without_ready_line() {
        let launch = vec!["sh".to_string(), "-c".to_string(), "echo nope".to_string()];
        let mut session = session(launch, Some("REST server started"));
        session.cfg.boot_timeout_secs = 1;
        assert!(session.open().is_err());
        assert!(!session.is_open());
    }
}
