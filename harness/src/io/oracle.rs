//! Oracle boundary: the external decision-maker consulted once per step.
//!
//! The [`Oracle`] trait decouples the exploration engine from the concrete
//! planner backend. Tests use scripted oracles that return predetermined
//! decisions without spawning processes; production runs use
//! [`CommandOracle`], behind which any LLM CLI can sit.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::decision::{Decision, DecisionRequest};
use crate::scope::RuleDocument;

/// Abstraction over decision-making backends.
pub trait Oracle {
    /// Produce exactly one decision for the given request.
    fn decide(&mut self, request: &DecisionRequest) -> Result<Decision>;
}

/// Oracle adapter that delegates each decision to a subprocess.
///
/// The configured command receives `{rules, available_actions, history,
/// current_state}` as JSON on stdin and must print a single decision JSON
/// object to stdout.
#[derive(Debug)]
pub struct CommandOracle {
    command: Vec<String>,
    rules: Vec<RuleDocument>,
    timeout: Duration,
}

#[derive(Serialize)]
struct OraclePayload<'a> {
    rules: &'a [RuleDocument],
    #[serde(flatten)]
    request: &'a DecisionRequest,
}

impl CommandOracle {
    pub fn new(command: Vec<String>, rules: Vec<RuleDocument>, timeout: Duration) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!(
                "oracle command is not configured (set oracle.command in harness.toml)"
            ));
        }
        Ok(Self {
            command,
            rules,
            timeout,
        })
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(command = %self.command[0], timeout_secs = self.timeout.as_secs()))]
    fn decide(&mut self, request: &DecisionRequest) -> Result<Decision> {
        let payload = serde_json::to_vec(&OraclePayload {
            rules: &self.rules,
            request,
        })
        .context("serialize oracle request")?;

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn oracle '{}'", self.command[0]))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        stdin.write_all(&payload).context("write oracle request")?;
        drop(stdin);

        let status = match child
            .wait_timeout(self.timeout)
            .context("wait for oracle")?
        {
            Some(status) => status,
            None => {
                warn!(timeout_secs = self.timeout.as_secs(), "oracle timed out, killing");
                child.kill().context("kill oracle")?;
                child.wait().context("wait oracle after kill")?;
                return Err(anyhow!("oracle timed out after {:?}", self.timeout));
            }
        };

        let output = child.wait_with_output().context("collect oracle output")?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "oracle failed with status {:?}: {}",
                status.code(),
                stderr.trim()
            ));
        }

        let raw: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            crate::error::HarnessError::DecisionFormat {
                reason: format!("oracle stdout is not JSON: {err}"),
            }
        })?;
        let decision = Decision::from_json(&raw)?;
        debug!(kind = decision.kind(), "oracle decided");
        Ok(decision)
    }
}
