//! The exploration engine: one oracle-driven run per sandbox.
//!
//! Each step consults the oracle with the currently offered actions, the
//! full history and the last known state snapshot, then executes whichever
//! of the three decision kinds comes back. Every decision is recorded on
//! the regression proposal before it executes, so the proposal reflects
//! attempted steps even when a later one fails. Teardown runs exactly once
//! per run, on every exit path.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::assertion::{Assertion, Condition};
use crate::core::decision::{Decision, DecisionRequest, HistoryEntry, TestResult};
use crate::core::proposal::{RegressionProposal, RegressionStep};
use crate::error::HarnessError;
use crate::io::oracle::Oracle;
use crate::registry::ActionDescriptor;
use crate::sandbox::TestableSandbox;

pub const DEFAULT_STEP_LIMIT: u32 = 100;

/// Tunables for one exploration run.
#[derive(Debug, Clone)]
pub struct ExploreConfig {
    /// Hard ceiling that converts an otherwise-live loop into a failed run.
    pub step_limit: u32,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

/// Terminal outcome of one exploration run.
#[derive(Debug)]
pub struct ExploreOutcome {
    pub result: TestResult,
    pub conclusion: String,
    pub steps_executed: u32,
    pub proposal: RegressionProposal,
}

/// Drive one sandbox through an oracle-guided exploration.
#[instrument(skip_all, fields(sandbox = sandbox.name()))]
pub fn run_exploration<O: Oracle>(
    sandbox: &mut TestableSandbox,
    oracle: &mut O,
    config: &ExploreConfig,
) -> Result<ExploreOutcome> {
    let mut proposal = RegressionProposal::new(
        sandbox.name(),
        &format!("{} exploration", sandbox.name()),
        "Recorded from an oracle-guided exploration run",
    );

    let attempt = explore_loop(sandbox, oracle, config, &mut proposal);
    if let Err(err) = sandbox.teardown() {
        warn!(err = %err, "sandbox teardown failed");
    }

    let (result, conclusion) = attempt?;
    let steps_executed = proposal.steps.len() as u32;
    Ok(ExploreOutcome {
        result,
        conclusion,
        steps_executed,
        proposal,
    })
}

fn explore_loop<O: Oracle>(
    sandbox: &mut TestableSandbox,
    oracle: &mut O,
    config: &ExploreConfig,
    proposal: &mut RegressionProposal,
) -> Result<(TestResult, String)> {
    let mut actions = sandbox.start().context("start sandbox")?;
    let mut state = sandbox.read_state().context("read initial state")?;
    let mut history: Vec<HistoryEntry> = Vec::new();

    for step in 0..config.step_limit {
        let request = DecisionRequest {
            available_actions: descriptor_map(&actions),
            history: history.clone(),
            current_state: state.clone(),
        };
        let decision = oracle.decide(&request).context("oracle decision")?;
        debug!(step, kind = decision.kind(), "oracle decided");
        record_step(proposal, &decision);

        match decision {
            Decision::Finish { result, conclusion } => {
                proposal.set_result(result, &conclusion);
                info!(result = result.as_str(), step, "exploration finished");
                return Ok((result, conclusion));
            }
            Decision::Assert {
                path,
                condition,
                value,
                ..
            } => {
                let assertion = Assertion {
                    path,
                    condition,
                    value,
                };
                // Asserted against the last known snapshot, not re-read;
                // the offered actions do not change.
                sandbox.execute_assertion(&assertion, &state)?;
                history.push(HistoryEntry {
                    decision: "assert".to_string(),
                    action: assertion.path,
                    status: "assertion passed".to_string(),
                });
            }
            Decision::SelectAction {
                name, parameters, ..
            } => {
                if !actions.iter().any(|d| d.name == name) {
                    return Err(HarnessError::UnitNotFound { name }.into());
                }
                actions = sandbox
                    .execute_action(&name, &parameters)
                    .with_context(|| format!("execute action '{name}'"))?;
                state = sandbox.read_state().context("read state after action")?;
                history.push(HistoryEntry {
                    decision: "select_action".to_string(),
                    action: name,
                    status: state_status(&state),
                });
            }
        }
    }

    let conclusion = HarnessError::StepLimitExceeded {
        limit: config.step_limit,
    }
    .to_string();
    warn!(limit = config.step_limit, "exploration hit the step ceiling");
    proposal.set_result(TestResult::Failed, &conclusion);
    Ok((TestResult::Failed, conclusion))
}

/// Replay a finalized proposal against a fresh sandbox with no oracle.
///
/// Re-executes start, every recorded step and teardown, returning the
/// recorded terminal result once everything re-ran cleanly.
#[instrument(skip_all, fields(sandbox = sandbox.name()))]
pub fn replay(proposal: &RegressionProposal, sandbox: &mut TestableSandbox) -> Result<TestResult> {
    let attempt = replay_loop(proposal, sandbox);
    if let Err(err) = sandbox.teardown() {
        warn!(err = %err, "sandbox teardown failed");
    }
    attempt
}

fn replay_loop(proposal: &RegressionProposal, sandbox: &mut TestableSandbox) -> Result<TestResult> {
    let mut actions = sandbox.start().context("start sandbox")?;
    let mut state = sandbox.read_state().context("read initial state")?;

    for step in &proposal.steps {
        match step.decision.as_str() {
            "select_action" => {
                if !actions.iter().any(|d| d.name == step.action) {
                    return Err(HarnessError::UnitNotFound {
                        name: step.action.clone(),
                    }
                    .into());
                }
                actions = sandbox
                    .execute_action(&step.action, &step.parameters)
                    .with_context(|| format!("replay action '{}'", step.action))?;
                state = sandbox.read_state().context("read state after action")?;
            }
            "assert" => {
                let assertion = assertion_from_step(step)?;
                sandbox.execute_assertion(&assertion, &state)?;
            }
            "finish" => {
                return parse_result(&step.action);
            }
            other => {
                return Err(HarnessError::DecisionFormat {
                    reason: format!("unknown recorded decision kind '{other}'"),
                }
                .into());
            }
        }
    }

    proposal
        .test_result
        .ok_or_else(|| anyhow!("proposal was never finalized"))
}

fn descriptor_map(actions: &[ActionDescriptor]) -> BTreeMap<String, String> {
    actions
        .iter()
        .map(|d| (d.name.clone(), d.description.clone()))
        .collect()
}

fn state_status(state: &Value) -> String {
    state
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("ok")
        .to_string()
}

/// Append the decision to the proposal as a regression step.
fn record_step(proposal: &mut RegressionProposal, decision: &Decision) {
    match decision {
        Decision::SelectAction {
            name, parameters, ..
        } => {
            proposal.add_step("select_action", name, parameters.clone());
        }
        Decision::Assert {
            path,
            condition,
            value,
            purpose,
        } => {
            let mut parameters = Map::new();
            parameters.insert("path".to_string(), json!(path));
            parameters.insert("value".to_string(), value.clone());
            if !purpose.is_empty() {
                parameters.insert("purpose".to_string(), json!(purpose));
            }
            proposal.add_step("assert", condition.as_str(), parameters);
        }
        Decision::Finish { result, conclusion } => {
            let mut parameters = Map::new();
            parameters.insert("conclusion".to_string(), json!(conclusion));
            proposal.add_step("finish", result.as_str(), parameters);
        }
    }
}

fn assertion_from_step(step: &RegressionStep) -> Result<Assertion> {
    let condition: Condition = serde_json::from_value(json!(step.action))
        .map_err(|_| HarnessError::DecisionFormat {
            reason: format!("unknown recorded condition '{}'", step.action),
        })?;
    let path = step
        .parameters
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| HarnessError::DecisionFormat {
            reason: "recorded assertion is missing its path".to_string(),
        })?;
    let value = step
        .parameters
        .get("value")
        .cloned()
        .ok_or_else(|| HarnessError::DecisionFormat {
            reason: "recorded assertion is missing its value".to_string(),
        })?;
    Ok(Assertion {
        path: path.to_string(),
        condition,
        value,
    })
}

fn parse_result(raw: &str) -> Result<TestResult> {
    serde_json::from_value(json!(raw)).map_err(|_| {
        HarnessError::DecisionFormat {
            reason: format!("unknown recorded result '{raw}'"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedOracle, SandboxProbe, queue_sandbox};
    use std::sync::Arc;

    fn select(name: &str, parameters: Map<String, Value>) -> Decision {
        Decision::SelectAction {
            name: name.to_string(),
            parameters,
            intention: String::new(),
        }
    }

    fn assert_decision(path: &str, condition: Condition, value: Value) -> Decision {
        Decision::Assert {
            path: path.to_string(),
            condition,
            value,
            purpose: String::new(),
        }
    }

    fn finish(result: TestResult, conclusion: &str) -> Decision {
        Decision::Finish {
            result,
            conclusion: conclusion.to_string(),
        }
    }

    fn item(value: Value) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("item".to_string(), value);
        params
    }

    #[test]
    fn finish_ends_the_run_and_finalizes_the_proposal() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![finish(TestResult::Successful, "looks good")]);

        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");

        assert_eq!(outcome.result, TestResult::Successful);
        assert_eq!(outcome.conclusion, "looks good");
        assert_eq!(outcome.steps_executed, 1);
        assert_eq!(outcome.proposal.test_result, Some(TestResult::Successful));
        assert_eq!(outcome.proposal.test_conclusion, "looks good");
        assert_eq!(probe.teardown_count(), 1);
    }

    /// A failed verdict is copied verbatim and nothing records after it.
    #[test]
    fn no_steps_record_after_finish() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![
            finish(TestResult::Failed, "bug found"),
            select("push", item(json!(1))),
        ]);

        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");

        assert_eq!(outcome.result, TestResult::Failed);
        assert_eq!(outcome.proposal.steps.len(), 1);
        assert_eq!(outcome.proposal.steps[0].decision, "finish");
        assert!(probe.executed().is_empty());
    }

    #[test]
    fn selected_actions_execute_and_feed_history() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![
            select("push", item(json!("a"))),
            select("drain", Map::new()),
            finish(TestResult::Successful, "queue behaved"),
        ]);

        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");

        assert_eq!(probe.executed(), vec!["push", "drain"]);
        assert_eq!(outcome.steps_executed, 3);

        // The last request carried the full history and the drained state.
        let last = oracle.requests.last().expect("final request");
        assert_eq!(last.history.len(), 2);
        assert_eq!(last.history[0].action, "push");
        assert_eq!(last.history[0].decision, "select_action");
        // `drain` is terminal, so nothing is offered afterwards.
        assert!(last.available_actions.is_empty());
        assert_eq!(last.current_state["depth"], json!(0));
    }

    /// Assertions run against the last known snapshot and leave the offered
    /// actions untouched.
    #[test]
    fn passing_assertion_appends_synthetic_history() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![
            select("push", item(json!("a"))),
            assert_decision("depth", Condition::Equals, json!(1)),
            finish(TestResult::Successful, "asserted"),
        ]);

        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");
        assert_eq!(outcome.result, TestResult::Successful);

        let last = oracle.requests.last().expect("final request");
        assert_eq!(last.history[1].decision, "assert");
        assert_eq!(last.history[1].status, "assertion passed");
        // The action set after an assertion matches the one before it.
        assert_eq!(
            oracle.requests[1].available_actions,
            last.available_actions
        );
    }

    #[test]
    fn failing_assertion_aborts_but_still_tears_down() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![assert_decision(
            "depth",
            Condition::Equals,
            json!(99),
        )]);

        let err = run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default())
            .expect_err("assertion must fail");
        let err = err.downcast_ref::<HarnessError>().expect("typed error");
        assert!(matches!(err, HarnessError::AssertionFailed { .. }));
        assert_eq!(probe.teardown_count(), 1);
    }

    /// The engine refuses to execute an action the sandbox did not offer.
    #[test]
    fn unoffered_action_aborts_the_run() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![select("reboot", Map::new())]);

        let err = run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default())
            .expect_err("unknown action");
        let err = err.downcast_ref::<HarnessError>().expect("typed error");
        assert!(matches!(err, HarnessError::UnitNotFound { name } if name == "reboot"));
        assert!(probe.executed().is_empty());
        assert_eq!(probe.teardown_count(), 1);
    }

    #[test]
    fn step_ceiling_converts_to_a_failed_verdict() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![
            select("push", item(json!(1))),
            select("push", item(json!(2))),
            select("push", item(json!(3))),
        ]);

        let outcome = run_exploration(&mut sandbox, &mut oracle, &ExploreConfig { step_limit: 3 })
            .expect("run");
        assert_eq!(outcome.result, TestResult::Failed);
        assert!(outcome.conclusion.contains("step limit of 3 exceeded"));
        assert_eq!(outcome.steps_executed, 3);
        assert_eq!(outcome.proposal.test_result, Some(TestResult::Failed));
        assert_eq!(probe.teardown_count(), 1);
    }

    /// End to end over a real worker process: run an action, assert on the
    /// observed process state, finish.
    #[test]
    fn explores_a_process_backed_sandbox() {
        use crate::io::process::ProcessSandbox;
        use crate::sandbox::process_sandbox_from_dir;
        use crate::test_support::write_process_manifest;

        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("cli");
        std::fs::create_dir_all(&dir).expect("create sandbox dir");
        write_process_manifest(&dir, "echo hello").expect("write manifest");

        let mut sandbox = process_sandbox_from_dir(&dir, ProcessSandbox::with_defaults())
            .expect("build sandbox");
        let mut oracle = ScriptedOracle::new(vec![
            select("run", Map::new()),
            assert_decision(
                "processes[0].status",
                Condition::MatchesRegex,
                json!("(running|completed)"),
            ),
            finish(TestResult::Successful, "process launched"),
        ]);

        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");
        assert_eq!(outcome.result, TestResult::Successful);
        assert_eq!(outcome.steps_executed, 3);

        // Teardown already ran inside the engine; the registry is empty.
        let state = sandbox.read_state().expect("read state");
        assert_eq!(state["processes"], json!([]));
    }

    /// Round trip: a proposal from a successful run replays to the same
    /// terminal result on a fresh sandbox instance.
    #[test]
    fn proposal_replays_to_the_same_result() {
        let probe = Arc::new(SandboxProbe::default());
        let mut sandbox = queue_sandbox(Arc::clone(&probe));
        let mut oracle = ScriptedOracle::new(vec![
            select("push", item(json!("a"))),
            assert_decision("depth", Condition::Equals, json!(1)),
            select("drain", Map::new()),
            finish(TestResult::Successful, "queue behaved"),
        ]);
        let outcome =
            run_exploration(&mut sandbox, &mut oracle, &ExploreConfig::default()).expect("run");

        let replay_probe = Arc::new(SandboxProbe::default());
        let mut fresh = queue_sandbox(Arc::clone(&replay_probe));
        let replayed = replay(&outcome.proposal, &mut fresh).expect("replay");

        assert_eq!(replayed, outcome.result);
        assert_eq!(replay_probe.executed(), vec!["push", "drain"]);
        assert_eq!(replay_probe.teardown_count(), 1);
    }
}
