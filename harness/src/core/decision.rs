//! The oracle decision contract.
//!
//! Each exploration step sends the oracle a [`DecisionRequest`] and expects
//! exactly one of three decision kinds back. Raw payloads are validated
//! against an embedded JSON Schema before parsing, so a malformed decision
//! fails with a single error listing every violation instead of whatever
//! serde happens to hit first.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::assertion::Condition;
use crate::error::HarnessError;

const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(DECISION_SCHEMA).expect("embedded decision schema should be JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded decision schema should compile")
});

/// Terminal verdict declared by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Successful,
    Failed,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestResult::Successful => "successful",
            TestResult::Failed => "failed",
        }
    }
}

/// One decision emitted by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Execute one of the currently offered actions.
    SelectAction {
        name: String,
        #[serde(default)]
        parameters: Map<String, Value>,
        #[serde(default)]
        intention: String,
    },
    /// Check a condition against the last known state snapshot.
    Assert {
        path: String,
        condition: Condition,
        value: Value,
        #[serde(default)]
        purpose: String,
    },
    /// End the run with a verdict.
    Finish {
        result: TestResult,
        conclusion: String,
    },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::SelectAction { .. } => "select_action",
            Decision::Assert { .. } => "assert",
            Decision::Finish { .. } => "finish",
        }
    }

    /// Parse and validate a raw decision payload.
    pub fn from_json(raw: &Value) -> Result<Self, HarnessError> {
        let messages: Vec<String> = VALIDATOR.iter_errors(raw).map(|err| err.to_string()).collect();
        if !messages.is_empty() {
            return Err(HarnessError::DecisionFormat {
                reason: messages.join("; "),
            });
        }
        serde_json::from_value(raw.clone()).map_err(|err| HarnessError::DecisionFormat {
            reason: err.to_string(),
        })
    }
}

/// One completed step, as replayed to the oracle for context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Decision kind that produced the step.
    pub decision: String,
    /// Action name or assertion path.
    pub action: String,
    /// Status observed after the step.
    pub status: String,
}

/// Everything the oracle sees when asked for the next decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    /// Currently offered actions, name to description.
    pub available_actions: BTreeMap<String, String>,
    /// Full step history of the run so far.
    pub history: Vec<HistoryEntry>,
    /// Last known state snapshot.
    pub current_state: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_select_action_with_defaults() {
        let decision = Decision::from_json(&json!({
            "decision": "select_action",
            "name": "run"
        }))
        .expect("parse");
        match decision {
            Decision::SelectAction {
                name,
                parameters,
                intention,
            } => {
                assert_eq!(name, "run");
                assert!(parameters.is_empty());
                assert!(intention.is_empty());
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn parses_assert_decision() {
        let decision = Decision::from_json(&json!({
            "decision": "assert",
            "path": "processes[0].status",
            "condition": "equals",
            "value": "completed",
            "purpose": "verify clean exit"
        }))
        .expect("parse");
        assert_eq!(decision.kind(), "assert");
    }

    #[test]
    fn parses_finish_decision() {
        let decision = Decision::from_json(&json!({
            "decision": "finish",
            "result": "failed",
            "conclusion": "stderr showed a panic"
        }))
        .expect("parse");
        match decision {
            Decision::Finish { result, conclusion } => {
                assert_eq!(result, TestResult::Failed);
                assert_eq!(conclusion, "stderr showed a panic");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    /// Unknown kinds, missing fields and bad enum values all fail as one
    /// decision-format error.
    #[test]
    fn rejects_malformed_payloads() {
        let payloads = [
            json!({"decision": "reboot"}),
            json!({"decision": "select_action"}),
            json!({"decision": "assert", "path": "a", "condition": "looks_like", "value": 1}),
            json!({"decision": "finish", "result": "maybe", "conclusion": ""}),
            json!("finish"),
        ];
        for payload in payloads {
            let err = Decision::from_json(&payload).expect_err("should reject");
            assert!(
                matches!(err, HarnessError::DecisionFormat { .. }),
                "payload {payload} should be a decision format error"
            );
        }
    }
}
