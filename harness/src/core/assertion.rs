//! Declarative condition checks against one path of a state snapshot.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::path::StatePath;
use crate::error::HarnessError;

/// Supported assertion conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    MatchesRegex,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Equals => "equals",
            Condition::NotEquals => "not_equals",
            Condition::Contains => "contains",
            Condition::NotContains => "not_contains",
            Condition::MatchesRegex => "matches_regex",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declarative condition against one path of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub path: String,
    pub condition: Condition,
    pub value: Value,
}

/// Check the assertion against every node its path matches.
///
/// The condition must hold for all matched nodes; the first violation
/// aborts with the concrete path of the offending node and its value.
pub fn evaluate(assertion: &Assertion, state: &Value) -> Result<(), HarnessError> {
    let path = StatePath::parse(&assertion.path)?;
    let matches = path.resolve(state);
    if matches.is_empty() {
        return Err(HarnessError::NoMatch {
            path: assertion.path.clone(),
        });
    }

    let matcher = match assertion.condition {
        Condition::MatchesRegex => Some(compile_anchored(&assertion.value)?),
        _ => None,
    };

    for (concrete, node) in matches {
        let holds = match assertion.condition {
            Condition::Equals => *node == assertion.value,
            Condition::NotEquals => *node != assertion.value,
            Condition::Contains => contains(node, &assertion.value),
            Condition::NotContains => !contains(node, &assertion.value),
            Condition::MatchesRegex => matcher
                .as_ref()
                .is_some_and(|re| node.as_str().is_some_and(|s| re.is_match(s))),
        };
        if !holds {
            return Err(HarnessError::AssertionFailed {
                path: concrete,
                condition: assertion.condition,
                expected: assertion.value.clone(),
                actual: node.clone(),
            });
        }
    }
    Ok(())
}

/// Compile a pattern anchored at the start of the matched value.
///
/// Authors needing full-text or multi-line matching supply an inline
/// `(?s)` modifier themselves.
fn compile_anchored(value: &Value) -> Result<Regex, HarnessError> {
    let pattern = value.as_str().ok_or_else(|| HarnessError::DecisionFormat {
        reason: "matches_regex expects a string pattern".to_string(),
    })?;
    Regex::new(&format!("^(?:{pattern})")).map_err(|err| HarnessError::DecisionFormat {
        reason: format!("invalid regex pattern: {err}"),
    })
}

fn contains(node: &Value, needle: &Value) -> bool {
    match node {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.contains(needle),
        _ => false,
    }
}
