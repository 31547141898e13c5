//! Regression proposal accumulation and rendering.
//!
//! A proposal is created when an exploration run starts, receives every
//! decision as a step before that step executes, and is finalized with the
//! oracle's terminal verdict. Rendering turns the step list back into
//! calls against the sandbox contract (start, steps, teardown) so the run
//! can be replayed as a standalone scripted test with no oracle involved.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::decision::TestResult;

const TEST_TEMPLATE: &str = include_str!("../templates/regression_test.rs.jinja");

/// One recorded step of an exploration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionStep {
    /// Decision kind: `select_action`, `assert` or `finish`.
    pub decision: String,
    /// Action name, assertion condition or terminal result.
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A replayable record of one exploration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionProposal {
    pub sandbox_name: String,
    pub title: String,
    pub description: String,
    pub steps: Vec<RegressionStep>,
    pub test_result: Option<TestResult>,
    #[serde(default)]
    pub test_conclusion: String,
}

impl RegressionProposal {
    pub fn new(sandbox_name: &str, title: &str, description: &str) -> Self {
        Self {
            sandbox_name: sandbox_name.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            steps: Vec::new(),
            test_result: None,
            test_conclusion: String::new(),
        }
    }

    /// Append a step. Steps are recorded before execution, so the proposal
    /// reflects attempted steps even when a later one fails.
    pub fn add_step(&mut self, decision: &str, action: &str, parameters: Map<String, Value>) {
        self.steps.push(RegressionStep {
            decision: decision.to_string(),
            action: action.to_string(),
            parameters,
        });
    }

    /// Record the terminal verdict, verbatim from the oracle.
    pub fn set_result(&mut self, result: TestResult, conclusion: &str) {
        self.test_result = Some(result);
        self.test_conclusion = conclusion.to_string();
    }

    pub fn is_finalized(&self) -> bool {
        self.test_result.is_some()
    }

    /// Render the proposal as a standalone Rust test script.
    ///
    /// `sandbox_dir` is the directory the replaying test should build the
    /// sandbox from, relative to wherever the script will live.
    pub fn render(&self, sandbox_dir: &Path) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("regression_test", TEST_TEMPLATE)
            .expect("regression test template should be valid");
        let template = env.get_template("regression_test")?;

        let steps: Vec<StepView> = self
            .steps
            .iter()
            .map(StepView::from_step)
            .collect::<Result<_>>()?;
        let result = self
            .test_result
            .map(|r| r.as_str())
            .unwrap_or("unfinished");

        let rendered = template.render(context! {
            sandbox_name => self.sandbox_name,
            sandbox_dir => sandbox_dir.display().to_string(),
            title => self.title,
            description => self.description,
            conclusion => self.test_conclusion,
            test_fn => test_fn_name(&self.title),
            steps => steps,
            result => result,
        })?;
        Ok(rendered)
    }

    /// Append the rendered script to a file, creating it if missing.
    pub fn write_to_file(&self, output_path: &Path, sandbox_dir: &Path) -> Result<()> {
        let rendered = self.render(sandbox_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_path)
            .with_context(|| format!("open {}", output_path.display()))?;
        file.write_all(rendered.as_bytes())
            .with_context(|| format!("write {}", output_path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("write {}", output_path.display()))?;
        Ok(())
    }
}

/// Step context prepared for template rendering.
#[derive(Debug, Serialize)]
struct StepView {
    kind: String,
    action: String,
    params_json: String,
    path: String,
    condition_variant: String,
    value_json: String,
}

impl StepView {
    fn from_step(step: &RegressionStep) -> Result<Self> {
        let mut view = Self {
            kind: step.decision.clone(),
            action: step.action.clone(),
            params_json: serde_json::to_string(&Value::Object(step.parameters.clone()))?,
            path: String::new(),
            condition_variant: String::new(),
            value_json: String::new(),
        };
        if step.decision == "assert" {
            view.path = step
                .parameters
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            view.condition_variant = condition_variant(&step.action).to_string();
            view.value_json =
                serde_json::to_string(step.parameters.get("value").unwrap_or(&Value::Null))?;
        }
        Ok(view)
    }
}

fn condition_variant(condition: &str) -> &'static str {
    match condition {
        "not_equals" => "NotEquals",
        "contains" => "Contains",
        "not_contains" => "NotContains",
        "matches_regex" => "MatchesRegex",
        _ => "Equals",
    }
}

fn test_fn_name(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("test_{}", slug.trim_matches('_'))
}
