//! The uniform contract every explorable target satisfies.
//!
//! A testable sandbox wraps an [`ActionRegistry`] and exposes the five
//! operations the exploration engine drives: `start`, `execute_action`,
//! `read_state`, `execute_assertion` and `teardown`. Process-backed
//! sandboxes are built from a testability manifest and route their worker
//! lifecycle through a [`ProcessSandbox`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::instrument;

use crate::core::assertion::{self, Assertion};
use crate::io::manifest::{SandboxManifest, manifest_path};
use crate::io::process::ProcessSandbox;
use crate::registry::{ActionDescriptor, ActionRegistry, Params};

/// Designated entry unit invoked by `start`.
pub const START_UNIT: &str = "start";
/// Designated state-reading unit invoked by `read_state`.
pub const READ_STATE_UNIT: &str = "read_state";
/// Designated cleanup unit invoked by `teardown`.
pub const TEARDOWN_UNIT: &str = "teardown";

/// An isolated, explorable instance of a system under test.
#[derive(Debug)]
pub struct TestableSandbox {
    name: String,
    registry: ActionRegistry,
}

impl TestableSandbox {
    pub fn new(name: &str, registry: ActionRegistry) -> Self {
        Self {
            name: name.to_string(),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sandbox is usable only if the three designated units exist.
    pub fn is_valid(&self) -> bool {
        [START_UNIT, READ_STATE_UNIT, TEARDOWN_UNIT]
            .iter()
            .all(|unit| self.registry.contains(unit))
    }

    /// Enter the initial state and return the actions offered there.
    pub fn start(&mut self) -> Result<Vec<ActionDescriptor>> {
        self.registry.discover(START_UNIT)
    }

    /// Execute a named action and return the actions offered next.
    ///
    /// An execution result without follow-on actions yields an empty list:
    /// that branch of the action graph is exhausted.
    pub fn execute_action(
        &mut self,
        name: &str,
        parameters: &Params,
    ) -> Result<Vec<ActionDescriptor>> {
        let result = self.registry.invoke(name, parameters)?;
        self.registry.descriptors_from(name, &result)
    }

    /// Read the current state snapshot of the system under test.
    pub fn read_state(&mut self) -> Result<Value> {
        let result = self.registry.invoke(READ_STATE_UNIT, &Params::new())?;
        Ok(Value::Object(result))
    }

    /// Check one assertion against a snapshot. A violation fails the run.
    pub fn execute_assertion(&self, assertion: &Assertion, state: &Value) -> Result<()> {
        assertion::evaluate(assertion, state).map_err(Into::into)
    }

    /// Invoke the designated cleanup unit. Safe to call more than once.
    pub fn teardown(&mut self) -> Result<()> {
        self.registry.invoke(TEARDOWN_UNIT, &Params::new())?;
        Ok(())
    }
}

/// Build a process-backed sandbox from a directory's testability manifest.
#[instrument(skip(processes), fields(dir = %dir.display()))]
pub fn process_sandbox_from_dir(dir: &Path, processes: ProcessSandbox) -> Result<TestableSandbox> {
    let manifest = SandboxManifest::load(&manifest_path(dir))
        .with_context(|| format!("load sandbox manifest for {}", dir.display()))?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sandbox".to_string());
    Ok(build_process_sandbox(&name, &manifest, processes))
}

/// Register the designated units plus one unit per manifest action.
///
/// `start` offers every declared action; each action launches its argv
/// through the shared process sandbox and offers its `next` list;
/// `read_state` aggregates worker reports; `teardown` stops everything.
pub fn build_process_sandbox(
    name: &str,
    manifest: &SandboxManifest,
    processes: ProcessSandbox,
) -> TestableSandbox {
    let processes = Arc::new(Mutex::new(processes));
    let mut registry = ActionRegistry::new();

    let entry_actions: Vec<Value> = manifest
        .actions
        .iter()
        .map(|action| Value::String(action.name.clone()))
        .collect();
    registry.register(START_UNIT, &manifest.description, move |_| {
        Ok(json!({ "status": "ready", "actions": entry_actions.clone() }))
    });

    for spec in &manifest.actions {
        let argv = spec.command.clone();
        let next: Vec<Value> = spec.next.iter().cloned().map(Value::String).collect();
        let procs = Arc::clone(&processes);
        registry.register(&spec.name, &spec.description, move |params| {
            let argv = substitute_params(&argv, params);
            lock(&procs).launch(&argv)?;
            Ok(json!({ "status": "running", "actions": next.clone() }))
        });
    }

    let procs = Arc::clone(&processes);
    registry.register(
        READ_STATE_UNIT,
        "Read the observable state of every worker",
        move |_| lock(&procs).read_state(),
    );

    let procs = Arc::clone(&processes);
    registry.register(
        TEARDOWN_UNIT,
        "Stop all workers and release their records",
        move |_| {
            lock(&procs).teardown_all();
            Ok(json!({ "status": "ok" }))
        },
    );

    TestableSandbox::new(name, registry)
}

fn lock(processes: &Arc<Mutex<ProcessSandbox>>) -> MutexGuard<'_, ProcessSandbox> {
    match processes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Replace `{key}` placeholders in each argv element with decision
/// parameters. Unknown placeholders are left as-is.
fn substitute_params(argv: &[String], params: &Params) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (key, value) in params {
                let needle = format!("{{{key}}}");
                if out.contains(&needle) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&needle, &rendered);
                }
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::manifest::ActionSpec;
    use crate::io::process::WorkerPhase;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn manifest(command: &[&str], next: &[&str]) -> SandboxManifest {
        SandboxManifest {
            description: "fixture".to_string(),
            actions: vec![ActionSpec {
                name: "run".to_string(),
                description: "Run the program under test".to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                next: next.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }

    fn wait_for_status(sandbox: &mut TestableSandbox, status: &str) -> Value {
        for _ in 0..200 {
            let state = sandbox.read_state().expect("read state");
            if state["processes"][0]["status"] == json!(status) {
                return state;
            }
            thread::sleep(Duration::from_millis(25));
        }
        panic!("worker never reached status {status}");
    }

    #[test]
    fn start_offers_manifest_actions() {
        let mut sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "true"], &[]),
            ProcessSandbox::with_defaults(),
        );
        assert!(sandbox.is_valid());

        let actions = sandbox.start().expect("start");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, "run");
        assert_eq!(actions[0].description, "Run the program under test");
        sandbox.teardown().expect("teardown");
    }

    /// Running an action spawns a worker; its state moves from running to
    /// completed with the captured output.
    #[test]
    fn run_action_reaches_completed_state() {
        let mut sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "sleep 1; echo finished"], &[]),
            ProcessSandbox::with_defaults(),
        );
        sandbox.start().expect("start");

        // Terminal branch: no follow-on actions after `run`.
        let actions = sandbox
            .execute_action("run", &Params::new())
            .expect("execute");
        assert!(actions.is_empty());

        let state = sandbox.read_state().expect("read state");
        assert_eq!(state["processes"][0]["status"], json!("running"));

        let state = wait_for_status(&mut sandbox, "completed");
        assert_eq!(state["processes"][0]["return_code"], json!(0));
        assert!(
            state["processes"][0]["stdout"]
                .as_str()
                .expect("stdout")
                .contains("finished")
        );
        sandbox.teardown().expect("teardown");
    }

    #[test]
    fn parameters_substitute_into_the_command() {
        let mut sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "echo {greeting}"], &[]),
            ProcessSandbox::with_defaults(),
        );
        sandbox.start().expect("start");

        let mut params = Params::new();
        params.insert("greeting".to_string(), json!("hello"));
        sandbox.execute_action("run", &params).expect("execute");

        let state = wait_for_status(&mut sandbox, "completed");
        assert!(
            state["processes"][0]["stdout"]
                .as_str()
                .expect("stdout")
                .contains("hello")
        );
        sandbox.teardown().expect("teardown");
    }

    /// start() then teardown() with zero steps leaves the process registry
    /// empty, and a second teardown is a no-op.
    #[test]
    fn zero_step_run_tears_down_cleanly() {
        let mut sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "sleep 30"], &[]),
            ProcessSandbox::with_defaults(),
        );
        sandbox.start().expect("start");
        sandbox.teardown().expect("teardown");

        let state = sandbox.read_state().expect("read state");
        assert_eq!(state["processes"], json!([]));

        sandbox.teardown().expect("second teardown");
    }

    #[test]
    fn teardown_stops_live_workers() {
        let mut sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "sleep 30"], &["run"]),
            ProcessSandbox::with_defaults(),
        );
        sandbox.start().expect("start");
        let actions = sandbox
            .execute_action("run", &Params::new())
            .expect("execute");
        assert_eq!(actions[0].name, "run");

        sandbox.teardown().expect("teardown");
        let state = sandbox.read_state().expect("read state");
        assert_eq!(state["processes"], json!([]));
    }

    #[test]
    fn invalid_sandbox_is_detected() {
        let sandbox = TestableSandbox::new("empty", crate::registry::ActionRegistry::new());
        assert!(!sandbox.is_valid());
    }

    #[test]
    fn from_dir_builds_from_the_manifest_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("cli").join("testability");
        std::fs::create_dir_all(&marker).expect("create marker");
        std::fs::write(
            marker.join("sandbox.toml"),
            r#"
description = "CLI under test"

[[action]]
name = "run"
description = "Run it"
command = ["sh", "-c", "true"]
"#,
        )
        .expect("write manifest");

        let sandbox =
            process_sandbox_from_dir(&temp.path().join("cli"), ProcessSandbox::with_defaults())
                .expect("build");
        assert_eq!(sandbox.name(), "cli");
        assert!(sandbox.is_valid());
    }

    /// Asserting equals on a mismatched process status names the path and
    /// both values in the failure.
    #[test]
    fn assertion_failure_names_path_and_values() {
        let sandbox = build_process_sandbox(
            "cli",
            &manifest(&["sh", "-c", "true"], &[]),
            ProcessSandbox::with_defaults(),
        );
        let state = json!({"processes": [{"status": "terminated"}]});
        let assertion = Assertion {
            path: "processes[0].status".to_string(),
            condition: crate::core::assertion::Condition::Equals,
            value: json!("completed"),
        };
        let err = sandbox
            .execute_assertion(&assertion, &state)
            .expect_err("mismatch");
        let message = err.to_string();
        assert!(message.contains("processes[0].status"));
        assert!(message.contains("completed"));
        assert!(message.contains("terminated"));
    }

    #[test]
    fn worker_phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WorkerPhase::Completed).expect("serialize"),
            json!("completed")
        );
    }
}
