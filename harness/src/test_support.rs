//! Test-only helpers: scripted oracles and in-memory sandbox fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::decision::{Decision, DecisionRequest};
use crate::io::manifest::{MANIFEST_FILE, MARKER_DIR};
use crate::io::oracle::Oracle;
use crate::registry::ActionRegistry;
use crate::sandbox::{READ_STATE_UNIT, START_UNIT, TEARDOWN_UNIT, TestableSandbox};

/// Oracle that replays a fixed decision script and records every request
/// it was shown.
pub struct ScriptedOracle {
    decisions: VecDeque<Decision>,
    pub requests: Vec<DecisionRequest>,
}

impl ScriptedOracle {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: decisions.into(),
            requests: Vec::new(),
        }
    }
}

impl Oracle for ScriptedOracle {
    fn decide(&mut self, request: &DecisionRequest) -> Result<Decision> {
        self.requests.push(request.clone());
        self.decisions
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle exhausted"))
    }
}

/// Shared counters observing what a fixture sandbox executed.
#[derive(Debug, Default)]
pub struct SandboxProbe {
    executed: Mutex<Vec<String>>,
    teardowns: Mutex<u32>,
}

impl SandboxProbe {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("probe lock").clone()
    }

    pub fn teardown_count(&self) -> u32 {
        *self.teardowns.lock().expect("probe lock")
    }

    fn record(&self, action: &str) {
        self.executed.lock().expect("probe lock").push(action.to_string());
    }

    fn record_teardown(&self) {
        *self.teardowns.lock().expect("probe lock") += 1;
    }
}

/// In-memory sandbox over a small queue.
///
/// `start` offers `push` and `drain`; `push` appends its `item` parameter
/// and keeps both actions offered; `drain` empties the queue and is
/// terminal; `read_state` reports `{status, queue, depth}`.
pub fn queue_sandbox(probe: Arc<SandboxProbe>) -> TestableSandbox {
    let queue = Arc::new(Mutex::new(Vec::<Value>::new()));
    let mut registry = ActionRegistry::new();

    registry.register(START_UNIT, "Queue fixture", |_| {
        Ok(json!({"status": "ready", "actions": ["push", "drain"]}))
    });

    {
        let queue = Arc::clone(&queue);
        let probe = Arc::clone(&probe);
        registry.register("push", "Append an item to the queue", move |params| {
            probe.record("push");
            let item = params.get("item").cloned().unwrap_or(Value::Null);
            queue.lock().expect("queue lock").push(item);
            Ok(json!({"status": "ok", "actions": ["push", "drain"]}))
        });
    }

    {
        let queue = Arc::clone(&queue);
        let probe = Arc::clone(&probe);
        registry.register("drain", "Empty the queue", move |_| {
            probe.record("drain");
            queue.lock().expect("queue lock").clear();
            Ok(json!({"status": "ok"}))
        });
    }

    {
        let queue = Arc::clone(&queue);
        registry.register(READ_STATE_UNIT, "Report the queue contents", move |_| {
            let queue = queue.lock().expect("queue lock");
            Ok(json!({
                "status": "idle",
                "queue": queue.clone(),
                "depth": queue.len(),
            }))
        });
    }

    {
        let probe = Arc::clone(&probe);
        registry.register(TEARDOWN_UNIT, "Reset the fixture", move |_| {
            probe.record_teardown();
            Ok(json!({"status": "ok"}))
        });
    }

    TestableSandbox::new("queue", registry)
}

/// Write a minimal testability manifest under `dir`, making it a valid
/// process-backed sandbox directory.
pub fn write_process_manifest(dir: &Path, script: &str) -> Result<()> {
    let marker = dir.join(MARKER_DIR);
    std::fs::create_dir_all(&marker)?;
    let manifest = format!(
        r#"description = "Process fixture"

[[action]]
name = "run"
description = "Run the program under test"
command = ["sh", "-c", {script:?}]
"#
    );
    std::fs::write(marker.join(MANIFEST_FILE), manifest)?;
    Ok(())
}
