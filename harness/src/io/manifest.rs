//! Testability manifest describing a process-backed sandbox.
//!
//! A sandbox directory opts into exploration by carrying a
//! `testability/sandbox.toml`:
//!
//! ```toml
//! description = "CLI under test"
//!
//! [[action]]
//! name = "run"
//! description = "Run the program"
//! command = ["sh", "-c", "my-cli --smoke"]
//! next = []
//! ```
//!
//! `next` lists the actions offered after this one; empty means the branch
//! is terminal.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Marker subdirectory that makes a directory a testable sandbox.
pub const MARKER_DIR: &str = "testability";
pub const MANIFEST_FILE: &str = "sandbox.toml";

/// Unit names the harness registers itself; actions may not shadow them.
const RESERVED_NAMES: [&str; 3] = ["start", "read_state", "teardown"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxManifest {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Worker argv; `{key}` placeholders are filled from decision parameters.
    pub command: Vec<String>,
    /// Actions offered once this one has launched; empty means terminal.
    #[serde(default)]
    pub next: Vec<String>,
}

impl SandboxManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let manifest: SandboxManifest =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.actions.is_empty() {
            return Err(anyhow!("manifest declares no actions"));
        }
        let mut seen = BTreeSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(anyhow!("action names must be non-empty"));
            }
            if RESERVED_NAMES.contains(&action.name.as_str()) {
                return Err(anyhow!("action name '{}' is reserved", action.name));
            }
            if !seen.insert(action.name.as_str()) {
                return Err(anyhow!("duplicate action name '{}'", action.name));
            }
            if action.command.is_empty() || action.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "action '{}' must declare a non-empty command",
                    action.name
                ));
            }
        }
        for action in &self.actions {
            for next in &action.next {
                if !self.actions.iter().any(|a| &a.name == next) {
                    return Err(anyhow!(
                        "action '{}' references undeclared action '{}'",
                        action.name,
                        next
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Canonical manifest location inside a sandbox directory.
pub fn manifest_path(sandbox_dir: &Path) -> PathBuf {
    sandbox_dir.join(MARKER_DIR).join(MANIFEST_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
description = "CLI under test"

[[action]]
name = "run"
description = "Run the program"
command = ["sh", "-c", "true"]
next = ["run"]
"#;

    #[test]
    fn parses_and_validates_a_manifest() {
        let manifest: SandboxManifest = toml::from_str(SAMPLE).expect("parse");
        manifest.validate().expect("valid");
        assert_eq!(manifest.actions.len(), 1);
        assert_eq!(manifest.actions[0].next, vec!["run"]);
    }

    #[test]
    fn rejects_reserved_and_dangling_names() {
        let mut manifest: SandboxManifest = toml::from_str(SAMPLE).expect("parse");
        manifest.actions[0].name = "teardown".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest: SandboxManifest = toml::from_str(SAMPLE).expect("parse");
        manifest.actions[0].next = vec!["ghost".to_string()];
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = SandboxManifest::load(&temp.path().join("sandbox.toml")).expect_err("missing");
        assert!(err.to_string().contains("read"));
    }
}
