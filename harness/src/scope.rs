//! Discovery of testable sandboxes and rule documents.
//!
//! A scope root is a directory whose immediate subdirectories may each be a
//! testable sandbox: any directory carrying a `testability/sandbox.toml`
//! manifest qualifies; everything else is skipped silently. Rule documents
//! are plain markdown files handed to the oracle verbatim.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::config::HarnessConfig;
use crate::io::manifest::manifest_path;
use crate::io::process::ProcessSandbox;
use crate::sandbox::{TestableSandbox, process_sandbox_from_dir};

/// One human-readable rule document for the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    pub name: String,
    pub content: String,
}

/// Walk the immediate subdirectories of `root` and build a sandbox for
/// each directory carrying a testability manifest.
///
/// Each sandbox gets its own process registry sized from `config`.
/// Directories without the marker are not errors; a present but broken
/// manifest is.
#[instrument(skip(config), fields(root = %root.display()))]
pub fn discover_sandboxes(root: &Path, config: &HarnessConfig) -> Result<Vec<TestableSandbox>> {
    let entries =
        fs::read_dir(root).with_context(|| format!("read scope directory {}", root.display()))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut sandboxes = Vec::new();
    for dir in dirs {
        if !manifest_path(&dir).is_file() {
            debug!(dir = %dir.display(), "no testability manifest, skipping");
            continue;
        }
        let processes = ProcessSandbox::new(
            config.startup_timeout(),
            config.shutdown_grace(),
            config.output_limit_bytes,
        );
        let sandbox = process_sandbox_from_dir(&dir, processes)?;
        if !sandbox.is_valid() {
            debug!(dir = %dir.display(), "designated units missing, skipping");
            continue;
        }
        sandboxes.push(sandbox);
    }
    Ok(sandboxes)
}

/// Read every markdown document in `dir` into `{name, content}` pairs,
/// sorted by file name.
pub fn load_rule_documents(dir: &Path) -> Result<Vec<RuleDocument>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("read rules directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let content =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        documents.push(RuleDocument { name, content });
    }
    Ok(documents)
}
