//! Typed failure taxonomy shared across the harness.
//!
//! Orchestration code propagates these through `anyhow` and recovers the
//! concrete kind with `downcast_ref` where a caller needs to branch on it.

use serde_json::Value;
use thiserror::Error;

use crate::core::assertion::Condition;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// A plugin unit violated the action protocol.
    #[error("protocol violation in unit '{unit}': {reason}")]
    Protocol { unit: String, reason: String },

    /// An action was requested under a name no registered unit matches.
    #[error("no unit registered under '{name}'")]
    UnitNotFound { name: String },

    /// A worker never completed its startup handshake.
    #[error("worker did not signal readiness within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    /// An assertion path matched nothing in the state snapshot.
    #[error("path '{path}' matched nothing in the state snapshot")]
    NoMatch { path: String },

    /// An assertion condition was violated. Fatal to the run, never retried.
    #[error("assertion failed at '{path}': {condition} expected {expected}, actual {actual}")]
    AssertionFailed {
        path: String,
        condition: Condition,
        expected: Value,
        actual: Value,
    },

    /// The oracle produced a structurally invalid decision.
    #[error("malformed oracle decision: {reason}")]
    DecisionFormat { reason: String },

    /// The exploration loop hit its hard step ceiling.
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u32 },
}
