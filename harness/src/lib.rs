//! Oracle-driven exploratory testing harness.
//!
//! An external decision oracle chooses, step by step, which action to take
//! against a system under test; the harness exposes the target's
//! capabilities as a discoverable action graph, isolates execution in
//! worker processes, evaluates assertions against observed state and
//! records every run as a replayable regression proposal.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (paths, assertions, decisions,
//!   proposals). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (worker processes, manifests,
//!   configuration, the oracle subprocess boundary).
//!
//! Orchestration modules ([`registry`], [`sandbox`], [`scope`],
//! [`explore`]) compose the two into the exploration loop behind the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod explore;
pub mod io;
pub mod logging;
pub mod registry;
pub mod sandbox;
pub mod scope;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
