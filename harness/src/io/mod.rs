//! Side-effecting adapters: worker processes, manifests, configuration and
//! the oracle subprocess boundary. Isolated from core logic to keep the
//! deterministic pieces mockable in tests.

pub mod config;
pub mod manifest;
pub mod oracle;
pub mod process;
