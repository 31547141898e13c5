//! Pure, deterministic harness logic.
//!
//! Nothing in here performs I/O or spawns processes; every function is a
//! plain mapping from inputs to outputs so it can be tested in isolation.

pub mod assertion;
pub mod decision;
pub mod path;
pub mod proposal;
