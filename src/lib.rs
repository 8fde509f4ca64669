//! rune-node - per-node convergence agent for Rune deployments
//!
//! Each node runs an agent that compares the desired deployment with the
//! cluster's current state and converges its own share of it:
//!
//! - Applications started and stopped through a container driver
//! - Data volumes that follow their application between nodes
//! - Volume handoff by push, with the source retiring its copy only after
//!   the destination acknowledges it
//! - Deterministic, idempotent planning from explicit state snapshots

pub mod config;
pub mod convergence;
pub mod driver;
pub mod error;
pub mod handoff;
pub mod model;

pub use error::{Result, RuneError};
