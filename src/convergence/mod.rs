//! Convergence of a node towards the desired deployment
//!
//! A pass observes the local node, plans against the cluster-wide current
//! state, and executes the plan through the local drivers.

pub mod agent;
pub mod collector;
pub mod executor;
pub mod ownership;
pub mod planner;

pub use agent::ConvergenceAgent;
pub use collector::{unit_name, Collector, APPLICATION_LABEL};
pub use executor::{
    ActionExecutor, ActionOutcome, ActionResult, Drivers, ExecutionReport, ExecutorConfig,
};
pub use ownership::{owner_of, Ownership, OwnershipIndex};
pub use planner::plan;
