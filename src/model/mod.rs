//! Cluster state model
//!
//! Plain data describing desired and observed cluster state, and the
//! actions a convergence pass plans to move between them.

pub mod action;
pub mod application;
pub mod deployment;
pub mod state;

pub use action::{Action, ActionId, BlockedVolume, Plan, PlannedAction};
pub use application::{Application, AttachedVolume, DockerImage, Link, PortMap};
pub use deployment::{Deployment, NodeId};
pub use state::{ClusterState, NodeState, VolumeState};
