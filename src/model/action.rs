//! Planned convergence actions

use super::application::Application;
use super::deployment::NodeId;
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Index of an action within its plan
pub type ActionId = usize;

/// A single step towards the desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Start an application locally
    StartApplication { application: Application },
    /// Stop and remove a local application
    StopApplication { application: Application },
    /// Block until a volume pushed by another node is published locally
    WaitForVolumeArrival { volume: String, from: NodeId },
    /// Push a locally owned volume to another node
    HandoffVolume { volume: String, to: NodeId },
    /// Nothing to do
    NoOp,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::StartApplication { application } => {
                write!(f, "start {}", application.name)
            }
            Action::StopApplication { application } => write!(f, "stop {}", application.name),
            Action::WaitForVolumeArrival { volume, from } => {
                write!(f, "wait for volume {} from {}", volume, from)
            }
            Action::HandoffVolume { volume, to } => write!(f, "hand off volume {} to {}", volume, to),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

/// An action with its ordering edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// Position in the plan
    pub id: ActionId,
    /// The action
    pub action: Action,
    /// Actions that must succeed first; a failure here skips this action
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<ActionId>,
    /// Actions that must finish first, whatever their outcome
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ActionId>,
}

/// A volume whose start is withheld because several nodes claim it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedVolume {
    /// Volume name
    pub volume: String,
    /// Application affected on this node
    pub application: String,
    /// Nodes claiming the volume
    pub claimants: Vec<NodeId>,
    /// Why the volume was withheld
    pub kind: ErrorKind,
    pub error: String,
}

/// Ordered actions for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Node the plan applies to
    pub node: NodeId,
    /// Actions in execution order
    pub actions: Vec<PlannedAction>,
    /// Volumes that could not be acted on this pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<BlockedVolume>,
}

impl Plan {
    /// Check if there is nothing to execute
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Check if the node is fully converged
    pub fn is_converged(&self) -> bool {
        self.actions.is_empty() && self.blocked.is_empty()
    }

    /// Bare actions in order
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().map(|planned| &planned.action)
    }

    /// Position of the first action matching `predicate`
    pub fn position(&self, predicate: impl Fn(&Action) -> bool) -> Option<ActionId> {
        self.actions.iter().position(|planned| predicate(&planned.action))
    }
}
