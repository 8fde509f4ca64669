//! Observed cluster state

use super::application::Application;
use super::deployment::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A volume as reported by the node holding it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeState {
    /// Volume name
    pub name: String,
    /// Node reporting the volume
    pub node: NodeId,
}

/// Last self-reported observation of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Reporting node
    pub hostname: NodeId,
    /// Running applications by name
    pub applications: BTreeMap<String, Application>,
    /// Locally owned volumes by name
    pub volumes: BTreeMap<String, VolumeState>,
}

impl NodeState {
    /// Create an empty observation for a node
    pub fn new(hostname: NodeId) -> Self {
        Self {
            hostname,
            applications: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    /// Record a running application
    pub fn with_application(mut self, application: Application) -> Self {
        self.applications
            .insert(application.name.clone(), application);
        self
    }

    /// Record a locally owned volume
    pub fn with_volume(mut self, name: &str) -> Self {
        self.volumes.insert(
            name.to_string(),
            VolumeState {
                name: name.to_string(),
                node: self.hostname.clone(),
            },
        );
        self
    }

    /// Check whether an application is running
    pub fn is_running(&self, application: &str) -> bool {
        self.applications.contains_key(application)
    }

    /// Check whether a volume is held locally
    pub fn has_volume(&self, volume: &str) -> bool {
        self.volumes.contains_key(volume)
    }
}

/// Cluster-wide current state, one entry per reporting node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Node observations
    pub nodes: BTreeMap<NodeId, NodeState>,
}

impl ClusterState {
    /// Create an empty cluster state
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node observation
    pub fn with_node(mut self, state: NodeState) -> Self {
        self.insert(state);
        self
    }

    /// Add or replace a node observation
    pub fn insert(&mut self, state: NodeState) {
        self.nodes.insert(state.hostname.clone(), state);
    }

    /// Observation for a node
    pub fn node(&self, hostname: &NodeId) -> Option<&NodeState> {
        self.nodes.get(hostname)
    }

    /// All reported volumes across the cluster
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeState> {
        self.nodes.values().flat_map(|node| node.volumes.values())
    }
}
