//! Volume ownership tracking

use crate::error::{Result, RuneError};
use crate::model::{ClusterState, NodeId};
use std::collections::BTreeMap;

/// Who holds the authoritative copy of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No node reports the volume
    Unowned,
    /// Exactly one node reports the volume
    Owned(NodeId),
    /// Several nodes report the volume
    Ambiguous(Vec<NodeId>),
}

/// Index of volume ownership built from one cluster snapshot
#[derive(Debug, Clone, Default)]
pub struct OwnershipIndex {
    claims: BTreeMap<String, Vec<NodeId>>,
}

impl OwnershipIndex {
    /// Build the index from reported node states
    pub fn new(cluster: &ClusterState) -> Self {
        let mut claims: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for volume in cluster.volumes() {
            let nodes = claims.entry(volume.name.clone()).or_default();
            if !nodes.contains(&volume.node) {
                nodes.push(volume.node.clone());
            }
        }
        for nodes in claims.values_mut() {
            nodes.sort();
        }
        Self { claims }
    }

    /// Ownership of a volume
    pub fn ownership(&self, volume: &str) -> Ownership {
        match self.claims.get(volume).map(Vec::as_slice) {
            None | Some([]) => Ownership::Unowned,
            Some([owner]) => Ownership::Owned(owner.clone()),
            Some(nodes) => Ownership::Ambiguous(nodes.to_vec()),
        }
    }

    /// Owner of a volume, failing when ownership is ambiguous
    pub fn owner_of(&self, volume: &str) -> Result<Option<NodeId>> {
        match self.ownership(volume) {
            Ownership::Unowned => Ok(None),
            Ownership::Owned(node) => Ok(Some(node)),
            Ownership::Ambiguous(nodes) => Err(RuneError::AmbiguousOwnership {
                volume: volume.to_string(),
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
            }),
        }
    }

    /// Volumes claimed by more than one node
    pub fn conflicts(&self) -> impl Iterator<Item = (&str, &[NodeId])> {
        self.claims
            .iter()
            .filter(|(_, nodes)| nodes.len() > 1)
            .map(|(volume, nodes)| (volume.as_str(), nodes.as_slice()))
    }
}

/// Owner of a volume in a cluster snapshot
pub fn owner_of(volume: &str, cluster: &ClusterState) -> Result<Option<NodeId>> {
    OwnershipIndex::new(cluster).owner_of(volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeState;

    fn node(name: &str) -> NodeState {
        NodeState::new(NodeId::new(name))
    }

    #[test]
    fn test_unowned_volume() {
        let cluster = ClusterState::new().with_node(node("node1"));
        assert_eq!(owner_of("db", &cluster).unwrap(), None);
    }

    #[test]
    fn test_single_owner() {
        let cluster = ClusterState::new()
            .with_node(node("node1").with_volume("db"))
            .with_node(node("node2").with_volume("cache"));

        assert_eq!(
            owner_of("db", &cluster).unwrap(),
            Some(NodeId::new("node1"))
        );
        assert_eq!(
            owner_of("cache", &cluster).unwrap(),
            Some(NodeId::new("node2"))
        );
    }

    #[test]
    fn test_conflicting_claims_reported() {
        let cluster = ClusterState::new()
            .with_node(node("node2").with_volume("db"))
            .with_node(node("node1").with_volume("db"));

        let index = OwnershipIndex::new(&cluster);
        assert_eq!(
            index.ownership("db"),
            Ownership::Ambiguous(vec![NodeId::new("node1"), NodeId::new("node2")])
        );

        match owner_of("db", &cluster) {
            Err(RuneError::AmbiguousOwnership { volume, nodes }) => {
                assert_eq!(volume, "db");
                assert_eq!(nodes, vec!["node1".to_string(), "node2".to_string()]);
            }
            other => panic!("expected ambiguous ownership, got {:?}", other),
        }

        let conflicts: Vec<&str> = index.conflicts().map(|(v, _)| v).collect();
        assert_eq!(conflicts, vec!["db"]);
    }
}
