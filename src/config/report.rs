//! Node state reports
//!
//! A report is what a node publishes about itself after observing its local
//! drivers. The cluster-wide current state handed to the planner is a map of
//! these reports keyed by hostname.

use super::parser::{ApplicationConfig, CONFIG_VERSION};
use crate::error::{Result, RuneError};
use crate::model::deployment::validate_name;
use crate::model::{ClusterState, NodeId, NodeState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Self-reported state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeReport {
    pub version: u32,
    /// Running applications
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConfig>,
    /// Volumes held by the node
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl NodeReport {
    /// Report for an observed node
    pub fn from_state(state: &NodeState) -> Self {
        Self {
            version: CONFIG_VERSION,
            applications: state
                .applications
                .iter()
                .map(|(name, app)| (name.clone(), ApplicationConfig::from_application(app)))
                .collect(),
            volumes: state.volumes.keys().cloned().collect(),
        }
    }

    /// Observed state of the node `hostname` described by this report
    pub fn into_state(self, hostname: NodeId) -> Result<NodeState> {
        if self.version != CONFIG_VERSION {
            return Err(RuneError::Configuration(format!(
                "Unsupported report version from {}: {}",
                hostname, self.version
            )));
        }

        let mut state = NodeState::new(hostname);
        for (name, config) in self.applications {
            state = state.with_application(config.into_application(&name)?);
        }
        for volume in &self.volumes {
            validate_name(volume)?;
            state = state.with_volume(volume);
        }
        Ok(state)
    }
}

/// Render a node's state as report YAML
pub fn report(state: &NodeState) -> Result<String> {
    Ok(serde_yaml::to_string(&NodeReport::from_state(state))?)
}

/// Assemble the cluster state from per-node reports
pub fn cluster_from_reports(reports: BTreeMap<String, NodeReport>) -> Result<ClusterState> {
    let mut cluster = ClusterState::new();
    for (hostname, report) in reports {
        cluster.insert(report.into_state(NodeId::new(&hostname))?);
    }
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Application, DockerImage};

    #[test]
    fn test_report_reads_back() {
        let db = Application::new("db", DockerImage::from_string("postgres:9.3").unwrap())
            .port(5432, 5432)
            .env("POSTGRES_USER", "rune")
            .volume("/var/lib/postgresql/data");
        let state = NodeState::new(NodeId::new("node1"))
            .with_application(db)
            .with_volume("db")
            .with_volume("archive");

        let yaml = report(&state).unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("postgres:9.3"));

        let parsed: NodeReport = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.volumes, vec!["archive".to_string(), "db".to_string()]);
        assert_eq!(parsed.into_state(NodeId::new("node1")).unwrap(), state);
    }

    #[test]
    fn test_unsupported_report_version() {
        let report = NodeReport {
            version: 3,
            applications: BTreeMap::new(),
            volumes: Vec::new(),
        };
        let mut reports = BTreeMap::new();
        reports.insert("node1".to_string(), report);
        assert!(cluster_from_reports(reports).unwrap_err().is_configuration());
    }
}
