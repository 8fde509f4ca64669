//! Desired cluster topology

use super::application::Application;
use crate::error::{Result, RuneError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Node identity (hostname or address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identity
    pub fn new(hostname: &str) -> Self {
        Self(hostname.to_string())
    }

    /// Hostname or address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(hostname: &str) -> Self {
        Self::new(hostname)
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static pattern is valid")
    })
}

/// Check that a name is usable as an application, volume, and unit name
pub fn validate_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(RuneError::Configuration(format!(
            "Invalid name {:?}: must match [A-Za-z0-9][A-Za-z0-9_.-]*",
            name
        )))
    }
}

/// Desired configuration of the whole cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Application names assigned to each node
    pub nodes: BTreeMap<NodeId, BTreeSet<String>>,
    /// Application definitions by name
    pub applications: BTreeMap<String, Application>,
}

impl Deployment {
    /// Create a deployment from application definitions
    pub fn new(applications: impl IntoIterator<Item = Application>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            applications: applications
                .into_iter()
                .map(|app| (app.name.clone(), app))
                .collect(),
        }
    }

    /// Declare a node, possibly with no applications
    pub fn node(mut self, hostname: &str) -> Self {
        self.nodes.entry(NodeId::new(hostname)).or_default();
        self
    }

    /// Assign an application to a node
    pub fn assign(mut self, hostname: &str, application: &str) -> Self {
        self.nodes
            .entry(NodeId::new(hostname))
            .or_default()
            .insert(application.to_string());
        self
    }

    /// Validate internal consistency
    pub fn validate(&self) -> Result<()> {
        for (name, app) in &self.applications {
            if name != &app.name {
                return Err(RuneError::Configuration(format!(
                    "Application registered as {} is named {}",
                    name, app.name
                )));
            }
            validate_name(name)?;

            if let Some(ref volume) = app.volume {
                if volume.name != app.name {
                    return Err(RuneError::Configuration(format!(
                        "Volume {} must be named after its application {}",
                        volume.name, app.name
                    )));
                }
                if !volume.mountpoint.is_absolute() {
                    return Err(RuneError::Configuration(format!(
                        "Mountpoint for {} must be an absolute path: {}",
                        app.name,
                        volume.mountpoint.display()
                    )));
                }
            }

            if app.links.iter().any(|link| link.alias.trim().is_empty()) {
                return Err(RuneError::Configuration(format!(
                    "Application {} has a link without an alias",
                    app.name
                )));
            }
        }

        let mut placements: BTreeMap<&str, &NodeId> = BTreeMap::new();
        for (node, names) in &self.nodes {
            let mut external_ports = BTreeSet::new();

            for name in names {
                let app = self.applications.get(name).ok_or_else(|| {
                    RuneError::Configuration(format!(
                        "Node {} references unknown application {}",
                        node, name
                    ))
                })?;

                if let Some(other) = placements.insert(name.as_str(), node) {
                    return Err(RuneError::Configuration(format!(
                        "Application {} is assigned to both {} and {}",
                        name, other, node
                    )));
                }

                for port in &app.ports {
                    if !external_ports.insert(port.external_port) {
                        return Err(RuneError::Configuration(format!(
                            "External port {} is published twice on node {}",
                            port.external_port, node
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Applications assigned to `node`, ordered by name
    pub fn applications_on(&self, node: &NodeId) -> Vec<&Application> {
        self.nodes
            .get(node)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.applications.get(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Node an application is assigned to
    pub fn node_for(&self, application: &str) -> Option<&NodeId> {
        self.nodes
            .iter()
            .find(|(_, names)| names.contains(application))
            .map(|(node, _)| node)
    }

    /// Node that desires a volume
    ///
    /// Fails when more than one node desires it.
    pub fn node_for_volume(&self, volume: &str) -> Result<Option<&NodeId>> {
        let mut found: Option<&NodeId> = None;

        for (node, names) in &self.nodes {
            let wants = names.iter().any(|name| {
                self.applications
                    .get(name)
                    .and_then(|app| app.volume_name())
                    == Some(volume)
            });
            if !wants {
                continue;
            }
            if let Some(other) = found {
                return Err(RuneError::Configuration(format!(
                    "Volume {} is desired on both {} and {}",
                    volume, other, node
                )));
            }
            found = Some(node);
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::application::DockerImage;

    fn app(name: &str) -> Application {
        Application::new(name, DockerImage::from_string("busybox").unwrap())
    }

    #[test]
    fn test_applications_on_node() {
        let deployment = Deployment::new(vec![app("web"), app("db"), app("cache")])
            .assign("node1", "web")
            .assign("node1", "db")
            .assign("node2", "cache");

        let names: Vec<&str> = deployment
            .applications_on(&NodeId::new("node1"))
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["db", "web"]);
        assert_eq!(deployment.node_for("cache"), Some(&NodeId::new("node2")));
        assert!(deployment.applications_on(&NodeId::new("node3")).is_empty());
        assert!(deployment.validate().is_ok());
    }

    #[test]
    fn test_unknown_application_rejected() {
        let deployment = Deployment::new(vec![app("web")]).assign("node1", "db");
        let err = deployment.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_application_on_two_nodes_rejected() {
        let deployment = Deployment::new(vec![app("db").volume("/data")])
            .assign("node1", "db")
            .assign("node2", "db");

        assert!(deployment.validate().is_err());
        assert!(deployment.node_for_volume("db").is_err());
    }

    #[test]
    fn test_duplicate_external_port_rejected() {
        let deployment = Deployment::new(vec![app("a").port(80, 8080), app("b").port(81, 8080)])
            .assign("node1", "a")
            .assign("node1", "b");
        assert!(deployment.validate().is_err());

        let spread = Deployment::new(vec![app("a").port(80, 8080), app("b").port(81, 8080)])
            .assign("node1", "a")
            .assign("node2", "b");
        assert!(spread.validate().is_ok());
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(validate_name("postgres-volume-example").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("").is_err());

        let deployment = Deployment::new(vec![app("a/b")]);
        assert!(deployment.validate().is_err());
    }

    #[test]
    fn test_relative_mountpoint_rejected() {
        let deployment = Deployment::new(vec![app("db").volume("data")]).assign("node1", "db");
        assert!(deployment.validate().is_err());
    }

    #[test]
    fn test_node_for_volume() {
        let deployment = Deployment::new(vec![app("db").volume("/data"), app("web")])
            .assign("node2", "db")
            .assign("node1", "web");

        assert_eq!(
            deployment.node_for_volume("db").unwrap(),
            Some(&NodeId::new("node2"))
        );
        assert_eq!(deployment.node_for_volume("web").unwrap(), None);
    }
}
