//! Deployment, application and cluster state file parser

use super::report::{cluster_from_reports, NodeReport};
use crate::error::{Result, RuneError};
use crate::model::deployment::validate_name;
use crate::model::{Application, AttachedVolume, ClusterState, Deployment, DockerImage, Link, PortMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Supported configuration format version
pub const CONFIG_VERSION: u32 = 1;

/// Published port as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    pub internal: u16,
    pub external: u16,
}

/// Link as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub alias: String,
}

/// Volume as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    /// Absolute mount point inside the container
    pub mountpoint: PathBuf,
}

/// Application as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Image reference, `repository[:tag]`
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    /// Scalar values are accepted and kept as strings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeConfig>,
}

impl ApplicationConfig {
    /// Configuration form of an application
    pub fn from_application(app: &Application) -> Self {
        Self {
            image: app.image.full_name(),
            ports: app
                .ports
                .iter()
                .map(|p| PortConfig {
                    internal: p.internal_port,
                    external: p.external_port,
                })
                .collect(),
            environment: app
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), serde_yaml::Value::String(v.clone())))
                .collect(),
            links: app
                .links
                .iter()
                .map(|l| LinkConfig {
                    local_port: l.local_port,
                    remote_port: l.remote_port,
                    alias: l.alias.clone(),
                })
                .collect(),
            volume: app.volume.as_ref().map(|v| VolumeConfig {
                mountpoint: v.mountpoint.clone(),
            }),
        }
    }

    /// Build the application named `name`
    pub fn into_application(self, name: &str) -> Result<Application> {
        validate_name(name)?;

        let mut app = Application::new(name, DockerImage::from_string(&self.image)?);
        for port in self.ports {
            app.ports.insert(PortMap {
                internal_port: port.internal,
                external_port: port.external,
            });
        }

        for (key, value) in self.environment {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(RuneError::Configuration(format!(
                        "Environment variable {} of application {} must be a scalar",
                        key, name
                    )))
                }
            };
            app.environment.insert(key, value);
        }

        for link in self.links {
            if link.alias.is_empty() {
                return Err(RuneError::Configuration(format!(
                    "Link of application {} has an empty alias",
                    name
                )));
            }
            app.links.insert(Link {
                local_port: link.local_port,
                remote_port: link.remote_port,
                alias: link.alias,
            });
        }

        if let Some(volume) = self.volume {
            if !volume.mountpoint.is_absolute() {
                return Err(RuneError::Configuration(format!(
                    "Volume mountpoint of application {} must be absolute: {}",
                    name,
                    volume.mountpoint.display()
                )));
            }
            app.volume = Some(AttachedVolume {
                name: name.to_string(),
                mountpoint: volume.mountpoint,
            });
        }

        Ok(app)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApplicationFile {
    version: u32,
    #[serde(default)]
    applications: BTreeMap<String, ApplicationConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeploymentFile {
    version: u32,
    #[serde(default)]
    nodes: BTreeMap<String, Vec<String>>,
}

fn check_version(version: u32, what: &str) -> Result<()> {
    if version != CONFIG_VERSION {
        return Err(RuneError::Configuration(format!(
            "Unsupported {} configuration version: {}",
            what, version
        )));
    }
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        RuneError::Configuration(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn yaml<T: serde::de::DeserializeOwned>(content: &str, what: &str) -> Result<T> {
    serde_yaml::from_str(content)
        .map_err(|e| RuneError::Configuration(format!("Failed to parse {} YAML: {}", what, e)))
}

/// Configuration file parser
pub struct ConfigParser;

impl ConfigParser {
    /// Parse application definitions
    pub fn parse_applications_str(content: &str) -> Result<BTreeMap<String, Application>> {
        let file: ApplicationFile = yaml(content, "application")?;
        check_version(file.version, "application")?;

        let mut applications = BTreeMap::new();
        for (name, config) in file.applications {
            let app = config.into_application(&name)?;
            applications.insert(name, app);
        }
        Ok(applications)
    }

    /// Parse a deployment against its application definitions
    pub fn parse_deployment_str(deployment: &str, applications: &str) -> Result<Deployment> {
        let applications = Self::parse_applications_str(applications)?;
        let file: DeploymentFile = yaml(deployment, "deployment")?;
        check_version(file.version, "deployment")?;

        let mut result = Deployment::new(applications.into_values());
        for (hostname, names) in file.nodes {
            result = result.node(&hostname);
            for name in names {
                if !result.applications.contains_key(&name) {
                    return Err(RuneError::Configuration(format!(
                        "Node {} lists unknown application {}",
                        hostname, name
                    )));
                }
                result = result.assign(&hostname, &name);
            }
        }

        result.validate()?;
        Ok(result)
    }

    /// Parse deployment and application files
    pub fn parse_deployment_files(deployment: &Path, applications: &Path) -> Result<Deployment> {
        Self::parse_deployment_str(&read(deployment)?, &read(applications)?)
    }

    /// Parse the cluster-wide current state, a map of node reports
    pub fn parse_current_str(content: &str) -> Result<ClusterState> {
        if content.trim().is_empty() {
            return Ok(ClusterState::new());
        }
        let reports: Option<BTreeMap<String, NodeReport>> = yaml(content, "current state")?;
        cluster_from_reports(reports.unwrap_or_default())
    }

    /// Parse a current state file
    pub fn parse_current_file(path: &Path) -> Result<ClusterState> {
        Self::parse_current_str(&read(path)?)
    }
}
