//! Application definitions

use crate::error::{Result, RuneError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Default image tag
pub const DEFAULT_TAG: &str = "latest";

/// Container image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DockerImage {
    /// Repository, including any registry host
    pub repository: String,
    /// Tag
    pub tag: String,
}

impl DockerImage {
    /// Parse an image reference of the form `repository[:tag]`
    ///
    /// A colon that belongs to a registry host (`registry:5000/app`) is not
    /// treated as a tag separator.
    pub fn from_string(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RuneError::Configuration(
                "Image reference must not be empty".to_string(),
            ));
        }

        let last_segment_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match reference[last_segment_start..].rfind(':') {
            Some(pos) => {
                let split = last_segment_start + pos;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(RuneError::Configuration(format!(
                "Invalid image reference: {}",
                reference
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Full `repository:tag` reference
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for DockerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Published port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMap {
    /// Port inside the container
    pub internal_port: u16,
    /// Port published on the node
    pub external_port: u16,
}

/// Link to an application that may run on another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    /// Port the linked application is reached on from this node
    pub local_port: u16,
    /// Port the linked application listens on
    pub remote_port: u16,
    /// Alias used to name the environment variables
    pub alias: String,
}

impl Link {
    /// Environment variables describing this link
    ///
    /// `host` is the address the container reaches the link through.
    pub fn environment(&self, host: &str) -> BTreeMap<String, String> {
        let prefix = format!(
            "{}_PORT_{}_TCP",
            self.alias.to_uppercase().replace('-', "_"),
            self.remote_port
        );

        let mut env = BTreeMap::new();
        env.insert(
            prefix.clone(),
            format!("tcp://{}:{}", host, self.local_port),
        );
        env.insert(format!("{}_PROTO", prefix), "tcp".to_string());
        env.insert(format!("{}_ADDR", prefix), host.to_string());
        env.insert(format!("{}_PORT", prefix), self.local_port.to_string());
        env
    }
}

/// Volume attached to an application
///
/// The volume name always equals the owning application's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachedVolume {
    /// Volume name
    pub name: String,
    /// Mount point inside the container
    pub mountpoint: PathBuf,
}

/// Application that should run (desired) or is running (current) on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Application {
    /// Cluster-wide unique name
    pub name: String,
    /// Image
    pub image: DockerImage,
    /// Published ports
    #[serde(default)]
    pub ports: BTreeSet<PortMap>,
    /// Environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Links to other applications
    #[serde(default)]
    pub links: BTreeSet<Link>,
    /// Attached data volume
    #[serde(default)]
    pub volume: Option<AttachedVolume>,
}

impl Application {
    /// Create a new application
    pub fn new(name: &str, image: DockerImage) -> Self {
        Self {
            name: name.to_string(),
            image,
            ports: BTreeSet::new(),
            environment: BTreeMap::new(),
            links: BTreeSet::new(),
            volume: None,
        }
    }

    /// Add a published port
    pub fn port(mut self, internal_port: u16, external_port: u16) -> Self {
        self.ports.insert(PortMap {
            internal_port,
            external_port,
        });
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a link
    pub fn link(mut self, local_port: u16, remote_port: u16, alias: &str) -> Self {
        self.links.insert(Link {
            local_port,
            remote_port,
            alias: alias.to_string(),
        });
        self
    }

    /// Attach the application's volume at `mountpoint`
    pub fn volume(mut self, mountpoint: &str) -> Self {
        self.volume = Some(AttachedVolume {
            name: self.name.clone(),
            mountpoint: PathBuf::from(mountpoint),
        });
        self
    }

    /// Name of the attached volume, if any
    pub fn volume_name(&self) -> Option<&str> {
        self.volume.as_ref().map(|v| v.name.as_str())
    }
}
