//! Container and volume drivers
//!
//! The convergence core talks to the node only through these traits.
//! `LocalContainerDriver` and `FilesystemVolumeDriver` are the
//! implementations the `rune-node` binary runs with.

pub mod container;
pub mod volume;

use crate::error::{Result, RuneError};
use crate::model::PortMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};

pub use container::LocalContainerDriver;
pub use volume::FilesystemVolumeDriver;

/// Whether a unit's container is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    /// Container is running
    Active,
    /// Container exists but is stopped
    Inactive,
}

/// Host directory mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the node
    pub host_path: PathBuf,
    /// Path inside the container
    pub container_path: PathBuf,
}

/// What to create a container from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Unit name, including the agent namespace
    pub name: String,
    /// Full image reference
    pub image: String,
    /// Published ports
    pub ports: Vec<PortMap>,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Volume mounts
    pub mounts: Vec<VolumeMount>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// A container unit as observed by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    /// Creation spec
    pub spec: ContainerSpec,
    /// Activation state
    pub activation: ActivationState,
}

impl UnitState {
    /// Unit name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Check if the unit is running
    pub fn is_active(&self) -> bool {
        self.activation == ActivationState::Active
    }
}

/// A volume held by the local volume driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolume {
    /// Volume name
    pub name: String,
    /// Directory holding the data
    pub path: PathBuf,
}

/// Exported volume contents
///
/// The archive lives in a scratch file that is removed when the snapshot
/// is dropped, so a snapshot never has to fit in memory.
#[derive(Debug)]
pub struct VolumeSnapshot {
    /// Volume name
    pub volume: String,
    /// Gzipped tar archive of the volume directory
    pub archive: TempPath,
    /// Archive length in bytes
    pub size: u64,
    /// SHA-256 of the archive, as `sha256:<hex>`
    pub checksum: String,
}

impl VolumeSnapshot {
    /// Wrap an archive already on disk, computing its digest
    pub fn from_archive(volume: &str, archive: TempPath) -> Result<Self> {
        let (checksum, size) = archive_digest(&archive)?;
        Ok(Self {
            volume: volume.to_string(),
            archive,
            size,
            checksum,
        })
    }
}

/// Digest and length of an archive file
pub fn archive_digest(path: &Path) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut std::fs::File::open(path)?, &mut hasher)?;
    Ok((format!("sha256:{:x}", hasher.finalize()), size))
}

/// Container runtime operations
pub trait ContainerDriver: Send + Sync {
    /// List all units known to the runtime
    fn list_units(&self) -> Result<Vec<UnitState>>;

    /// Create and start a unit
    fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stop a running unit
    fn stop(&self, name: &str) -> Result<()>;

    /// Remove a stopped unit
    fn remove(&self, name: &str) -> Result<()>;
}

/// Local volume storage operations
pub trait VolumeDriver: Send + Sync {
    /// List published volumes
    fn list_volumes(&self) -> Result<Vec<LocalVolume>>;

    /// Create an empty volume
    fn create_from_local(&self, name: &str) -> Result<LocalVolume>;

    /// Scratch file to receive a snapshot archive into
    fn spool(&self) -> Result<NamedTempFile>;

    /// Create a volume from a received snapshot
    ///
    /// The volume must not be listed until its contents are fully in place.
    fn create_from_transfer(&self, snapshot: VolumeSnapshot) -> Result<LocalVolume>;

    /// Export a volume's contents
    fn export_snapshot(&self, name: &str) -> Result<VolumeSnapshot>;

    /// Delete a volume and its data
    fn delete(&self, name: &str) -> Result<()>;
}

/// Run a blocking driver call off the async runtime
///
/// The call runs to completion even if the awaiting future is dropped.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RuneError::Internal(format!("Driver task failed: {}", e)))?
}
