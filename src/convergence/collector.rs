//! Current-state collection for the local node

use crate::driver::{ContainerDriver, UnitState, VolumeDriver};
use crate::error::Result;
use crate::model::{Application, AttachedVolume, DockerImage, NodeId, NodeState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Label holding the serialized application a unit was created from
pub const APPLICATION_LABEL: &str = "rune.node.application";

/// Unit name for an application under the agent namespace
pub fn unit_name(namespace: &str, application: &str) -> String {
    format!("{}{}", namespace, application)
}

/// Builds a `NodeState` from what the local drivers report
#[derive(Clone)]
pub struct Collector {
    local: NodeId,
    namespace: String,
    containers: Arc<dyn ContainerDriver>,
    volumes: Arc<dyn VolumeDriver>,
}

impl Collector {
    /// Create a collector
    pub fn new(
        local: NodeId,
        namespace: &str,
        containers: Arc<dyn ContainerDriver>,
        volumes: Arc<dyn VolumeDriver>,
    ) -> Self {
        Self {
            local,
            namespace: namespace.to_string(),
            containers,
            volumes,
        }
    }

    /// Observe the local node
    pub fn collect(&self) -> Result<NodeState> {
        let mut state = NodeState::new(self.local.clone());

        let volumes: BTreeSet<String> = self
            .volumes
            .list_volumes()?
            .into_iter()
            .map(|v| v.name)
            .collect();
        for volume in &volumes {
            state = state.with_volume(volume);
        }

        for unit in self.containers.list_units()? {
            if !unit.is_active() {
                continue;
            }
            if let Some(app) = self.application_from_unit(&unit, &volumes)? {
                state = state.with_application(app);
            }
        }

        debug!(
            "Collected {} application(s) and {} volume(s) on {}",
            state.applications.len(),
            state.volumes.len(),
            self.local
        );
        Ok(state)
    }

    fn application_from_unit(
        &self,
        unit: &UnitState,
        volumes: &BTreeSet<String>,
    ) -> Result<Option<Application>> {
        let Some(name) = unit.name().strip_prefix(&self.namespace) else {
            return Ok(None);
        };

        if let Some(label) = unit.spec.labels.get(APPLICATION_LABEL) {
            match serde_json::from_str::<Application>(label) {
                Ok(app) if app.name == name => return Ok(Some(app)),
                Ok(app) => warn!(
                    "Unit {} carries a label for application {}",
                    unit.name(),
                    app.name
                ),
                Err(e) => warn!("Unreadable application label on {}: {}", unit.name(), e),
            }
        }

        let image = match DockerImage::from_string(&unit.spec.image) {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping unit {}: {}", unit.name(), e);
                return Ok(None);
            }
        };

        let mut app = Application::new(name, image);
        app.ports = unit.spec.ports.iter().copied().collect();
        app.environment = unit.spec.environment.clone();
        app.volume = unit
            .spec
            .mounts
            .iter()
            .find(|mount| {
                volumes.contains(name)
                    && mount.host_path.file_name().and_then(|n| n.to_str()) == Some(name)
            })
            .map(|mount| AttachedVolume {
                name: name.to_string(),
                mountpoint: mount.container_path.clone(),
            });

        Ok(Some(app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        ContainerSpec, FilesystemVolumeDriver, LocalContainerDriver, VolumeMount,
    };
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn spec(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            mounts: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_collect_managed_units_and_volumes() {
        let temp = tempdir().unwrap();
        let containers = Arc::new(LocalContainerDriver::new(temp.path().join("units")).unwrap());
        let volumes = Arc::new(FilesystemVolumeDriver::new(temp.path().join("volumes")).unwrap());

        let db = Application::new("db", DockerImage::from_string("postgres:9.3").unwrap())
            .port(5432, 5433)
            .volume("/var/lib/postgresql/data");
        let mut db_spec = spec("rune--db", "postgres:9.3");
        db_spec.labels.insert(
            APPLICATION_LABEL.to_string(),
            serde_json::to_string(&db).unwrap(),
        );

        containers.create(&db_spec).unwrap();
        containers.create(&spec("unmanaged", "nginx")).unwrap();
        containers.create(&spec("rune--old", "busybox")).unwrap();
        containers.stop("rune--old").unwrap();
        volumes.create_from_local("db").unwrap();

        let collector = Collector::new(NodeId::new("node1"), "rune--", containers, volumes);
        let state = collector.collect().unwrap();

        assert_eq!(state.applications.len(), 1);
        assert_eq!(state.applications["db"], db);
        assert!(state.has_volume("db"));
        assert_eq!(state.volumes["db"].node, NodeId::new("node1"));
    }

    #[test]
    fn test_unlabelled_unit_reconstructed() {
        let temp = tempdir().unwrap();
        let containers = Arc::new(LocalContainerDriver::new(temp.path().join("units")).unwrap());
        let volumes = Arc::new(FilesystemVolumeDriver::new(temp.path().join("volumes")).unwrap());
        let volume = volumes.create_from_local("mysql").unwrap();

        let mut unit = spec("rune--mysql", "mysql:5.6.17");
        unit.environment
            .insert("MYSQL_ROOT_PASSWORD".to_string(), "secret".to_string());
        unit.mounts.push(VolumeMount {
            host_path: volume.path.clone(),
            container_path: PathBuf::from("/var/lib/mysql"),
        });
        containers.create(&unit).unwrap();

        let collector = Collector::new(NodeId::new("node1"), "rune--", containers, volumes);
        let state = collector.collect().unwrap();
        let app = &state.applications["mysql"];

        assert_eq!(app.image.tag, "5.6.17");
        assert_eq!(
            app.environment.get("MYSQL_ROOT_PASSWORD"),
            Some(&"secret".to_string())
        );
        assert_eq!(
            app.volume.as_ref().map(|v| v.mountpoint.clone()),
            Some(PathBuf::from("/var/lib/mysql"))
        );
    }

    #[test]
    fn test_unreadable_unit_skipped() {
        let temp = tempdir().unwrap();
        let containers = Arc::new(LocalContainerDriver::new(temp.path().join("units")).unwrap());
        let volumes = Arc::new(FilesystemVolumeDriver::new(temp.path().join("volumes")).unwrap());

        containers.create(&spec("rune--broken", "nginx:")).unwrap();
        containers.create(&spec("rune--web", "nginx:1.25")).unwrap();

        let collector = Collector::new(NodeId::new("node1"), "rune--", containers, volumes);
        let state = collector.collect().unwrap();

        assert_eq!(state.applications.len(), 1);
        assert_eq!(state.applications["web"].image.tag, "1.25");
    }
}
