//! Local container unit driver

use super::{ActivationState, ContainerDriver, ContainerSpec, UnitState};
use crate::error::{Result, RuneError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Unit records file name inside the state directory
pub const UNITS_FILE: &str = "units.json";

/// Container driver keeping unit records in a JSON state file
pub struct LocalContainerDriver {
    /// Units indexed by name
    units: Arc<RwLock<BTreeMap<String, UnitState>>>,
    /// State file path
    state_file: PathBuf,
}

impl LocalContainerDriver {
    /// Open the driver, loading any previously recorded units
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;
        let state_file = state_dir.join(UNITS_FILE);

        let units = if state_file.exists() {
            let content = std::fs::read_to_string(&state_file)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            units: Arc::new(RwLock::new(units)),
            state_file,
        })
    }

    fn persist(&self, units: &BTreeMap<String, UnitState>) -> Result<()> {
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(units)?)?;
        std::fs::rename(&tmp, &self.state_file)?;
        Ok(())
    }
}

impl ContainerDriver for LocalContainerDriver {
    fn list_units(&self) -> Result<Vec<UnitState>> {
        let units = self
            .units
            .read()
            .map_err(|_| RuneError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(units.values().cloned().collect())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut units = self
            .units
            .write()
            .map_err(|_| RuneError::Lock("Failed to acquire write lock".to_string()))?;

        if units.contains_key(&spec.name) {
            return Err(RuneError::ContainerExists(spec.name.clone()));
        }

        debug!("Creating unit {} from {}", spec.name, spec.image);
        units.insert(
            spec.name.clone(),
            UnitState {
                spec: spec.clone(),
                activation: ActivationState::Active,
            },
        );
        self.persist(&units)
    }

    fn stop(&self, name: &str) -> Result<()> {
        let mut units = self
            .units
            .write()
            .map_err(|_| RuneError::Lock("Failed to acquire write lock".to_string()))?;

        let unit = units
            .get_mut(name)
            .ok_or_else(|| RuneError::ContainerNotFound(name.to_string()))?;

        debug!("Stopping unit {}", name);
        unit.activation = ActivationState::Inactive;
        self.persist(&units)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut units = self
            .units
            .write()
            .map_err(|_| RuneError::Lock("Failed to acquire write lock".to_string()))?;

        let unit = units
            .get(name)
            .ok_or_else(|| RuneError::ContainerNotFound(name.to_string()))?;

        if unit.is_active() {
            return Err(RuneError::Container(format!(
                "Cannot remove running unit {}",
                name
            )));
        }

        debug!("Removing unit {}", name);
        units.remove(name);
        self.persist(&units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "busybox:latest".to_string(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            mounts: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_create_stop_remove() {
        let temp = tempdir().unwrap();
        let driver = LocalContainerDriver::new(temp.path().to_path_buf()).unwrap();

        driver.create(&spec("rune--web")).unwrap();
        let units = driver.list_units().unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_active());

        assert!(driver.remove("rune--web").is_err());

        driver.stop("rune--web").unwrap();
        assert!(!driver.list_units().unwrap()[0].is_active());

        driver.remove("rune--web").unwrap();
        assert!(driver.list_units().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let temp = tempdir().unwrap();
        let driver = LocalContainerDriver::new(temp.path().to_path_buf()).unwrap();

        driver.create(&spec("rune--web")).unwrap();
        assert!(matches!(
            driver.create(&spec("rune--web")),
            Err(RuneError::ContainerExists(_))
        ));
    }

    #[test]
    fn test_units_survive_reopen() {
        let temp = tempdir().unwrap();
        {
            let driver = LocalContainerDriver::new(temp.path().to_path_buf()).unwrap();
            driver.create(&spec("rune--db")).unwrap();
        }

        let driver = LocalContainerDriver::new(temp.path().to_path_buf()).unwrap();
        let units = driver.list_units().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name(), "rune--db");
    }
}
