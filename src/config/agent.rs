//! Node agent settings

use crate::convergence::ExecutorConfig;
use crate::error::{Result, RuneError};
use crate::handoff::DEFAULT_TRANSFER_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory holding volumes and unit records
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rune-node";

/// Default prefix of the units this agent manages
pub const DEFAULT_NAMESPACE: &str = "rune--";

/// Node agent settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name this node goes by in deployments
    pub hostname: String,
    /// Root of the agent's local data
    pub data_dir: PathBuf,
    /// Port of the transfer endpoint on every node
    pub transfer_port: u16,
    pub transfer_timeout_secs: u64,
    pub arrival_timeout_secs: u64,
    pub arrival_poll_interval_ms: u64,
    /// Prefix of the units this agent manages
    pub namespace: String,
    /// Largest snapshot the transfer endpoint accepts, unlimited when unset
    pub max_transfer_bytes: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            transfer_port: DEFAULT_TRANSFER_PORT,
            transfer_timeout_secs: 300,
            arrival_timeout_secs: 600,
            arrival_poll_interval_ms: 1000,
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_transfer_bytes: None,
        }
    }
}

impl AgentConfig {
    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuneError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
    }

    /// Parse settings from YAML
    pub fn parse_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(RuneError::Configuration("hostname must not be empty".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(RuneError::Configuration("namespace must not be empty".to_string()));
        }
        if self.arrival_poll_interval_ms == 0 {
            return Err(RuneError::Configuration(
                "arrival_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding published volumes
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Directory holding unit records
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("units")
    }

    /// Executor settings derived from these
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            namespace: self.namespace.clone(),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
            arrival_timeout: Duration::from_secs(self.arrival_timeout_secs),
            arrival_poll_interval: Duration::from_millis(self.arrival_poll_interval_ms),
            link_host: self.hostname.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = AgentConfig::parse_str("hostname: node1\ntransfer_port: 9000\n").unwrap();
        assert_eq!(config.hostname, "node1");
        assert_eq!(config.transfer_port, 9000);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.max_transfer_bytes, None);
        assert_eq!(config.volumes_dir(), PathBuf::from("/var/lib/rune-node/volumes"));

        let executor = config.executor_config();
        assert_eq!(executor.transfer_timeout, Duration::from_secs(300));
        assert_eq!(executor.link_host, "node1");
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.yml");
        std::fs::write(
            &path,
            "hostname: node2\ndata_dir: /srv/rune\nmax_transfer_bytes: 1073741824\n",
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.max_transfer_bytes, Some(1 << 30));
        assert_eq!(config.state_dir(), PathBuf::from("/srv/rune/units"));
        assert!(AgentConfig::from_file(&dir.path().join("missing.yml")).is_err());
    }

    #[test]
    fn test_invalid_settings() {
        assert!(AgentConfig::parse_str("namespace: ''\n").is_err());
        assert!(AgentConfig::parse_str("transfer_port: not-a-port\n").is_err());
    }
}
