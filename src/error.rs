//! Error types for the Rune node agent

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for node agent operations
pub type Result<T> = std::result::Result<T, RuneError>;

/// Node agent error types
#[derive(Error, Debug)]
pub enum RuneError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Ambiguous ownership of volume {}: claimed by {}", .volume, .nodes.join(", "))]
    AmbiguousOwnership { volume: String, nodes: Vec<String> },

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes surfaced in execution reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or contradictory desired state
    Configuration,
    /// Container or volume operation failed
    Driver,
    /// Handoff failed or timed out
    Transfer,
    /// More than one node claims a volume
    AmbiguousOwnership,
}

impl RuneError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuneError::Configuration(_) | RuneError::Yaml(_) => ErrorKind::Configuration,
            RuneError::AmbiguousOwnership { .. } => ErrorKind::AmbiguousOwnership,
            RuneError::Transfer(_) | RuneError::Timeout(_) => ErrorKind::Transfer,
            RuneError::Container(_)
            | RuneError::ContainerNotFound(_)
            | RuneError::ContainerExists(_)
            | RuneError::VolumeNotFound(_)
            | RuneError::VolumeExists(_)
            | RuneError::Driver(_)
            | RuneError::Lock(_)
            | RuneError::Io(_)
            | RuneError::Json(_)
            | RuneError::Internal(_) => ErrorKind::Driver,
        }
    }

    /// Check if this error is fatal to planning
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

impl From<serde_yaml::Error> for RuneError {
    fn from(err: serde_yaml::Error) -> Self {
        RuneError::Yaml(err.to_string())
    }
}
