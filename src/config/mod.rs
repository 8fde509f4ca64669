//! Agent settings, configuration files and state reports

pub mod agent;
pub mod parser;
pub mod report;

pub use agent::AgentConfig;
pub use parser::{ApplicationConfig, ConfigParser, CONFIG_VERSION};
pub use report::{cluster_from_reports, report, NodeReport};
