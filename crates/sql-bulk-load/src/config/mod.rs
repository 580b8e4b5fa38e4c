//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    ///
    /// Only the connection and output sections take part: the input section
    /// describes the bundled runner's source and may legitimately change
    /// (more workers, a different page size) between a crash and a resume.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_yaml::to_string(&self.connection).unwrap_or_default());
        hasher.update(serde_yaml::to_string(&self.output).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

impl ConnectionConfig {
    /// Build a key/value connection string for tokio-postgres.
    pub fn postgres_connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} application_name={}",
            self.host,
            self.port(),
            self.database,
            self.user,
            self.password,
            self.ssl_mode,
            self.application_name
        )
    }
}
