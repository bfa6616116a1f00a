use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

/// Service-level knobs. Loaded from a YAML file when one exists; every field
/// has a sensible default so an empty deployment still boots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Directory watched for config resources.
    pub config_root: PathBuf,
    /// Config store poll tick, milliseconds.
    pub poll_interval_ms: u64,
    /// Compiled-program LRU capacity.
    pub expression_cache_size: usize,
    /// Grace period before a dropped handler is closed, milliseconds.
    pub drain_grace_ms: u64,
    /// Check validity returned when no rule matched.
    pub default_valid_duration_secs: u64,
    pub default_valid_use_count: i64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            config_root: PathBuf::from("config"),
            poll_interval_ms: 500,
            expression_cache_size: 1024,
            drain_grace_ms: 5000,
            default_valid_duration_secs: 10,
            default_valid_use_count: 200,
        }
    }
}

impl MeshConfig {
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|err| ServiceError::Startup(format!("read {}: {err}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|err| ServiceError::Startup(format!("parse {}: {err}", path.display())))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn default_valid_duration(&self) -> Duration {
        Duration::from_secs(self.default_valid_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = MeshConfig::load(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config.default_valid_use_count, 200);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }
}
