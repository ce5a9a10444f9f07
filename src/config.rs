//! Service Configuration
//!
//! Settings for the `viewcache` server. Defaults come from [`Default`], a YAML
//! file may replace any subset of them, and command line flags (or their
//! environment variables) override the result.
//!
//! ```yaml
//! listen: 0.0.0.0:7300
//! backend: persistent
//! storage_root: /var/lib/viewcache
//! durable_writes: false
//! request_timeout_secs: 10
//! metrics_addr: 0.0.0.0:9300
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Binary data store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local maps, lost on exit
    #[default]
    Memory,
    /// Embedded on-disk environment under `storage_root`
    Persistent,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "persistent" => Ok(BackendKind::Persistent),
            other => Err(Error::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Configuration of the cache service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheServiceConfig {
    /// Protocol listen address
    pub listen: String,
    /// Store backend
    pub backend: BackendKind,
    /// Root directory of the persistent backend
    pub storage_root: PathBuf,
    /// Flush every write to disk before acknowledging it
    pub durable_writes: bool,
    /// Bound on one protocol request, in seconds
    pub request_timeout_secs: u64,
    /// Prometheus endpoint address; disabled when absent
    pub metrics_addr: Option<String>,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7300".to_string(),
            backend: BackendKind::Memory,
            storage_root: PathBuf::from("./viewcache-data"),
            durable_writes: true,
            request_timeout_secs: 30,
            metrics_addr: None,
        }
    }
}

impl CacheServiceConfig {
    /// Load from a YAML file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }
        if self.backend == BackendKind::Persistent && self.storage_root.as_os_str().is_empty() {
            return Err(Error::Config(
                "persistent backend needs a storage_root".into(),
            ));
        }
        Ok(())
    }
}
