//! Runtime settings
//!
//! Priority: CLI > environment (`PGR_PATHMAN_*`) > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::info;

use crate::core::Result;

const CONFIG_PATHS: [&str; 2] = ["/etc/pgr_pathman/pgr_pathman.toml", "./pgr_pathman.toml"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathmanSettings {
    /// Process-wide partitioning switch
    pub enable: bool,
    /// Create partitions for inserts no partition covers
    pub enable_auto_partition: bool,
    /// Allow handing partition creation to background workers
    pub spawn_using_bgw: bool,
    pub lock_timeout_ms: u64,
    /// How long a backend waits for a background worker
    pub worker_timeout_ms: u64,
    pub worker_threads: usize,
    /// Upper limit of partitions created for one insert
    pub max_spawned_partitions: usize,
    /// Directory of the configuration store; in-memory when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for PathmanSettings {
    fn default() -> Self {
        Self {
            enable: true,
            enable_auto_partition: true,
            spawn_using_bgw: true,
            lock_timeout_ms: 5000,
            worker_timeout_ms: 10_000,
            worker_threads: 2,
            max_spawned_partitions: 1000,
            data_dir: None,
        }
    }
}

impl PathmanSettings {
    /// Loads settings from the first config file found (or `explicit`) and the environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(File::from(path));
                info!(path = %path.display(), "loading settings");
            }
            None => {
                if let Some(path) = CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::with_name(path));
                    info!(path, "loading settings");
                }
            }
        }

        builder = builder.add_source(Environment::with_prefix("PGR_PATHMAN").try_parsing(true));
        Ok(builder.build()?.try_deserialize()?)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub const fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}
