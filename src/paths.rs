//! Application path resolution.
//!
//! Config lives in the user config directory, persistent state (the sled
//! database) in the user data directory. When a `config.yaml` sits in the
//! current working directory the daemon runs against that instead, which
//! keeps `cargo run` development painless.

use std::path::PathBuf;
use tracing::debug;

const APP_NAME: &str = "g15d";

/// Resolved locations for config and state.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Path to the configuration file
    pub config: PathBuf,
    /// Path to the state directory (sled database)
    pub state_dir: PathBuf,
}

impl AppPaths {
    /// Detect the appropriate paths based on environment.
    ///
    /// Note: this runs before logging is initialized, so early diagnostics
    /// go to stderr.
    pub fn detect() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cwd_config = cwd.join("config.yaml");
        if cwd_config.exists() {
            eprintln!(
                "[paths] Using config.yaml from cwd: {}",
                cwd.display()
            );
            return Self {
                config: cwd_config,
                state_dir: cwd.join(".state"),
            };
        }

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| cwd.clone())
            .join(APP_NAME);
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| cwd.clone())
            .join(APP_NAME);

        Self {
            config: config_dir.join("config.yaml"),
            state_dir: data_dir.join("state"),
        }
    }

    /// Ensure required directories exist.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(config_parent) = self.config.parent() {
            if !config_parent.exists() {
                debug!("Creating config directory: {}", config_parent.display());
                std::fs::create_dir_all(config_parent)?;
            }
        }
        if !self.state_dir.exists() {
            debug!("Creating state directory: {}", self.state_dir.display());
            std::fs::create_dir_all(&self.state_dir)?;
        }
        Ok(())
    }

    /// Get the sled database path (within state_dir)
    pub fn sled_db_path(&self) -> PathBuf {
        self.state_dir.join("sled")
    }
}
