//! Configuration file watcher for hot-reload support

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period after the last change event before the file is re-read.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the config file and re-emits the parsed config after each change.
///
/// The parent directory is watched rather than the file itself: editors that
/// save by renaming a temp file over the config replace the inode, which
/// would leave a file-level watch pointing at nothing.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Create a new config watcher for the specified file
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;
        let initial_config = Arc::new(initial_config);

        let path = PathBuf::from(&config_path);
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .with_context(|| format!("Config path has no file name: {}", config_path))?;
        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // Raw change ticks; try_send works from the notify thread and a full
        // buffer just means a tick is already pending
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(1);
        let (tx, rx) = mpsc::channel(10);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    // In-place saves arrive as Modify, rename-replace saves
                    // as Create of the final name
                    let kind_matches =
                        matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if kind_matches && ours {
                        debug!("Config file changed: {:?}", event.paths);
                        let _ = raw_tx.try_send(());
                    }
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                }
            }
        })?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| {
                format!("Failed to watch config directory: {}", watch_dir.display())
            })?;

        tokio::spawn(async move {
            while raw_rx.recv().await.is_some() {
                // Coalesce a burst of events into a single reload
                while let Ok(Some(())) = tokio::time::timeout(DEBOUNCE, raw_rx.recv()).await {}

                match AppConfig::load(&config_path).await {
                    Ok(new_config) => {
                        info!("Configuration reloaded successfully");
                        if tx.send(new_config).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to reload config (keeping old config): {}", e);
                    }
                }
            }
        });

        info!("Config file watcher started for: {}", path.display());

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial_config,
        ))
    }

    /// Wait for the next config update
    /// Returns None if the watcher has been closed
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverKind;
    use crate::driver::{Key, KeyEdge};
    use std::fs;
    use tempfile::TempDir;

    fn config_yaml(hold_ms: u64, macro_count: usize) -> String {
        let mut yaml = format!(
            "device:\n  driver: console\n\nkeyboard:\n  key_hold_duration_ms: {}\n  macros:\n",
            hold_ms
        );
        for i in 0..macro_count {
            yaml.push_str(&format!(
                "    - name: \"macro{}\"\n      keys: [g{}]\n      send_key: \"a\"\n",
                i,
                i + 1
            ));
        }
        yaml
    }

    async fn wait_for_hold_ms(watcher: &mut ConfigWatcher, expected: u64) -> Option<AppConfig> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let config =
                tokio::time::timeout_at(deadline, watcher.next_config()).await.ok()??;
            if config.keyboard.key_hold_duration_ms == expected {
                return Some(config);
            }
        }
    }

    #[tokio::test]
    async fn test_reload_on_modify() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("g15d.yaml");
        fs::write(&config_path, config_yaml(2000, 1))?;

        let (mut watcher, config) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        assert_eq!(config.device.driver, DriverKind::Console);
        assert_eq!(config.keyboard.key_hold_duration_ms, 2000);
        assert_eq!(config.keyboard.macros[0].keys, vec![Key::G1]);
        assert_eq!(config.keyboard.macros[0].activate_on, KeyEdge::Up);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, config_yaml(1500, 2))?;

        let reloaded = wait_for_hold_ms(&mut watcher, 1500).await.unwrap();
        assert_eq!(reloaded.keyboard.macros.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reload_on_rename_replace() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("g15d.yaml");
        fs::write(&config_path, config_yaml(2000, 0))?;

        let (mut watcher, config) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        assert_eq!(config.keyboard.key_hold_duration_ms, 2000);

        // Editor-style save: write a temp file, rename it over the config
        tokio::time::sleep(Duration::from_millis(100)).await;
        let staging = temp_dir.path().join("g15d.yaml.new");
        fs::write(&staging, config_yaml(750, 0))?;
        fs::rename(&staging, &config_path)?;

        let reloaded = wait_for_hold_ms(&mut watcher, 750).await.unwrap();
        assert!(reloaded.keyboard.macros.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_burst_converges_on_final_contents() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("g15d.yaml");
        fs::write(&config_path, config_yaml(2000, 0))?;

        let (mut watcher, _) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        for hold_ms in [500, 600, 700, 800] {
            fs::write(&config_path, config_yaml(hold_ms, 1))?;
        }

        let reloaded = wait_for_hold_ms(&mut watcher, 800).await.unwrap();
        assert_eq!(reloaded.keyboard.macros.len(), 1);
        Ok(())
    }
}
