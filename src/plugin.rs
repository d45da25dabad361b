//! Plugin lifecycle and registry
//!
//! Plugins render pages, listen for keys, and otherwise extend the daemon.
//! Discovery is not handled here; callers instantiate plugins and hand them
//! to the registry, which drives activate/deactivate/destroy in order.

use crate::driver::{Driver, Key, KeyEdge};
use crate::driver::controls::ControlBank;
use crate::keyboard::{KeyHandler, RawKeyHandler};
use crate::screen::Screen;
use crate::settings::Settings;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// Everything a plugin may need, passed explicitly at activation.
#[derive(Clone)]
pub struct DaemonContext {
    pub driver: Arc<dyn Driver>,
    pub controls: ControlBank,
    pub screen: Arc<Screen>,
    pub keys: Arc<KeyHandler>,
    pub settings: Arc<Settings>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the plugin to life: add pages, acquire controls, subscribe.
    async fn activate(&self, ctx: &DaemonContext) -> Result<()>;

    /// Undo everything `activate` did. The plugin may be activated again.
    async fn deactivate(&self, ctx: &DaemonContext);

    /// Final teardown; the plugin is never used afterwards.
    async fn destroy(&self) {}
}

/// Optional key interest. Plugins implementing this get first refusal on raw
/// key batches, ahead of macros and action bindings.
pub trait KeyAware: Send + Sync {
    /// Return true to swallow the batch.
    fn handle_key(&self, keys: &[Key], edge: KeyEdge) -> bool;
}

/// Bridges `KeyAware` into the key handler's raw-handler list. Only the
/// pre-pass is offered to plugins; the post-pass stays internal.
struct KeyAwareAdapter(Arc<dyn KeyAware>);

impl RawKeyHandler for KeyAwareAdapter {
    fn handle_key(&self, keys: &[Key], edge: KeyEdge, post: bool) -> bool {
        if post {
            return false;
        }
        self.0.handle_key(keys, edge)
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    active: bool,
}

/// Holds instantiated plugins and walks their lifecycle.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        info!("🔌 Registered plugin '{}'", plugin.name());
        self.entries.lock().push(Entry {
            plugin,
            active: false,
        });
    }

    /// Register a plugin that also wants raw key batches.
    pub fn register_key_aware(
        &self,
        plugin: Arc<dyn Plugin>,
        key_aware: Arc<dyn KeyAware>,
        keys: &KeyHandler,
    ) {
        keys.add_raw_handler(Arc::new(KeyAwareAdapter(key_aware)));
        self.register(plugin);
    }

    /// Activate every registered plugin. A failing plugin is logged and left
    /// inactive; the rest still come up.
    pub async fn activate_all(&self, ctx: &DaemonContext) {
        let plugins: Vec<Arc<dyn Plugin>> = self
            .entries
            .lock()
            .iter()
            .filter(|e| !e.active)
            .map(|e| e.plugin.clone())
            .collect();
        for plugin in plugins {
            match plugin.activate(ctx).await {
                Ok(()) => {
                    info!("🔌 Plugin '{}' activated", plugin.name());
                    self.mark_active(plugin.name(), true);
                }
                Err(e) => error!("Plugin '{}' failed to activate: {:#}", plugin.name(), e),
            }
        }
    }

    /// Deactivate active plugins in reverse registration order.
    pub async fn deactivate_all(&self, ctx: &DaemonContext) {
        let plugins: Vec<Arc<dyn Plugin>> = self
            .entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.active)
            .map(|e| e.plugin.clone())
            .collect();
        for plugin in plugins {
            plugin.deactivate(ctx).await;
            info!("🔌 Plugin '{}' deactivated", plugin.name());
            self.mark_active(plugin.name(), false);
        }
    }

    /// Deactivate and destroy everything. The registry is empty afterwards.
    pub async fn shutdown(&self, ctx: &DaemonContext) {
        self.deactivate_all(ctx).await;
        let plugins: Vec<Arc<dyn Plugin>> = {
            let mut entries = self.entries.lock();
            entries.drain(..).map(|e| e.plugin).collect()
        };
        for plugin in plugins.into_iter().rev() {
            plugin.destroy().await;
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.active && e.plugin.name() == name)
    }

    fn mark_active(&self, name: &str, active: bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.plugin.name() == name) {
            entry.active = active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ConsoleDriver;
    use crate::screen::Page;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ClockPlugin {
        activations: AtomicUsize,
        destroyed: AtomicUsize,
        fail: bool,
    }

    impl ClockPlugin {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                activations: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Plugin for ClockPlugin {
        fn name(&self) -> &str {
            if self.fail {
                "broken"
            } else {
                "clock"
            }
        }

        async fn activate(&self, ctx: &DaemonContext) -> Result<()> {
            if self.fail {
                anyhow::bail!("no clock source");
            }
            self.activations.fetch_add(1, Ordering::SeqCst);
            ctx.screen.add_page(Page::new("clock", "Clock")).await?;
            Ok(())
        }

        async fn deactivate(&self, ctx: &DaemonContext) {
            ctx.screen.del_page("clock").await;
        }

        async fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn context(dir: &TempDir) -> DaemonContext {
        let driver = Arc::new(ConsoleDriver::new());
        driver.connect().await.unwrap();
        let driver: Arc<dyn Driver> = driver;
        let (controls, _updates) = ControlBank::new(driver.controls());
        let screen = Screen::new(driver.clone(), controls.clone());
        let (keys, _macro_rx) = KeyHandler::new(
            Arc::new(crate::uinput::RecordingInput::new()),
            crate::keyboard::DEFAULT_HOLD_DURATION,
            || {},
        );
        let settings = Arc::new(Settings::open(&dir.path().join("settings")).unwrap());
        DaemonContext {
            driver,
            controls,
            screen,
            keys,
            settings,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_round_trip() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let registry = PluginRegistry::new();
        let plugin = ClockPlugin::new(false);
        registry.register(plugin.clone());

        registry.activate_all(&ctx).await;
        assert!(registry.is_active("clock"));
        assert!(ctx.screen.page("clock").await.is_some());

        registry.deactivate_all(&ctx).await;
        assert!(!registry.is_active("clock"));
        assert!(ctx.screen.page("clock").await.is_none());

        registry.shutdown(&ctx).await;
        assert_eq!(plugin.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_activation_leaves_others_running() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let registry = PluginRegistry::new();
        registry.register(ClockPlugin::new(true));
        registry.register(ClockPlugin::new(false));

        registry.activate_all(&ctx).await;
        assert!(!registry.is_active("broken"));
        assert!(registry.is_active("clock"));
    }

    #[tokio::test]
    async fn test_activate_all_skips_already_active() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let registry = PluginRegistry::new();
        let plugin = ClockPlugin::new(false);
        registry.register(plugin.clone());

        registry.activate_all(&ctx).await;
        registry.activate_all(&ctx).await;
        assert_eq!(plugin.activations.load(Ordering::SeqCst), 1);
    }
}
