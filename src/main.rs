//! g15d - Logitech G-series keyboard daemon
//!
//! Drives the LCD, extra keys, and lighting controls of G15-family keyboards:
//! pages are scheduled onto the LCD by priority, G-keys run macros or actions,
//! and backlight/contrast controls are shared through an acquisition model.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod driver;
mod framebuffer;
mod keyboard;
mod paths;
mod plugin;
mod scheduler;
mod screen;
mod settings;
mod uinput;

use crate::config::{AppConfig, ConfigWatcher, DriverKind};
use crate::driver::controls::ControlBank;
use crate::driver::{ConsoleDriver, Driver, DriverEvent, G15DirectDriver, Key, KeyEdge};
use crate::keyboard::{Bindings, KeyHandler, KeyMacro, MacroKind, RawKeyHandler};
use crate::paths::AppPaths;
use crate::plugin::{DaemonContext, PluginRegistry};
use crate::screen::{Screen, ScreenChangeListener};
use crate::settings::Settings;
use crate::uinput::{NullInput, UinputSink, VirtualInput};

/// g15d - LCD, macro keys, and lighting for Logitech G-series keyboards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List the configured device's controls and key layout, then exit
    #[arg(long)]
    list_controls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    let app_paths = AppPaths::detect();
    app_paths.ensure_directories()?;
    let config_path = args
        .config
        .unwrap_or_else(|| app_paths.config.to_string_lossy().to_string());

    info!("Starting g15d...");
    info!("Configuration file: {}", config_path);

    if args.list_controls {
        let config = AppConfig::load(&config_path).await.unwrap_or_default();
        list_controls(&config);
        return Ok(());
    }

    // Load configuration with hot-reload watcher
    let (config_watcher, initial_config) = ConfigWatcher::new(config_path.clone()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let shutdown_signal = shutdown_signal();

    run_app(
        (*initial_config).clone(),
        config_watcher,
        &app_paths,
        shutdown_signal,
    )
    .await?;

    info!("g15d shutdown complete");
    Ok(())
}

/// Build the configured driver backend.
fn build_driver(config: &AppConfig) -> Arc<dyn Driver> {
    let device = &config.device;
    match device.driver {
        DriverKind::Console => Arc::new(ConsoleDriver::with_model(device.model)),
        DriverKind::G15Direct => match (device.vendor_id, device.product_id) {
            (Some(vid), Some(pid)) => {
                Arc::new(G15DirectDriver::with_usb_id(device.model, vid, pid))
            }
            (None, None) => Arc::new(G15DirectDriver::new(device.model)),
            _ => {
                warn!("Both vendor_id and product_id must be set to override; using defaults");
                Arc::new(G15DirectDriver::new(device.model))
            }
        },
    }
}

/// Resolve configured macros, dropping the invalid ones with a warning.
fn bindings_from(config: &AppConfig, driver: &Arc<dyn Driver>) -> Bindings {
    let macros = config
        .keyboard
        .macros
        .iter()
        .filter_map(|m| match m.to_macro() {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                warn!("Skipping macro: {:#}", e);
                None
            }
        })
        .collect();
    Bindings {
        macros,
        actions: driver.action_keys(),
    }
}

/// Routes navigation actions into the page scheduler.
struct ScreenActions {
    screen: Arc<Screen>,
}

impl keyboard::ActionListener for ScreenActions {
    fn action_performed(&self, binding: &driver::ActionBinding) -> bool {
        use driver::Action;
        let screen = self.screen.clone();
        match binding.action {
            Action::NextPage => {
                scheduler::spawn(async move { screen.cycle(1).await });
                true
            }
            Action::PreviousPage => {
                scheduler::spawn(async move { screen.cycle(-1).await });
                true
            }
            _ => false,
        }
    }
}

/// Switches the memory bank when an M-key goes down. The batch is not
/// swallowed so M-keys stay bindable.
struct MemoryBankKeys {
    screen: Arc<Screen>,
}

impl RawKeyHandler for MemoryBankKeys {
    fn handle_key(&self, keys: &[Key], edge: KeyEdge, post: bool) -> bool {
        if post || edge != KeyEdge::Down {
            return false;
        }
        let bank = keys.iter().find_map(|k| match k {
            Key::M1 => Some(1),
            Key::M2 => Some(2),
            Key::M3 => Some(3),
            _ => None,
        });
        if let Some(bank) = bank {
            let screen = self.screen.clone();
            scheduler::spawn(async move { screen.set_memory_bank(bank).await });
        }
        false
    }
}

/// Persists screen state so it can be restored on the next start.
struct PersistScreenState {
    settings: Arc<Settings>,
}

impl ScreenChangeListener for PersistScreenState {
    fn page_changed(&self, page_id: &str) {
        if let Err(e) = self.settings.set_last_page(page_id) {
            warn!("Failed to persist last page: {:#}", e);
        }
    }

    fn memory_bank_changed(&self, bank: u8) {
        if let Err(e) = self.settings.set_memory_bank(bank) {
            warn!("Failed to persist memory bank: {:#}", e);
        }
    }
}

async fn run_app(
    mut config: AppConfig,
    mut config_watcher: ConfigWatcher,
    app_paths: &AppPaths,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!("Starting main application loop...");

    let driver = build_driver(&config);
    info!(
        "Driver '{}' created for model {:?}",
        driver.name(),
        driver.model()
    );

    driver.connect().await?;

    let settings = Arc::new(Settings::open(&app_paths.sled_db_path())?);

    // Control bank seeded from the device, then persisted/configured values
    let (controls, mut control_updates) = ControlBank::new(driver.controls());
    for control in controls.controls() {
        let value = settings
            .control_value(&control.id)
            .or_else(|| config.controls.get(&control.id).copied());
        if let Some(value) = value {
            if let Err(e) = controls.set(&control.id, value) {
                warn!("Cannot restore control '{}': {}", control.id, e);
            }
        }
    }

    let screen = Screen::new(driver.clone(), controls.clone());
    screen.add_listener(Arc::new(PersistScreenState {
        settings: settings.clone(),
    }));
    screen.set_memory_bank(settings.memory_bank().unwrap_or(1)).await;

    // Virtual input sink for macros
    let input: Arc<dyn VirtualInput> = if config.keyboard.uinput {
        match UinputSink::new() {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!("uinput unavailable, macros will not type keys: {:#}", e);
                Arc::new(NullInput)
            }
        }
    } else {
        Arc::new(NullInput)
    };

    let redraw_screen = screen.clone();
    let (keys, mut macro_rx) = KeyHandler::new(input, config.key_hold_duration(), move || {
        redraw_screen.request_redraw()
    });
    keys.set_bindings(bindings_from(&config, &driver));
    keys.add_action_listener(Arc::new(ScreenActions {
        screen: screen.clone(),
    }));
    keys.add_raw_handler(Arc::new(MemoryBankKeys {
        screen: screen.clone(),
    }));

    let key_tx = keys.start();
    driver.grab_keys(key_tx.clone())?;

    let mut events = driver
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("Driver event receiver already taken"))?;

    // Plugins
    let registry = PluginRegistry::new();
    let ctx = DaemonContext {
        driver: driver.clone(),
        controls: controls.clone(),
        screen: screen.clone(),
        keys: keys.clone(),
        settings: settings.clone(),
    };
    registry.activate_all(&ctx).await;

    // Restore the page that was visible last time
    if config.screen.remember_last_page {
        if let Some(last) = settings.last_page() {
            if screen.page(&last).await.is_some() {
                screen.cycle_to(&last).await;
            }
        }
    }

    info!("✅ Ready: {} on {:?}", driver.name(), driver.model());

    let mut cycle_interval =
        tokio::time::interval(Duration::from_secs(config.screen.cycle_seconds));
    cycle_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    cycle_interval.reset();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Control changes flow from the bank to the hardware
            Some(control) = control_updates.recv() => {
                debug!("Control '{}' -> {:?}", control.id, control.value);
                if let Err(e) = driver.on_update_control(&control).await {
                    warn!("Failed to push control '{}': {}", control.id, e);
                }
                if let Err(e) = settings.set_control_value(&control.id, control.value) {
                    warn!("Failed to persist control '{}': {:#}", control.id, e);
                }
            }

            // Script macros fired by the key handler
            Some(m) = macro_rx.recv() => {
                run_script_macro(&m);
            }

            // Driver connectivity
            Some(event) = events.recv() => {
                match event {
                    DriverEvent::Connected => info!("🔌 Device connected"),
                    DriverEvent::Disconnected { expected: true } => {
                        info!("🔌 Device disconnected");
                    }
                    DriverEvent::Disconnected { expected: false } => {
                        warn!("🔌 Device lost, trying to reconnect...");
                        reconnect(&driver, &controls, &key_tx).await;
                        screen.request_redraw();
                    }
                }
            }

            // Handle config reload
            Some(new_config) = config_watcher.next_config() => {
                info!("📝 Configuration file changed, reloading...");
                keys.set_bindings(bindings_from(&new_config, &driver));
                if new_config.screen.cycle_seconds != config.screen.cycle_seconds {
                    cycle_interval = tokio::time::interval(
                        Duration::from_secs(new_config.screen.cycle_seconds));
                    cycle_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    cycle_interval.reset();
                }
                for (id, value) in &new_config.controls {
                    if let Err(e) = controls.set(id, *value) {
                        warn!("Cannot apply control '{}': {}", id, e);
                    }
                }
                config = new_config;
                info!("✅ Configuration reloaded");
            }

            _ = cycle_interval.tick() => {
                if config.screen.cycle_screens {
                    screen.auto_cycle_tick().await;
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    // Cleanup
    info!("Shutting down...");
    registry.shutdown(&ctx).await;
    controls.shutdown(false);
    // Push the final control values that shutdown released
    while let Ok(control) = control_updates.try_recv() {
        if let Err(e) = driver.on_update_control(&control).await {
            debug!("Final control push failed: {}", e);
        }
    }
    if driver.is_connected() {
        if let Err(e) = driver.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }
    settings.flush()?;
    info!("All resources released");

    Ok(())
}

/// Reconnect after an unexpected unplug, then restore key grabbing and
/// control state.
async fn reconnect(
    driver: &Arc<dyn Driver>,
    controls: &ControlBank,
    key_tx: &tokio::sync::mpsc::UnboundedSender<driver::KeyInput>,
) {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        match driver.connect().await {
            Ok(()) => break,
            Err(e) => debug!("Reconnect attempt failed: {}", e),
        }
    }
    info!("🔌 Device reconnected");
    if let Err(e) = driver.grab_keys(key_tx.clone()) {
        error!("Failed to re-grab keys: {}", e);
    }
    for control in controls.controls() {
        if let Err(e) = driver.on_update_control(&control).await {
            warn!("Failed to restore control '{}': {}", control.id, e);
        }
    }
}

/// Run a macro of kind `Script` as a shell command. Fire and forget.
fn run_script_macro(m: &KeyMacro) {
    let MacroKind::Script { command } = &m.kind else {
        return;
    };
    debug!("Running macro '{}': {}", m.name, command);
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .spawn()
    {
        Ok(mut child) => {
            let name = m.name.clone();
            scheduler::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!("Macro '{}' exited with {}", name, status);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Macro '{}' failed: {}", name, e),
                }
            });
        }
        Err(e) => warn!("Failed to spawn macro '{}': {}", m.name, e),
    }
}

/// Print the configured device's controls and key layout.
fn list_controls(config: &AppConfig) {
    use colored::*;

    let driver = build_driver(config);
    println!(
        "\n{}",
        format!("=== {} ({:?}) ===", driver.name(), driver.model())
            .bold()
            .cyan()
    );

    let (w, h) = driver.lcd_size();
    if driver.bpp() > 0 {
        println!("  LCD: {}x{} @ {}bpp", w, h, driver.bpp());
    } else {
        println!("  LCD: {}", "none".yellow());
    }

    println!("\n{}", "Controls:".bold());
    for control in driver.controls() {
        println!(
            "  {} = {:?} (range {:?}..{:?})",
            control.id.green(),
            control.value,
            control.lower,
            control.upper
        );
    }

    println!("\n{}", "Key layout:".bold());
    for row in driver.key_layout() {
        let ids: Vec<String> = row.iter().map(|k| k.id().to_string()).collect();
        println!("  {}", ids.join(" ").yellow());
    }
    println!();
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
