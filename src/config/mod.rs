//! Configuration management for g15d
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;

use crate::driver::{ControlValue, Key, KeyEdge, Model};
use crate::keyboard::{KeyMacro, MacroKind, RepeatMode};

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub keyboard: KeyboardConfig,
    /// Startup values for named controls (e.g. `backlight_colour: !rgb [0, 255, 0]`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub controls: HashMap<String, ControlValue>,
}

/// Which driver to run and which hardware to look for
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default = "default_model")]
    pub model: Model,
    /// Override the USB vendor id (defaults to Logitech's).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    /// Override the USB product id derived from the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            model: default_model(),
            vendor_id: None,
            product_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    G15Direct,
    Console,
}

/// Screen / page scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScreenConfig {
    /// Automatically cycle through normal-priority pages.
    #[serde(default = "default_true")]
    pub cycle_screens: bool,
    #[serde(default = "default_cycle_seconds")]
    pub cycle_seconds: u64,
    /// Restore the last visible page on startup.
    #[serde(default = "default_true")]
    pub remember_last_page: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            cycle_screens: true,
            cycle_seconds: default_cycle_seconds(),
            remember_last_page: true,
        }
    }
}

/// Key handling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyboardConfig {
    /// How long a key must stay down before it counts as held, in ms.
    #[serde(default = "default_hold_ms")]
    pub key_hold_duration_ms: u64,
    /// Forward macro keypresses to a virtual input device.
    #[serde(default = "default_true")]
    pub uinput: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macros: Vec<MacroConfig>,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            key_hold_duration_ms: default_hold_ms(),
            uinput: true,
            macros: Vec::new(),
        }
    }
}

/// A single configured macro binding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MacroConfig {
    pub name: String,
    pub keys: Vec<Key>,
    #[serde(default = "default_edge")]
    pub activate_on: KeyEdge,
    /// Key name sent to the virtual input device (e.g. "a", "playpause").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_key: Option<String>,
    /// Shell command to run instead of sending a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_delay_ms: Option<u64>,
}

impl MacroConfig {
    /// Resolve into a runtime macro. Macros that name an unknown key to send,
    /// or that send nothing at all, are rejected.
    pub fn to_macro(&self) -> Result<KeyMacro> {
        let kind = if let Some(name) = &self.send_key {
            let code = crate::uinput::code_for_name(name)
                .with_context(|| format!("Macro '{}': unknown key name '{}'", self.name, name))?;
            MacroKind::Uinput { code }
        } else if let Some(command) = &self.run {
            MacroKind::Script {
                command: command.clone(),
            }
        } else {
            anyhow::bail!("Macro '{}' has neither 'send_key' nor 'run'", self.name);
        };
        Ok(KeyMacro {
            name: self.name.clone(),
            keys: self.keys.clone(),
            activate_on: self.activate_on,
            kind,
            repeat_mode: self.repeat_mode,
            repeat_delay: self.repeat_delay_ms.map(std::time::Duration::from_millis),
        })
    }
}

fn default_model() -> Model {
    Model::G15v2
}

fn default_true() -> bool {
    true
}

fn default_cycle_seconds() -> u64 {
    10
}

fn default_hold_ms() -> u64 {
    2000
}

fn default_edge() -> KeyEdge {
    KeyEdge::Up
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration semantics
    pub fn validate(&self) -> Result<()> {
        if self.screen.cycle_seconds == 0 {
            anyhow::bail!("screen.cycle_seconds must be at least 1");
        }
        for m in &self.keyboard.macros {
            if m.keys.is_empty() {
                anyhow::bail!("Macro '{}' binds no keys", m.name);
            }
            m.to_macro()?;
        }
        Ok(())
    }

    pub fn key_hold_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.keyboard.key_hold_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.device.driver, DriverKind::G15Direct);
        assert_eq!(config.device.model, Model::G15v2);
        assert!(config.screen.cycle_screens);
        assert_eq!(config.screen.cycle_seconds, 10);
        assert_eq!(config.keyboard.key_hold_duration_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
device:
  driver: console
  model: g19

screen:
  cycle_screens: false
  cycle_seconds: 5

keyboard:
  key_hold_duration_ms: 1500
  macros:
    - name: "play"
      keys: [g1]
      send_key: "playpause"
    - name: "lock"
      keys: [g2, g3]
      activate_on: held
      run: "loginctl lock-session"

controls:
  lcd_brightness: 1
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.device.driver, DriverKind::Console);
        assert_eq!(config.device.model, Model::G19);
        assert!(!config.screen.cycle_screens);
        assert_eq!(config.keyboard.macros.len(), 2);
        assert_eq!(config.keyboard.macros[1].keys, vec![Key::G2, Key::G3]);
        assert_eq!(config.keyboard.macros[1].activate_on, KeyEdge::Held);
        assert_eq!(
            config.controls.get("lcd_brightness"),
            Some(&ControlValue::Scalar(1))
        );
    }

    #[test]
    fn test_macro_without_payload_rejected() {
        let yaml = r#"
keyboard:
  macros:
    - name: "broken"
      keys: [g1]
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cycle_interval_rejected() {
        let yaml = r#"
screen:
  cycle_seconds: 0
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
