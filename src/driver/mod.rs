//! Device drivers for G-series keyboards
//!
//! The [`Driver`] trait is the hardware-facing contract the screen scheduler
//! and control model depend on: connect/disconnect, paint a framebuffer to the
//! LCD, report and update controls, and deliver raw key edges.
//!
//! Note: All methods take &self (not &mut self) to support Arc<dyn Driver>.
//! Drivers should use interior mutability (Mutex, atomics, etc.) for state.

use crate::framebuffer::Framebuffer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod console;
pub mod controls;
pub mod g15direct;

pub use console::ConsoleDriver;
pub use controls::ControlBank;
pub use g15direct::G15DirectDriver;

/// Errors at the driver boundary. Contract violations (double connect, use
/// while disconnected) are programming errors; I/O failures are converted to a
/// disconnect by the driver itself before they surface here.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver is already connected")]
    AlreadyConnected,
    #[error("driver is not connected")]
    NotConnected,
    #[error("device {vid:04x}:{pid:04x} not found")]
    DeviceNotFound { vid: u16, pid: u16 },
    #[error("the current device has no suitable output device")]
    NoOutput,
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Additional keys on G-series keyboards: macro (G) keys, memory bank (M)
/// keys, display (L/menu) keys, and the backlight key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Key {
    G1, G2, G3, G4, G5, G6, G7, G8, G9, G10, G11,
    G12, G13, G14, G15, G16, G17, G18, G19, G20, G21, G22,
    M1, M2, M3, Mr,
    L1, L2, L3, L4, L5,
    Back, Down, Left, Menu, Ok, Right, Settings, Up,
    Light,
    WinkeySwitch, Next, Prev, Stop, Play, Mute, VolUp, VolDown,
}

impl Key {
    /// Stable string id, matching the names used in settings and configs.
    pub fn id(&self) -> &'static str {
        match self {
            Key::G1 => "g1", Key::G2 => "g2", Key::G3 => "g3", Key::G4 => "g4",
            Key::G5 => "g5", Key::G6 => "g6", Key::G7 => "g7", Key::G8 => "g8",
            Key::G9 => "g9", Key::G10 => "g10", Key::G11 => "g11", Key::G12 => "g12",
            Key::G13 => "g13", Key::G14 => "g14", Key::G15 => "g15", Key::G16 => "g16",
            Key::G17 => "g17", Key::G18 => "g18", Key::G19 => "g19", Key::G20 => "g20",
            Key::G21 => "g21", Key::G22 => "g22",
            Key::M1 => "m1", Key::M2 => "m2", Key::M3 => "m3", Key::Mr => "mr",
            Key::L1 => "l1", Key::L2 => "l2", Key::L3 => "l3", Key::L4 => "l4", Key::L5 => "l5",
            Key::Back => "back", Key::Down => "down", Key::Left => "left",
            Key::Menu => "menu", Key::Ok => "ok", Key::Right => "right",
            Key::Settings => "settings", Key::Up => "up",
            Key::Light => "light",
            Key::WinkeySwitch => "win", Key::Next => "next", Key::Prev => "prev",
            Key::Stop => "stop", Key::Play => "play", Key::Mute => "mute",
            Key::VolUp => "vol-up", Key::VolDown => "vol-down",
        }
    }

    fn all() -> &'static [Key] {
        use Key::*;
        &[
            G1, G2, G3, G4, G5, G6, G7, G8, G9, G10, G11, G12, G13, G14, G15, G16,
            G17, G18, G19, G20, G21, G22, M1, M2, M3, Mr, L1, L2, L3, L4, L5, Back,
            Down, Left, Menu, Ok, Right, Settings, Up, Light, WinkeySwitch, Next,
            Prev, Stop, Play, Mute, VolUp, VolDown,
        ]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::all()
            .iter()
            .find(|k| k.id() == s)
            .copied()
            .ok_or_else(|| format!("unknown key '{}'", s))
    }
}

/// Key edge state. `Held` is never produced by hardware; the key state machine
/// synthesizes it when a key stays down past the hold duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEdge {
    Up,
    Down,
    Held,
}

/// A batch of keys that changed edge simultaneously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInput {
    pub keys: Vec<Key>,
    pub edge: KeyEdge,
}

/// Supported device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    G15v1,
    G15v2,
    G11,
    G13,
    G19,
    G510,
    G110,
    Z10,
}

impl Model {
    /// LCD size in pixels. The G11 and G110 have no LCD.
    pub fn lcd_size(&self) -> (usize, usize) {
        match self {
            Model::G19 => (320, 240),
            Model::G11 | Model::G110 => (0, 0),
            _ => (160, 43),
        }
    }

    pub fn bpp(&self) -> u8 {
        match self {
            Model::G19 => 16,
            Model::G11 | Model::G110 => 0,
            _ => 1,
        }
    }
}

/// Control hints, a bitmask describing what a control is for.
pub mod hints {
    pub const DIMMABLE: u32 = 1 << 0;
    pub const SHADEABLE: u32 = 1 << 1;
    pub const FOREGROUND: u32 = 1 << 2;
    pub const BACKGROUND: u32 = 1 << 3;
    pub const HIGHLIGHT: u32 = 1 << 4;
    pub const SWITCH: u32 = 1 << 5;
    pub const MKEYS: u32 = 1 << 6;
    pub const VIRTUAL: u32 = 1 << 7;
    pub const RED_BLUE_LED: u32 = 1 << 8;
}

/// Bitmask values for the M-key LED lights (value of the MKEYS control).
pub mod mkey_lights {
    pub const M1: i32 = 1 << 0;
    pub const M2: i32 = 1 << 1;
    pub const M3: i32 = 1 << 2;
    pub const MR: i32 = 1 << 3;

    /// Mask for a memory bank number (1, 2 or 3).
    pub fn mask_for_bank(bank: u8) -> i32 {
        match bank {
            1 => M1,
            2 => M2,
            3 => M3,
            _ => 0,
        }
    }

    /// Memory bank activated by a light mask, 0 if none.
    pub fn bank_for_mask(mask: i32) -> u8 {
        if mask & M3 != 0 {
            3
        } else if mask & M2 != 0 {
            2
        } else if mask & M1 != 0 {
            1
        } else {
            0
        }
    }
}

/// The value of a control. Single LEDs and brightness levels are scalars,
/// colour controls are RGB triples, toggles are switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Scalar(i32),
    Rgb([u8; 3]),
    Switch(bool),
}

impl ControlValue {
    /// The fully-off value of the same variant.
    pub fn zeroize(&self) -> ControlValue {
        match self {
            ControlValue::Scalar(_) => ControlValue::Scalar(0),
            ControlValue::Rgb(_) => ControlValue::Rgb([0, 0, 0]),
            ControlValue::Switch(_) => ControlValue::Switch(false),
        }
    }

    pub fn as_scalar(&self) -> Option<i32> {
        match self {
            ControlValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_rgb(&self) -> Option<[u8; 3]> {
        match self {
            ControlValue::Rgb(v) => Some(*v),
            _ => None,
        }
    }
}

/// A single adjustable feature of the device: an LED, a brightness level, the
/// backlight colour. Owned by the driver, mutated through `update_control`.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub id: String,
    pub name: String,
    pub value: ControlValue,
    pub default_value: ControlValue,
    pub lower: i32,
    pub upper: i32,
    pub hint: u32,
}

impl Control {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        value: ControlValue,
        lower: i32,
        upper: i32,
        hint: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            default_value: value,
            lower,
            upper,
            hint,
        }
    }

    /// Clamp a scalar value into the control's bounds. Other variants pass
    /// through unchanged.
    pub fn clamp(&self, value: ControlValue) -> ControlValue {
        match value {
            ControlValue::Scalar(v) => ControlValue::Scalar(v.clamp(self.lower, self.upper)),
            other => other,
        }
    }
}

/// Actions a device's extra keys can be bound to by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NextPage,
    PreviousPage,
    NextSelection,
    PreviousSelection,
    Select,
    View,
    Clear,
    Menu,
    Cancel,
}

/// Default binding of a key combination (at a given edge) to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionBinding {
    pub action: Action,
    pub keys: Vec<Key>,
    pub edge: KeyEdge,
}

impl ActionBinding {
    pub fn new(action: Action, keys: Vec<Key>, edge: KeyEdge) -> Self {
        Self { action, keys, edge }
    }
}

/// Out-of-band driver notifications. Unplug and I/O failure surface through
/// the same `Disconnected` event as an explicit disconnect, so reconnection
/// logic up-stack behaves uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Connected,
    Disconnected { expected: bool },
}

/// Driver trait - all hardware backends implement this.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name of the backend (e.g. "g15direct", "console").
    fn name(&self) -> &str;

    /// The model this driver is (or will be) connected to.
    fn model(&self) -> Model;

    /// LCD size in pixels; (0, 0) if the device has no LCD.
    fn lcd_size(&self) -> (usize, usize) {
        self.model().lcd_size()
    }

    /// Bits per pixel of the LCD. 1 is monochrome, 0 means no LCD.
    fn bpp(&self) -> u8 {
        self.model().bpp()
    }

    /// Snapshot of all controls this device exposes, with current values.
    fn controls(&self) -> Vec<Control>;

    /// Rows of extra keys, in the physical layout of the device.
    fn key_layout(&self) -> Vec<Vec<Key>>;

    /// Default action bindings for the device's navigation keys.
    fn action_keys(&self) -> Vec<ActionBinding>;

    /// Connect to the hardware. Errors with `AlreadyConnected` on a double
    /// connect.
    async fn connect(&self) -> Result<(), DriverError>;

    /// Disconnect from the hardware. Errors with `NotConnected` when called
    /// while disconnected.
    async fn disconnect(&self) -> Result<(), DriverError>;

    fn is_connected(&self) -> bool;

    /// Render a framebuffer to the LCD, converting format as needed.
    async fn paint(&self, frame: &Framebuffer) -> Result<(), DriverError>;

    /// Push a control's new value to the hardware.
    async fn on_update_control(&self, control: &Control) -> Result<(), DriverError>;

    /// Start delivering raw key edges into the provided channel. The driver
    /// owns whatever read thread this requires.
    fn grab_keys(&self, tx: mpsc::UnboundedSender<KeyInput>) -> Result<(), DriverError>;

    /// Take the driver event receiver (should only be called once, by the
    /// main loop).
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>>;
}

/// Find a control by id in a snapshot.
pub fn control_by_id<'a>(controls: &'a [Control], id: &str) -> Option<&'a Control> {
    controls.iter().find(|c| c.id == id)
}

/// Find the first control whose hint bitmask covers `hint`.
pub fn control_for_hint(controls: &[Control], hint: u32) -> Option<&Control> {
    controls.iter().find(|c| c.hint & hint == hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        for key in Key::all() {
            assert_eq!(key.id().parse::<Key>().unwrap(), *key);
        }
        assert!("g99".parse::<Key>().is_err());
    }

    #[test]
    fn test_control_clamps_scalars_only() {
        let c = Control::new("bl", "Backlight", ControlValue::Scalar(1), 0, 2, hints::DIMMABLE);
        assert_eq!(c.clamp(ControlValue::Scalar(9)), ControlValue::Scalar(2));
        assert_eq!(c.clamp(ControlValue::Scalar(-3)), ControlValue::Scalar(0));
        assert_eq!(
            c.clamp(ControlValue::Rgb([255, 0, 0])),
            ControlValue::Rgb([255, 0, 0])
        );
    }

    #[test]
    fn test_memory_bank_masks() {
        assert_eq!(mkey_lights::mask_for_bank(2), mkey_lights::M2);
        assert_eq!(mkey_lights::bank_for_mask(mkey_lights::M3 | mkey_lights::M1), 3);
        assert_eq!(mkey_lights::bank_for_mask(0), 0);
    }

    #[test]
    fn test_zeroize_preserves_variant() {
        assert_eq!(ControlValue::Scalar(7).zeroize(), ControlValue::Scalar(0));
        assert_eq!(
            ControlValue::Rgb([1, 2, 3]).zeroize(),
            ControlValue::Rgb([0, 0, 0])
        );
        assert_eq!(ControlValue::Switch(true).zeroize(), ControlValue::Switch(false));
    }

    #[test]
    fn test_control_for_hint_matches_full_mask() {
        let controls = vec![
            Control::new("a", "A", ControlValue::Scalar(0), 0, 2, hints::DIMMABLE),
            Control::new(
                "b",
                "B",
                ControlValue::Rgb([0, 0, 0]),
                0,
                255,
                hints::DIMMABLE | hints::SHADEABLE,
            ),
        ];
        assert_eq!(
            control_for_hint(&controls, hints::DIMMABLE | hints::SHADEABLE)
                .map(|c| c.id.as_str()),
            Some("b")
        );
    }
}
