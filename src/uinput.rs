//! Virtual input injection
//!
//! Macros bound to G-keys can type real key events into the kernel via a
//! uinput virtual keyboard. The [`VirtualInput`] trait is the seam: production
//! uses [`UinputSink`] (an evdev virtual device), tests use
//! [`RecordingInput`].

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Device name the virtual keyboard registers under.
const DEVICE_NAME: &str = "g15d virtual keyboard";

/// Sink for injected key events. `value` follows the evdev convention:
/// 1 = press, 0 = release, 2 = autorepeat.
pub trait VirtualInput: Send + Sync {
    fn emit(&self, code: u16, value: i32) -> Result<()>;

    fn press(&self, code: u16) -> Result<()> {
        self.emit(code, 1)
    }

    fn release(&self, code: u16) -> Result<()> {
        self.emit(code, 0)
    }

    /// Press and immediately release.
    fn click(&self, code: u16) -> Result<()> {
        self.press(code)?;
        self.release(code)
    }
}

/// Real uinput-backed virtual keyboard.
pub struct UinputSink {
    device: Mutex<VirtualDevice>,
}

impl UinputSink {
    /// Create the virtual device. Requires write access to /dev/uinput.
    pub fn new() -> Result<Self> {
        let mut keys: AttributeSet<evdev::Key> = AttributeSet::new();
        // Advertise the full keyboard range so any macro code is accepted
        for code in 1..=0x2e7u16 {
            keys.insert(evdev::Key(code));
        }
        let device = VirtualDeviceBuilder::new()
            .context("Failed to create uinput builder (is /dev/uinput writable?)")?
            .name(DEVICE_NAME)
            .with_keys(&keys)
            .context("Failed to register key capabilities")?
            .build()
            .context("Failed to build uinput device")?;
        info!("Created uinput virtual keyboard '{}'", DEVICE_NAME);
        Ok(Self {
            device: Mutex::new(device),
        })
    }
}

impl VirtualInput for UinputSink {
    fn emit(&self, code: u16, value: i32) -> Result<()> {
        debug!("uinput emit code={} value={}", code, value);
        let key = InputEvent::new(EventType::KEY, code, value);
        let syn = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        self.device
            .lock()
            .emit(&[key, syn])
            .context("uinput emit failed")?;
        Ok(())
    }
}

/// Sink used when uinput is disabled or /dev/uinput is unavailable. Events
/// are logged and dropped.
pub struct NullInput;

impl VirtualInput for NullInput {
    fn emit(&self, code: u16, value: i32) -> Result<()> {
        debug!("uinput disabled, dropping code={} value={}", code, value);
        Ok(())
    }
}

/// Test sink that records every emitted event.
#[derive(Default)]
pub struct RecordingInput {
    events: Mutex<Vec<(u16, i32)>>,
}

impl RecordingInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(u16, i32)> {
        self.events.lock().clone()
    }
}

impl VirtualInput for RecordingInput {
    fn emit(&self, code: u16, value: i32) -> Result<()> {
        self.events.lock().push((code, value));
        Ok(())
    }
}

/// Resolve a key name used in macro configurations to its evdev code.
pub fn code_for_name(name: &str) -> Option<u16> {
    use evdev::Key;
    let key = match name.to_ascii_lowercase().as_str() {
        "play" | "playpause" => Key::KEY_PLAYPAUSE,
        "stop" => Key::KEY_STOPCD,
        "prev" | "previoussong" => Key::KEY_PREVIOUSSONG,
        "next" | "nextsong" => Key::KEY_NEXTSONG,
        "mute" => Key::KEY_MUTE,
        "vol-up" | "volumeup" => Key::KEY_VOLUMEUP,
        "vol-down" | "volumedown" => Key::KEY_VOLUMEDOWN,
        "enter" => Key::KEY_ENTER,
        "space" => Key::KEY_SPACE,
        "tab" => Key::KEY_TAB,
        "esc" | "escape" => Key::KEY_ESC,
        "ctrl" | "leftctrl" => Key::KEY_LEFTCTRL,
        "alt" | "leftalt" => Key::KEY_LEFTALT,
        "shift" | "leftshift" => Key::KEY_LEFTSHIFT,
        "meta" | "super" => Key::KEY_LEFTMETA,
        single if single.len() == 1 => {
            let c = single.as_bytes()[0];
            match c {
                b'a'..=b'z' => letter_key(c)?,
                b'0'..=b'9' => digit_key(c)?,
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(key.0)
}

fn letter_key(c: u8) -> Option<evdev::Key> {
    use evdev::Key;
    Some(match c {
        b'a' => Key::KEY_A, b'b' => Key::KEY_B, b'c' => Key::KEY_C, b'd' => Key::KEY_D,
        b'e' => Key::KEY_E, b'f' => Key::KEY_F, b'g' => Key::KEY_G, b'h' => Key::KEY_H,
        b'i' => Key::KEY_I, b'j' => Key::KEY_J, b'k' => Key::KEY_K, b'l' => Key::KEY_L,
        b'm' => Key::KEY_M, b'n' => Key::KEY_N, b'o' => Key::KEY_O, b'p' => Key::KEY_P,
        b'q' => Key::KEY_Q, b'r' => Key::KEY_R, b's' => Key::KEY_S, b't' => Key::KEY_T,
        b'u' => Key::KEY_U, b'v' => Key::KEY_V, b'w' => Key::KEY_W, b'x' => Key::KEY_X,
        b'y' => Key::KEY_Y, b'z' => Key::KEY_Z,
        _ => return None,
    })
}

fn digit_key(c: u8) -> Option<evdev::Key> {
    use evdev::Key;
    Some(match c {
        b'0' => Key::KEY_0, b'1' => Key::KEY_1, b'2' => Key::KEY_2, b'3' => Key::KEY_3,
        b'4' => Key::KEY_4, b'5' => Key::KEY_5, b'6' => Key::KEY_6, b'7' => Key::KEY_7,
        b'8' => Key::KEY_8, b'9' => Key::KEY_9,
        _ => return None,
    })
}
