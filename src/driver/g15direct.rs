//! Direct USB driver for G15-family keyboards
//!
//! Talks to the keyboard over USB without any intermediate daemon: interrupt
//! writes carry the packed 1-bit LCD pixmap, HID SET_REPORT control transfers
//! carry LED and backlight changes, and a blocking read thread polls the key
//! interrupt endpoint and diffs the reported bitmask into key edges.
//!
//! Any I/O failure is treated as an unplug: the driver disconnects itself and
//! emits `DriverEvent::Disconnected { expected: false }` so the main loop can
//! start waiting for the device to come back.

use crate::driver::{
    hints, Action, ActionBinding, Control, ControlValue, Driver, DriverError, DriverEvent, Key,
    KeyEdge, KeyInput, Model,
};
use crate::framebuffer::Framebuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusb::{DeviceHandle, GlobalContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Logitech's USB vendor id.
pub const VENDOR_LOGITECH: u16 = 0x046d;

/// Known product ids per model.
pub fn product_id(model: Model) -> u16 {
    match model {
        Model::G15v1 => 0xc222,
        Model::G15v2 => 0xc227,
        Model::G11 => 0xc225,
        Model::G13 => 0xc21c,
        Model::G19 => 0xc229,
        Model::G510 => 0xc22d,
        Model::G110 => 0xc22b,
        Model::Z10 => 0x0a07,
    }
}

const INTERFACE: u8 = 0;
const LCD_ENDPOINT: u8 = 0x02;
const KEY_ENDPOINT: u8 = 0x81;
const KEY_REPORT_LEN: usize = 9;

// HID class SET_REPORT
const REQ_TYPE_SET_REPORT: u8 = 0x21;
const REQ_SET_REPORT: u8 = 0x09;
const REPORT_FEATURE_CONTROLS: u16 = 0x0302;

/// LCD frame: 32-byte header (first byte 0x03) followed by the packed pixmap.
const LCD_HEADER_LEN: usize = 32;
const LCD_FRAME_TYPE: u8 = 0x03;

/// Luminance threshold for the monochrome conversion.
const MONO_THRESHOLD: u8 = 128;

/// Bit positions in the key report bitmask. The low word carries the common
/// keys; bits 32 and up carry the extended keys of 22-G-key models.
const KEY_BITS: &[(u64, Key)] = &[
    (1 << 0, Key::G1),
    (1 << 1, Key::G2),
    (1 << 2, Key::G3),
    (1 << 3, Key::G4),
    (1 << 4, Key::G5),
    (1 << 5, Key::G6),
    (1 << 6, Key::G7),
    (1 << 7, Key::G8),
    (1 << 8, Key::G9),
    (1 << 9, Key::G10),
    (1 << 10, Key::G11),
    (1 << 11, Key::G12),
    (1 << 12, Key::G13),
    (1 << 13, Key::G14),
    (1 << 14, Key::G15),
    (1 << 15, Key::G16),
    (1 << 16, Key::G17),
    (1 << 17, Key::G18),
    (1 << 18, Key::M1),
    (1 << 19, Key::M2),
    (1 << 20, Key::M3),
    (1 << 21, Key::Mr),
    (1 << 22, Key::L1),
    (1 << 23, Key::L2),
    (1 << 24, Key::L3),
    (1 << 25, Key::L4),
    (1 << 26, Key::L5),
    (1 << 27, Key::Light),
    (1 << 32, Key::G19),
    (1 << 33, Key::G20),
    (1 << 34, Key::G21),
    (1 << 35, Key::G22),
];

/// Decode a raw interrupt report into the pressed-key bitmask. Byte 0 is the
/// report id; bytes 1-4 are the common mask, bytes 5-8 the extended mask.
fn decode_report(buf: &[u8]) -> u64 {
    if buf.len() < KEY_REPORT_LEN {
        return 0;
    }
    let code = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64;
    let ext = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as u64;
    code | (ext << 32)
}

fn keys_for_mask(mask: u64) -> Vec<Key> {
    KEY_BITS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, key)| *key)
        .collect()
}

fn default_controls(model: Model) -> Vec<Control> {
    let mkeys = Control::new(
        "mkeys",
        "Memory Bank Keys",
        ControlValue::Scalar(1),
        0,
        15,
        hints::MKEYS,
    );
    let backlight = Control::new(
        "keyboard_backlight",
        "Keyboard Backlight Level",
        ControlValue::Scalar(2),
        0,
        2,
        hints::DIMMABLE | hints::SHADEABLE,
    );
    let colour = Control::new(
        "backlight_colour",
        "Keyboard Backlight Colour",
        ControlValue::Rgb([0, 255, 0]),
        0,
        255,
        hints::DIMMABLE | hints::SHADEABLE,
    );
    let red_blue = Control::new(
        "backlight_colour",
        "Keyboard Backlight Colour",
        ControlValue::Rgb([255, 0, 0]),
        0,
        255,
        hints::DIMMABLE | hints::SHADEABLE | hints::RED_BLUE_LED,
    );
    let lcd_backlight = Control::new(
        "lcd_backlight",
        "LCD Backlight Level",
        ControlValue::Scalar(2),
        0,
        2,
        hints::SHADEABLE,
    );
    let contrast = Control::new("lcd_contrast", "LCD Contrast", ControlValue::Scalar(22), 0, 48, 0);
    let invert = Control::new(
        "invert_lcd",
        "Invert LCD",
        ControlValue::Switch(false),
        0,
        1,
        hints::SWITCH,
    );

    match model {
        Model::G11 => vec![mkeys, backlight],
        Model::G15v1 => vec![mkeys, backlight, contrast, lcd_backlight, invert],
        Model::G15v2 => vec![mkeys, backlight, lcd_backlight, invert],
        Model::G13 | Model::G510 => vec![mkeys, colour, invert],
        Model::Z10 => vec![backlight, lcd_backlight, invert],
        Model::G110 => vec![mkeys, red_blue],
        Model::G19 => vec![mkeys, colour, lcd_backlight],
    }
}

/// Connection state shared with the key reader thread. The thread cannot
/// reach the driver itself, so the teardown path for an I/O fault lives here
/// and both sides go through it.
struct UsbLink {
    connected: AtomicBool,
    stop_reader: AtomicBool,
    handle: Mutex<Option<Arc<DeviceHandle<GlobalContext>>>>,
    event_tx: mpsc::UnboundedSender<DriverEvent>,
}

impl UsbLink {
    /// Tear down after an I/O failure and tell the main loop the device is
    /// gone. Idempotent: the loser of the swap does nothing.
    fn fault(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_reader.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.release_interface(INTERFACE);
        }
        let _ = self.event_tx.send(DriverEvent::Disconnected { expected: false });
    }
}

/// USB driver for G15-family devices.
pub struct G15DirectDriver {
    model: Model,
    vid: u16,
    pid: u16,
    io_timeout: Duration,
    link: Arc<UsbLink>,
    invert_lcd: AtomicBool,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

impl G15DirectDriver {
    pub fn new(model: Model) -> Self {
        Self::with_usb_id(model, VENDOR_LOGITECH, product_id(model))
    }

    pub fn with_usb_id(model: Model, vid: u16, pid: u16) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            model,
            vid,
            pid,
            io_timeout: Duration::from_millis(100),
            link: Arc::new(UsbLink {
                connected: AtomicBool::new(false),
                stop_reader: AtomicBool::new(false),
                handle: Mutex::new(None),
                event_tx,
            }),
            invert_lcd: AtomicBool::new(false),
            reader: Mutex::new(None),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    fn open_device(&self) -> Result<DeviceHandle<GlobalContext>, DriverError> {
        for device in rusb::devices()?.iter() {
            let descriptor = device.device_descriptor()?;
            if descriptor.vendor_id() != self.vid || descriptor.product_id() != self.pid {
                continue;
            }
            let handle = device.open()?;
            // Let libusb pull the kernel HID driver off the control interface
            handle.set_auto_detach_kernel_driver(true)?;
            handle.claim_interface(INTERFACE)?;
            return Ok(handle);
        }
        Err(DriverError::DeviceNotFound {
            vid: self.vid,
            pid: self.pid,
        })
    }

    fn current_handle(&self) -> Result<Arc<DeviceHandle<GlobalContext>>, DriverError> {
        self.link
            .handle
            .lock()
            .as_ref()
            .cloned()
            .ok_or(DriverError::NotConnected)
    }

    /// HID SET_REPORT carrying a short feature payload.
    fn send_feature(
        &self,
        handle: &DeviceHandle<GlobalContext>,
        payload: &[u8],
    ) -> Result<(), rusb::Error> {
        handle.write_control(
            REQ_TYPE_SET_REPORT,
            REQ_SET_REPORT,
            REPORT_FEATURE_CONTROLS,
            INTERFACE as u16,
            payload,
            self.io_timeout,
        )?;
        Ok(())
    }

}

#[async_trait]
impl Driver for G15DirectDriver {
    fn name(&self) -> &str {
        "g15direct"
    }

    fn model(&self) -> Model {
        self.model
    }

    fn controls(&self) -> Vec<Control> {
        default_controls(self.model)
    }

    fn key_layout(&self) -> Vec<Vec<Key>> {
        match self.model {
            Model::G13 => vec![
                vec![Key::G1, Key::G2, Key::G3, Key::G4, Key::G5, Key::G6, Key::G7],
                vec![Key::G8, Key::G9, Key::G10, Key::G11, Key::G12, Key::G13, Key::G14],
                vec![Key::G15, Key::G16, Key::G17, Key::G18, Key::G19],
                vec![Key::G20, Key::G21, Key::G22],
                vec![Key::M1, Key::M2, Key::M3, Key::Mr],
                vec![Key::L1, Key::L2, Key::L3, Key::L4, Key::L5],
            ],
            Model::G11 => vec![
                vec![Key::G1, Key::G2, Key::G3],
                vec![Key::G4, Key::G5, Key::G6],
                vec![Key::G7, Key::G8, Key::G9],
                vec![Key::G10, Key::G11, Key::G12],
                vec![Key::G13, Key::G14, Key::G15],
                vec![Key::G16, Key::G17, Key::G18],
                vec![Key::M1, Key::M2, Key::M3, Key::Mr],
            ],
            _ => vec![
                vec![Key::G1, Key::G2, Key::G3],
                vec![Key::G4, Key::G5, Key::G6],
                vec![Key::M1, Key::M2, Key::M3, Key::Mr],
                vec![Key::L1, Key::L2, Key::L3, Key::L4, Key::L5],
                vec![Key::Light],
            ],
        }
    }

    fn action_keys(&self) -> Vec<ActionBinding> {
        vec![
            ActionBinding::new(Action::NextSelection, vec![Key::L4], KeyEdge::Up),
            ActionBinding::new(Action::PreviousSelection, vec![Key::L3], KeyEdge::Up),
            ActionBinding::new(Action::NextPage, vec![Key::L4], KeyEdge::Held),
            ActionBinding::new(Action::PreviousPage, vec![Key::L3], KeyEdge::Held),
            ActionBinding::new(Action::Select, vec![Key::L5], KeyEdge::Up),
            ActionBinding::new(Action::View, vec![Key::L2], KeyEdge::Up),
            ActionBinding::new(Action::Clear, vec![Key::L5], KeyEdge::Held),
            ActionBinding::new(Action::Menu, vec![Key::L1], KeyEdge::Up),
            ActionBinding::new(Action::Cancel, vec![Key::L2], KeyEdge::Held),
        ]
    }

    async fn connect(&self) -> Result<(), DriverError> {
        if self.is_connected() {
            return Err(DriverError::AlreadyConnected);
        }
        info!(
            "Looking for device {:04x}:{:04x} ({:?})",
            self.vid, self.pid, self.model
        );
        let handle = self.open_device()?;
        *self.link.handle.lock() = Some(Arc::new(handle));
        self.link.stop_reader.store(false, Ordering::SeqCst);
        self.link.connected.store(true, Ordering::SeqCst);
        info!("Connected to {:?} over USB", self.model);

        // Push the defaults so the hardware starts in a known state
        for control in self.controls() {
            if let Err(e) = self.on_update_control(&control).await {
                warn!("Failed to initialise control '{}': {}", control.id, e);
            }
        }
        let _ = self.link.event_tx.send(DriverEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        if !self.link.connected.swap(false, Ordering::SeqCst) {
            return Err(DriverError::NotConnected);
        }
        self.link.stop_reader.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
        if let Some(handle) = self.link.handle.lock().take() {
            let _ = handle.release_interface(INTERFACE);
        }
        info!("Disconnected from {:?}", self.model);
        let _ = self.link.event_tx.send(DriverEvent::Disconnected { expected: true });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    async fn paint(&self, frame: &Framebuffer) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        // Devices without an LCD silently accept paints
        if self.bpp() == 0 {
            return Ok(());
        }
        let handle = self.current_handle()?;

        // The LCD is dark-on-light, so the image is inverted unless the user
        // asked for inverted output
        let invert = !self.invert_lcd.load(Ordering::SeqCst);
        let packed = frame.to_monochrome(MONO_THRESHOLD, invert);

        let mut buf = vec![0u8; LCD_HEADER_LEN + packed.len()];
        buf[0] = LCD_FRAME_TYPE;
        buf[LCD_HEADER_LEN..].copy_from_slice(&packed);

        debug!("Writing LCD buffer of {} bytes", buf.len());
        let timeout = self.io_timeout;
        let result = tokio::task::spawn_blocking(move || {
            handle.write_interrupt(LCD_ENDPOINT, &buf, timeout)
        })
        .await
        .map_err(|_| DriverError::NotConnected)?;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to send LCD buffer: {}", e);
                self.link.fault();
                Err(DriverError::Usb(e))
            }
        }
    }

    async fn on_update_control(&self, control: &Control) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let handle = self.current_handle()?;

        let result = match (control.id.as_str(), control.value) {
            ("mkeys", ControlValue::Scalar(mask)) => {
                self.send_feature(&handle, &[0x02, 0x04, mask as u8, 0x00])
            }
            ("keyboard_backlight", ControlValue::Scalar(level)) => {
                self.send_feature(&handle, &[0x02, 0x01, level as u8, 0x00])
            }
            ("lcd_backlight", ControlValue::Scalar(level)) => {
                self.send_feature(&handle, &[0x02, 0x02, level as u8, 0x00])
            }
            ("lcd_contrast", ControlValue::Scalar(level)) => {
                self.send_feature(&handle, &[0x02, 0x20, level as u8, 0x00])
            }
            ("backlight_colour", ControlValue::Rgb([r, g, b])) => {
                self.send_feature(&handle, &[0x05, r, g, b])
            }
            ("invert_lcd", ControlValue::Switch(on)) => {
                self.invert_lcd.store(on, Ordering::SeqCst);
                Ok(())
            }
            (id, value) => {
                debug!("Ignoring unsupported control update {} = {:?}", id, value);
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Control update for '{}' failed: {}", control.id, e);
                self.link.fault();
                Err(DriverError::Usb(e))
            }
        }
    }

    fn grab_keys(&self, tx: mpsc::UnboundedSender<KeyInput>) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let handle = self.current_handle()?;
        let link = self.link.clone();
        let timeout = self.io_timeout;

        let thread = std::thread::Builder::new()
            .name("g15-key-reader".into())
            .spawn(move || {
                let mut last_mask: u64 = 0;
                let mut buf = [0u8; KEY_REPORT_LEN];
                while !link.stop_reader.load(Ordering::SeqCst) {
                    match handle.read_interrupt(KEY_ENDPOINT, &mut buf, timeout) {
                        Ok(n) if n >= KEY_REPORT_LEN => {
                            let mask = decode_report(&buf);
                            let pressed = keys_for_mask(mask & !last_mask);
                            let released = keys_for_mask(last_mask & !mask);
                            last_mask = mask;
                            if !pressed.is_empty() {
                                let _ = tx.send(KeyInput {
                                    keys: pressed,
                                    edge: KeyEdge::Down,
                                });
                            }
                            if !released.is_empty() {
                                let _ = tx.send(KeyInput {
                                    keys: released,
                                    edge: KeyEdge::Up,
                                });
                            }
                        }
                        Ok(_) | Err(rusb::Error::Timeout) => {}
                        Err(e) => {
                            if !link.stop_reader.load(Ordering::SeqCst) {
                                info!("Key read failed ({}), keyboard unplugged?", e);
                                link.fault();
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|_| DriverError::NotConnected)?;
        *self.reader.lock() = Some(thread);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.event_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_report_splits_common_and_extended() {
        // G1 (bit 0), L1 (bit 22) pressed, plus extended G19 (ext bit 0)
        let mut buf = [0u8; KEY_REPORT_LEN];
        let code: u32 = (1 << 0) | (1 << 22);
        buf[1..5].copy_from_slice(&code.to_le_bytes());
        buf[5..9].copy_from_slice(&1u32.to_le_bytes());

        let mask = decode_report(&buf);
        let keys = keys_for_mask(mask);
        assert_eq!(keys, vec![Key::G1, Key::L1, Key::G19]);
    }

    #[test]
    fn test_mask_diff_produces_edges() {
        let before: u64 = 1 << 0; // G1 down
        let after: u64 = (1 << 1) | (1 << 18); // G2 + M1 down, G1 released

        assert_eq!(keys_for_mask(after & !before), vec![Key::G2, Key::M1]);
        assert_eq!(keys_for_mask(before & !after), vec![Key::G1]);
    }

    #[test]
    fn test_controls_follow_model() {
        let g11 = default_controls(Model::G11);
        assert_eq!(g11.len(), 2);
        assert!(g11.iter().all(|c| c.id != "invert_lcd"));

        let g510 = default_controls(Model::G510);
        let colour = g510.iter().find(|c| c.id == "backlight_colour").unwrap();
        assert_eq!(colour.value, ControlValue::Rgb([0, 255, 0]));

        let g110 = default_controls(Model::G110);
        let colour = g110.iter().find(|c| c.id == "backlight_colour").unwrap();
        assert!(colour.hint & hints::RED_BLUE_LED != 0);
    }

    #[test]
    fn test_product_ids_are_distinct() {
        let models = [
            Model::G15v1,
            Model::G15v2,
            Model::G11,
            Model::G13,
            Model::G19,
            Model::G510,
            Model::G110,
            Model::Z10,
        ];
        for (i, a) in models.iter().enumerate() {
            for b in &models[i + 1..] {
                assert_ne!(product_id(*a), product_id(*b));
            }
        }
    }

    #[tokio::test]
    async fn test_paint_requires_connection() {
        let driver = G15DirectDriver::new(Model::G15v1);
        let frame = Framebuffer::new(160, 43);
        assert!(matches!(
            driver.paint(&frame).await,
            Err(DriverError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_link_fault_clears_state_for_reconnect() {
        let driver = G15DirectDriver::new(Model::G15v1);
        let mut events = driver.take_events().unwrap();

        // Bring the link up without hardware, then fail it the way the
        // reader thread does on a read error
        driver.link.connected.store(true, Ordering::SeqCst);
        driver.link.fault();

        assert!(!driver.is_connected());
        assert!(matches!(
            events.try_recv(),
            Ok(DriverEvent::Disconnected { expected: false })
        ));
        // A second fault on a dead link is silent
        driver.link.fault();
        assert!(events.try_recv().is_err());

        // The retry loop must reach the bus again, not bounce off a stale
        // connected flag
        assert!(!matches!(
            driver.connect().await,
            Err(DriverError::AlreadyConnected)
        ));
    }
}
