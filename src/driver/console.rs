//! Console driver - logs all actions for testing and debugging

use crate::driver::{
    hints, Action, ActionBinding, Control, ControlValue, Driver, DriverError, DriverEvent, Key,
    KeyEdge, KeyInput, Model,
};
use crate::framebuffer::Framebuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// ConsoleDriver logs all driver actions to console/logs
///
/// This is useful for:
/// - Testing pages and key handling without real hardware
/// - Debugging paint/control flow
/// - Development on machines with no G-series keyboard plugged in
///
/// Tests can inspect the last painted frame and the recorded control updates,
/// and inject key edges as if hardware produced them.
pub struct ConsoleDriver {
    model: Model,
    connected: AtomicBool,
    paint_count: AtomicU64,
    last_frame: Mutex<Option<Framebuffer>>,
    control_updates: Mutex<Vec<Control>>,
    key_tx: Mutex<Option<mpsc::UnboundedSender<KeyInput>>>,
    event_tx: mpsc::UnboundedSender<DriverEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

impl ConsoleDriver {
    pub fn new() -> Self {
        Self::with_model(Model::G15v1)
    }

    /// Emulate a specific model, e.g. [`Model::G11`] for a device with no LCD.
    pub fn with_model(model: Model) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            model,
            connected: AtomicBool::new(false),
            paint_count: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            control_updates: Mutex::new(Vec::new()),
            key_tx: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// The most recently painted frame, if any.
    pub fn last_frame(&self) -> Option<Framebuffer> {
        self.last_frame.lock().clone()
    }

    pub fn paint_count(&self) -> u64 {
        self.paint_count.load(Ordering::SeqCst)
    }

    /// Every control update pushed since connect, in order.
    pub fn control_updates(&self) -> Vec<Control> {
        self.control_updates.lock().clone()
    }

    /// Inject a key edge as if the hardware reported it.
    pub fn inject_keys(&self, keys: Vec<Key>, edge: KeyEdge) {
        if let Some(tx) = self.key_tx.lock().as_ref() {
            let _ = tx.send(KeyInput { keys, edge });
        }
    }

    /// Simulate an unexpected unplug.
    pub fn simulate_unplug(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.event_tx.send(DriverEvent::Disconnected { expected: false });
        }
    }
}

impl Default for ConsoleDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for ConsoleDriver {
    fn name(&self) -> &str {
        "console"
    }

    fn model(&self) -> Model {
        self.model
    }

    fn controls(&self) -> Vec<Control> {
        vec![
            Control::new(
                "backlight_colour",
                "Keyboard Backlight Colour",
                ControlValue::Rgb([255, 255, 255]),
                0,
                255,
                hints::DIMMABLE | hints::SHADEABLE,
            ),
            Control::new(
                "lcd_brightness",
                "LCD Brightness",
                ControlValue::Scalar(2),
                0,
                2,
                hints::DIMMABLE,
            ),
            Control::new(
                "memory_bank_leds",
                "Memory Bank LEDs",
                ControlValue::Scalar(0),
                0,
                15,
                hints::MKEYS,
            ),
        ]
    }

    fn key_layout(&self) -> Vec<Vec<Key>> {
        vec![
            vec![Key::G1, Key::G2, Key::G3],
            vec![Key::G4, Key::G5, Key::G6],
            vec![Key::M1, Key::M2, Key::M3, Key::Mr],
            vec![Key::L1, Key::L2, Key::L3, Key::L4, Key::L5],
        ]
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
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyConnected);
        }
        self.paint_count.store(0, Ordering::SeqCst);
        self.control_updates.lock().clear();
        info!("🔌 Console driver connected (emulating {:?})", self.model);
        let _ = self.event_tx.send(DriverEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(DriverError::NotConnected);
        }
        info!("🔌 Console driver disconnected");
        let _ = self.event_tx.send(DriverEvent::Disconnected { expected: true });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn paint(&self, frame: &Framebuffer) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let n = self.paint_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "🖼️  Console paint #{} ({}x{})",
            n,
            frame.width(),
            frame.height()
        );
        *self.last_frame.lock() = Some(frame.clone());
        Ok(())
    }

    async fn on_update_control(&self, control: &Control) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        debug!("🎛️  Control '{}' → {:?}", control.id, control.value);
        self.control_updates.lock().push(control.clone());
        Ok(())
    }

    fn grab_keys(&self, tx: mpsc::UnboundedSender<KeyInput>) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        *self.key_tx.lock() = Some(tx);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.event_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect_lifecycle() {
        let driver = ConsoleDriver::new();
        assert!(!driver.is_connected());

        driver.connect().await.unwrap();
        assert!(driver.is_connected());
        assert!(matches!(
            driver.connect().await,
            Err(DriverError::AlreadyConnected)
        ));

        driver.disconnect().await.unwrap();
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.disconnect().await,
            Err(DriverError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_paint_requires_connection() {
        let driver = ConsoleDriver::new();
        let frame = Framebuffer::new(160, 43);
        assert!(matches!(
            driver.paint(&frame).await,
            Err(DriverError::NotConnected)
        ));

        driver.connect().await.unwrap();
        driver.paint(&frame).await.unwrap();
        assert_eq!(driver.paint_count(), 1);
        assert_eq!(driver.last_frame().unwrap().width(), 160);
    }

    #[tokio::test]
    async fn test_injected_keys_reach_grabber() {
        let driver = ConsoleDriver::new();
        driver.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        driver.grab_keys(tx).unwrap();
        driver.inject_keys(vec![Key::G1], KeyEdge::Down);

        let input = rx.recv().await.unwrap();
        assert_eq!(input.keys, vec![Key::G1]);
        assert_eq!(input.edge, KeyEdge::Down);
    }

    #[tokio::test]
    async fn test_unplug_emits_unexpected_disconnect() {
        let driver = ConsoleDriver::new();
        let mut events = driver.take_events().unwrap();
        driver.connect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), DriverEvent::Connected);

        driver.simulate_unplug();
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::Disconnected { expected: false }
        );
        assert!(!driver.is_connected());
    }
}
