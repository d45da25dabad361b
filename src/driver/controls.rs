//! Control acquisition stacks
//!
//! Multiple plugins may want the same LED: a notification blink and an error
//! colour can both claim the backlight without clobbering each other. Each
//! claim is an [`Acquisition`] pushed onto a per-control stack; the topmost
//! acquisition is "active" and owns the displayed value. Releasing pops the
//! stack and reveals the previous claim's value, or the pre-acquisition value
//! once the stack empties.
//!
//! Hardware pushes go out on an unbounded channel of [`Control`] snapshots.
//! The main loop pumps that channel into `Driver::on_update_control`, keeping
//! this module free of async driver calls.
//!
//! Lock ordering: the bank lock may be taken while no acquisition state lock
//! is held, and an acquisition state lock is never held across a bank lock.

use crate::driver::{Control, ControlValue};
use crate::scheduler::{self, TimerHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown control '{0}'")]
    UnknownControl(String),
    #[error("acquisition was already released")]
    AlreadyReleased,
}

struct AcqState {
    val: Option<ControlValue>,
    /// Blink phase: true when showing the acquisition's own value.
    on: bool,
    fade_cancelled: bool,
    released: bool,
    reset_timer: Option<TimerHandle>,
    fade_timer: Option<TimerHandle>,
    blink_timer: Option<TimerHandle>,
}

struct AcqShared {
    control_id: String,
    state: Mutex<AcqState>,
    released_notify: Notify,
}

impl AcqShared {
    fn new(control_id: &str) -> Self {
        Self {
            control_id: control_id.to_string(),
            state: Mutex::new(AcqState {
                val: None,
                on: false,
                fade_cancelled: false,
                released: false,
                reset_timer: None,
                fade_timer: None,
                blink_timer: None,
            }),
            released_notify: Notify::new(),
        }
    }
}

#[derive(Default)]
struct BankState {
    controls: HashMap<String, Control>,
    order: Vec<String>,
    stacks: HashMap<String, Vec<Arc<AcqShared>>>,
    baselines: HashMap<String, ControlValue>,
}

struct BankInner {
    state: Mutex<BankState>,
    update_tx: mpsc::UnboundedSender<Control>,
}

/// Owns a connected driver's controls and their acquisition stacks.
#[derive(Clone)]
pub struct ControlBank {
    inner: Arc<BankInner>,
}

impl ControlBank {
    /// Build a bank from a driver's control snapshot. The receiver yields a
    /// [`Control`] snapshot each time a value must be pushed to hardware.
    pub fn new(controls: Vec<Control>) -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let mut state = BankState::default();
        for c in controls {
            state.order.push(c.id.clone());
            state.controls.insert(c.id.clone(), c);
        }
        (
            Self {
                inner: Arc::new(BankInner {
                    state: Mutex::new(state),
                    update_tx,
                }),
            },
            update_rx,
        )
    }

    /// Snapshot of all controls with their current values.
    pub fn controls(&self) -> Vec<Control> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.controls.get(id).cloned())
            .collect()
    }

    pub fn control(&self, id: &str) -> Option<Control> {
        self.inner.state.lock().controls.get(id).cloned()
    }

    pub fn control_for_hint(&self, hint: u32) -> Option<Control> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.controls.get(id))
            .find(|c| c.hint & hint == hint)
            .cloned()
    }

    /// Set a control's value outside of any acquisition. If acquisitions are
    /// stacked on the control, only the baseline is updated, so the new value
    /// appears once the stack empties.
    pub fn set(&self, id: &str, value: ControlValue) -> Result<(), ControlError> {
        let update = {
            let mut state = self.inner.state.lock();
            let clamped = state
                .controls
                .get(id)
                .ok_or_else(|| ControlError::UnknownControl(id.to_string()))?
                .clamp(value);
            let occupied = state.stacks.get(id).map(|s| !s.is_empty()).unwrap_or(false);
            if occupied {
                state.baselines.insert(id.to_string(), clamped);
                None
            } else {
                state.controls.get_mut(id).map(|control| {
                    control.value = clamped;
                    control.clone()
                })
            }
        };
        if let Some(control) = update {
            let _ = self.inner.update_tx.send(control);
        }
        Ok(())
    }

    /// Push a new acquisition onto a control's stack. The first acquisition
    /// snapshots the control's pre-acquisition value for eventual restore.
    pub fn acquire(
        &self,
        id: &str,
        val: Option<ControlValue>,
        release_after: Option<Duration>,
    ) -> Result<Acquisition, ControlError> {
        let (shared, initial) = {
            let mut state = self.inner.state.lock();
            let current = state
                .controls
                .get(id)
                .ok_or_else(|| ControlError::UnknownControl(id.to_string()))?
                .value;
            let first = state.stacks.get(id).map(|s| s.is_empty()).unwrap_or(true);
            if first {
                state.baselines.insert(id.to_string(), current);
            }
            let shared = Arc::new(AcqShared::new(id));
            state
                .stacks
                .entry(id.to_string())
                .or_default()
                .push(shared.clone());
            (shared, val.unwrap_or(current))
        };

        let acq = Acquisition {
            shared,
            bank: self.clone(),
        };
        acq.set_value(initial, None);

        if let Some(delay) = release_after {
            let timed = acq.clone();
            scheduler::schedule(delay, async move {
                // Expires even while stacked under newer claims; a claim that
                // beat the timer to release makes this a no-op
                let _ = timed.release();
            });
        }
        Ok(acq)
    }

    /// Acquire the first control whose hints cover `hint`, if any.
    pub fn acquire_for_hint(
        &self,
        hint: u32,
        val: Option<ControlValue>,
        release_after: Option<Duration>,
    ) -> Option<Acquisition> {
        let id = self.control_for_hint(hint)?.id;
        self.acquire(&id, val, release_after).ok()
    }

    /// Release an acquisition: cancel its timers, notify waiters, pop the
    /// stack, and restore the value of the now-topmost claim (or the
    /// pre-acquisition value if the stack emptied).
    pub fn release(&self, acq: &Acquisition) -> Result<(), ControlError> {
        self.release_shared(&acq.shared)
    }

    /// Release every acquisition and restore all baselines.
    pub fn release_all(&self) {
        let all: Vec<Arc<AcqShared>> = {
            let state = self.inner.state.lock();
            state.stacks.values().flatten().cloned().collect()
        };
        for shared in all {
            let _ = self.release_shared(&shared);
        }
    }

    /// Teardown. With `all_off`, restores go to zero instead of the
    /// pre-acquisition values and every control is switched off afterwards.
    pub fn shutdown(&self, all_off: bool) {
        if all_off {
            let mut state = self.inner.state.lock();
            let zeroed: Vec<(String, ControlValue)> = state
                .baselines
                .iter()
                .map(|(id, v)| (id.clone(), v.zeroize()))
                .collect();
            for (id, v) in zeroed {
                state.baselines.insert(id, v);
            }
        }
        self.release_all();
        if all_off {
            let updates: Vec<Control> = {
                let mut state = self.inner.state.lock();
                let ids: Vec<String> = state.order.clone();
                ids.iter()
                    .filter_map(|id| {
                        let control = state.controls.get_mut(id)?;
                        control.value = control.value.zeroize();
                        Some(control.clone())
                    })
                    .collect()
            };
            for control in updates {
                let _ = self.inner.update_tx.send(control);
            }
        }
    }

    fn release_shared(&self, shared: &Arc<AcqShared>) -> Result<(), ControlError> {
        {
            let mut st = shared.state.lock();
            if st.released {
                return Err(ControlError::AlreadyReleased);
            }
            st.released = true;
            st.fade_cancelled = true;
            if let Some(t) = st.reset_timer.take() {
                t.cancel();
            }
            if let Some(t) = st.fade_timer.take() {
                t.cancel();
            }
            if let Some(t) = st.blink_timer.take() {
                t.cancel();
            }
        }
        shared.released_notify.notify_waiters();

        let update = {
            let mut state = self.inner.state.lock();
            let id = shared.control_id.clone();
            let Some(stack) = state.stacks.get_mut(&id) else {
                return Ok(());
            };
            let before = stack.len();
            stack.retain(|a| !Arc::ptr_eq(a, shared));
            if stack.len() == before {
                return Ok(());
            }
            info!("Releasing control {}", id);
            let restore = if let Some(top) = stack.last() {
                top.state.lock().val
            } else {
                state.stacks.remove(&id);
                state.baselines.remove(&id)
            };
            restore.and_then(|value| {
                state.controls.get_mut(&id).map(|control| {
                    control.value = control.clamp(value);
                    control.clone()
                })
            })
        };
        if let Some(control) = update {
            let _ = self.inner.update_tx.send(control);
        }
        Ok(())
    }

    /// Apply a value to the control iff `shared` is the active (topmost)
    /// acquisition, pushing the update to hardware.
    fn apply_if_active(&self, shared: &Arc<AcqShared>, value: ControlValue) {
        let update = {
            let mut state = self.inner.state.lock();
            let id = &shared.control_id;
            let is_top = state
                .stacks
                .get(id)
                .and_then(|s| s.last())
                .map(|top| Arc::ptr_eq(top, shared))
                .unwrap_or(false);
            if !is_top {
                return;
            }
            state.controls.get_mut(id).map(|control| {
                control.value = control.clamp(value);
                control.clone()
            })
        };
        if let Some(control) = update {
            let _ = self.inner.update_tx.send(control);
        }
    }

    fn is_top(&self, shared: &Arc<AcqShared>) -> bool {
        let state = self.inner.state.lock();
        state
            .stacks
            .get(&shared.control_id)
            .and_then(|s| s.last())
            .map(|top| Arc::ptr_eq(top, shared))
            .unwrap_or(false)
    }
}

/// One claim on a control. Clone freely; all clones refer to the same claim.
#[derive(Clone)]
pub struct Acquisition {
    shared: Arc<AcqShared>,
    bank: ControlBank,
}

impl Acquisition {
    pub fn control_id(&self) -> &str {
        &self.shared.control_id
    }

    /// The value this acquisition wants displayed.
    pub fn value(&self) -> Option<ControlValue> {
        self.shared.state.lock().val
    }

    /// Whether this acquisition is top of its control's stack.
    pub fn is_active(&self) -> bool {
        self.bank.is_top(&self.shared)
    }

    pub fn is_released(&self) -> bool {
        self.shared.state.lock().released
    }

    /// Set the value, cancelling any running fade and pending reset. Only an
    /// active acquisition changes the displayed value; an inactive one just
    /// records what it wants shown when it becomes active again.
    ///
    /// With `reset_after`, the value automatically reverts to what the
    /// acquisition held before this call.
    pub fn set_value(&self, val: ControlValue, reset_after: Option<Duration>) {
        let prior = {
            let mut st = self.shared.state.lock();
            if st.released {
                return;
            }
            let prior = st.val;
            if st.val.is_some() && st.val == Some(val) && reset_after.is_none() {
                return;
            }
            if st.val.is_none() {
                debug!("Initial value of control {} is {:?}", self.shared.control_id, val);
            }
            st.val = Some(val);
            st.on = true;
            st.fade_cancelled = true;
            if let Some(t) = st.fade_timer.take() {
                t.cancel();
            }
            if let Some(t) = st.reset_timer.take() {
                t.cancel();
            }
            prior
        };

        self.bank.apply_if_active(&self.shared, val);

        if let Some(delay) = reset_after {
            let reset_to = prior.unwrap_or(val);
            let acq = self.clone();
            let timer = scheduler::schedule(delay, async move {
                acq.set_value(reset_to, None);
            });
            self.shared.state.lock().reset_timer = Some(timer);
        }
    }

    /// Fade the value down by `percentage` over `duration`. Scalar controls
    /// decrement linearly; RGB controls reduce only the HSV value channel so
    /// the perceived colour does not shift while dimming. Optionally releases
    /// the acquisition once the target is reached.
    pub fn fade(&self, percentage: f64, duration: Duration, release: bool, step: i32) {
        let step = step.max(1);
        let current = {
            let mut st = self.shared.state.lock();
            if st.released {
                return;
            }
            st.fade_cancelled = false;
            if let Some(t) = st.fade_timer.take() {
                t.cancel();
            }
            st.val
        };
        let Some(current) = current else { return };

        let plan = match current {
            ControlValue::Scalar(v) => {
                let target = fade_target(v, percentage);
                if v <= target {
                    None
                } else {
                    let steps = ((v - target) as u32).div_ceil(step as u32);
                    Some((FadePlan::Scalar { target }, duration / steps))
                }
            }
            ControlValue::Rgb(rgb) => {
                let (h, s, v) = rgb_to_hsv(rgb);
                let target_v = fade_target(v as i32, percentage) as u8;
                if v <= target_v {
                    None
                } else {
                    let steps = ((v - target_v) as u32).div_ceil(step as u32);
                    Some((FadePlan::Rgb { h, s, target_v }, duration / steps))
                }
            }
            ControlValue::Switch(_) => None,
        };

        let Some((plan, interval)) = plan else {
            if release {
                let _ = self.release();
            }
            return;
        };

        let acq = self.clone();
        let timer = scheduler::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let current = {
                    let st = acq.shared.state.lock();
                    if st.released || st.fade_cancelled {
                        return;
                    }
                    st.val
                };
                let Some(current) = current else { return };
                let (next, done) = plan.step(current, step);
                acq.apply_faded(next);
                if done {
                    if release {
                        let _ = acq.release();
                    }
                    return;
                }
            }
        });
        self.shared.state.lock().fade_timer = Some(timer);
    }

    /// Alternate between the current value and `off_val` (default: the all-off
    /// value) every `delay`. Stops after `duration` if given, otherwise blinks
    /// until released or superseded by `set_value`.
    pub fn blink(&self, off_val: Option<ControlValue>, delay: Duration, duration: Option<Duration>) {
        let off = {
            let mut st = self.shared.state.lock();
            if st.released {
                return;
            }
            st.fade_cancelled = true;
            if let Some(t) = st.fade_timer.take() {
                t.cancel();
            }
            if let Some(t) = st.reset_timer.take() {
                t.cancel();
            }
            if let Some(t) = st.blink_timer.take() {
                t.cancel();
            }
            off_val.unwrap_or_else(|| st.val.map(|v| v.zeroize()).unwrap_or(ControlValue::Scalar(0)))
        };

        let acq = self.clone();
        let timer = scheduler::spawn(async move {
            let started = tokio::time::Instant::now();
            loop {
                let shown = {
                    let mut st = acq.shared.state.lock();
                    if st.released {
                        return;
                    }
                    let phase_on = st.on;
                    st.on = !phase_on;
                    if phase_on {
                        st.val
                    } else {
                        Some(off)
                    }
                };
                if let Some(v) = shown {
                    acq.bank.apply_if_active(&acq.shared, v);
                }
                if let Some(limit) = duration {
                    if started.elapsed() >= limit {
                        // Leave the acquisition showing its own value
                        if let Some(v) = acq.value() {
                            acq.bank.apply_if_active(&acq.shared, v);
                        }
                        return;
                    }
                }
                tokio::time::sleep(delay).await;
            }
        });
        self.shared.state.lock().blink_timer = Some(timer);
    }

    /// Cancel any running fade, blink, or pending reset.
    pub fn cancel_effects(&self) {
        let mut st = self.shared.state.lock();
        st.fade_cancelled = true;
        if let Some(t) = st.fade_timer.take() {
            t.cancel();
        }
        if let Some(t) = st.blink_timer.take() {
            t.cancel();
        }
        if let Some(t) = st.reset_timer.take() {
            t.cancel();
        }
    }

    pub fn release(&self) -> Result<(), ControlError> {
        self.bank.release(self)
    }

    /// Wait until this acquisition has been released.
    pub async fn wait_released(&self) {
        let notified = self.shared.released_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_released() {
            return;
        }
        notified.await;
    }

    /// Fade-step application: updates the wanted value without cancelling the
    /// fade timer driving it.
    fn apply_faded(&self, val: ControlValue) {
        {
            let mut st = self.shared.state.lock();
            if st.released {
                return;
            }
            st.val = Some(val);
        }
        self.bank.apply_if_active(&self.shared, val);
    }
}

#[derive(Clone, Copy)]
enum FadePlan {
    Scalar { target: i32 },
    Rgb { h: u8, s: u8, target_v: u8 },
}

impl FadePlan {
    /// One fade step from `current`. Returns the next value and whether the
    /// target has been reached.
    fn step(&self, current: ControlValue, step: i32) -> (ControlValue, bool) {
        match (self, current) {
            (FadePlan::Scalar { target }, ControlValue::Scalar(v)) => {
                let next = (v - step).max(*target);
                (ControlValue::Scalar(next), next <= *target)
            }
            (FadePlan::Rgb { h, s, target_v }, ControlValue::Rgb(rgb)) => {
                let (_, _, v) = rgb_to_hsv(rgb);
                let next_v = v.saturating_sub(step as u8).max(*target_v);
                (ControlValue::Rgb(hsv_to_rgb(*h, *s, next_v)), next_v <= *target_v)
            }
            // Variant changed underneath us (new set_value); stop fading
            (_, other) => {
                warn!("Fade aborted, control value changed variant to {:?}", other);
                (other, true)
            }
        }
    }
}

fn fade_target(val: i32, percentage: f64) -> i32 {
    val - ((val as f64 / 100.0) * percentage) as i32
}

/// RGB (0-255 channels) to HSV with all components scaled to 0-255, matching
/// the scaling used for control values.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> (u8, u8, u8) {
    let r = rgb[0] as f64 / 255.0;
    let g = rgb[1] as f64 / 255.0;
    let b = rgb[2] as f64 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        (((g - b) / delta).rem_euclid(6.0)) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (
        (h * 255.0).round() as u8,
        (s * 255.0).round() as u8,
        (max * 255.0).round() as u8,
    )
}

/// Inverse of [`rgb_to_hsv`].
pub fn hsv_to_rgb(h: u8, s: u8, v: u8) -> [u8; 3] {
    let h = h as f64 / 255.0 * 6.0;
    let s = s as f64 / 255.0;
    let v = v as f64 / 255.0;

    let i = (h.floor() as i32).rem_euclid(6);
    let f = h - h.floor();
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match i {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    [
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::hints;

    const RED: ControlValue = ControlValue::Rgb([255, 0, 0]);
    const BLUE: ControlValue = ControlValue::Rgb([0, 0, 255]);
    const WHITE: ControlValue = ControlValue::Rgb([255, 255, 255]);

    fn test_bank() -> (ControlBank, mpsc::UnboundedReceiver<Control>) {
        ControlBank::new(vec![
            Control::new(
                "backlight_colour",
                "Backlight Colour",
                WHITE,
                0,
                255,
                hints::DIMMABLE | hints::SHADEABLE,
            ),
            Control::new("lcd_brightness", "LCD Brightness", ControlValue::Scalar(2), 0, 2, hints::DIMMABLE),
        ])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Control>) -> Vec<Control> {
        let mut out = Vec::new();
        while let Ok(c) = rx.try_recv() {
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn test_release_restores_pre_acquisition_value() {
        let (bank, _rx) = test_bank();

        let a = bank.acquire("backlight_colour", Some(RED), None).unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, RED);

        a.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, WHITE);
    }

    #[tokio::test]
    async fn test_stacked_acquisitions_unwind_in_order() {
        let (bank, _rx) = test_bank();

        let red = bank.acquire("backlight_colour", Some(RED), None).unwrap();
        let blue = bank.acquire("backlight_colour", Some(BLUE), None).unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);
        assert!(blue.is_active());
        assert!(!red.is_active());

        blue.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, RED);

        red.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, WHITE);
    }

    #[tokio::test]
    async fn test_release_of_non_topmost_keeps_displayed_value() {
        let (bank, mut rx) = test_bank();

        let red = bank.acquire("backlight_colour", Some(RED), None).unwrap();
        let blue = bank.acquire("backlight_colour", Some(BLUE), None).unwrap();
        drain(&mut rx);

        red.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);
        // Restoring "blue" again is fine, but the displayed value never changed
        for update in drain(&mut rx) {
            assert_eq!(update.value, BLUE);
        }

        blue.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, WHITE);
    }

    #[tokio::test]
    async fn test_double_release_errors() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("lcd_brightness", None, None).unwrap();
        a.release().unwrap();
        assert!(matches!(a.release(), Err(ControlError::AlreadyReleased)));
    }

    #[tokio::test]
    async fn test_inactive_acquisition_set_value_not_displayed() {
        let (bank, _rx) = test_bank();
        let red = bank.acquire("backlight_colour", Some(RED), None).unwrap();
        let _blue = bank.acquire("backlight_colour", Some(BLUE), None).unwrap();

        red.set_value(ControlValue::Rgb([0, 255, 0]), None);
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_auto_releases() {
        let (bank, _rx) = test_bank();
        let a = bank
            .acquire("backlight_colour", Some(RED), Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, RED);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(a.is_released());
        assert_eq!(bank.control("backlight_colour").unwrap().value, WHITE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expires_while_stacked() {
        let (bank, _rx) = test_bank();
        let red = bank
            .acquire("backlight_colour", Some(RED), Some(Duration::from_secs(1)))
            .unwrap();
        let blue = bank.acquire("backlight_colour", Some(BLUE), None).unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);

        // The timer expires even though the claim is buried under blue
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(red.is_released());
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);

        // Unwinding past the expired claim lands on the baseline, not RED
        blue.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, WHITE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_value_reset_after_reverts_to_prior() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("lcd_brightness", Some(ControlValue::Scalar(2)), None).unwrap();

        a.set_value(ControlValue::Scalar(0), Some(Duration::from_millis(500)));
        assert_eq!(bank.control("lcd_brightness").unwrap().value, ControlValue::Scalar(0));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(bank.control("lcd_brightness").unwrap().value, ControlValue::Scalar(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blink_alternates_and_stops_after_duration() {
        let (bank, mut rx) = test_bank();
        let a = bank.acquire("lcd_brightness", Some(ControlValue::Scalar(2)), None).unwrap();
        drain(&mut rx);

        a.blink(
            None,
            Duration::from_millis(100),
            Some(Duration::from_millis(450)),
        );
        tokio::time::sleep(Duration::from_millis(700)).await;

        let updates = drain(&mut rx);
        let values: Vec<ControlValue> = updates.iter().map(|c| c.value).collect();
        assert!(values.contains(&ControlValue::Scalar(0)));
        assert!(values.contains(&ControlValue::Scalar(2)));
        // Ends back on the acquisition's own value
        assert_eq!(bank.control("lcd_brightness").unwrap().value, ControlValue::Scalar(2));

        // No further updates after the blink stopped
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalar_fade_reaches_target_and_releases() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("lcd_brightness", Some(ControlValue::Scalar(2)), None).unwrap();

        a.fade(100.0, Duration::from_millis(200), true, 1);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(a.is_released());
        // Released after fading, so the baseline is restored
        assert_eq!(bank.control("lcd_brightness").unwrap().value, ControlValue::Scalar(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rgb_fade_preserves_hue() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("backlight_colour", Some(RED), None).unwrap();

        a.fade(50.0, Duration::from_millis(200), false, 8);
        tokio::time::sleep(Duration::from_millis(600)).await;

        let value = bank.control("backlight_colour").unwrap().value;
        let rgb = value.as_rgb().unwrap();
        // Still pure red, just darker
        assert!(rgb[0] > 0 && rgb[0] < 255);
        assert_eq!(rgb[1], 0);
        assert_eq!(rgb[2], 0);
        assert!(!a.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_value_cancels_running_fade() {
        let (bank, _rx) = test_bank();
        let a = bank
            .acquire("backlight_colour", Some(WHITE), None)
            .unwrap();

        a.fade(100.0, Duration::from_secs(10), false, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.set_value(RED, None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The fade was cancelled; the value stays where set_value put it
        assert_eq!(bank.control("backlight_colour").unwrap().value, RED);
    }

    #[tokio::test]
    async fn test_wait_released() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("lcd_brightness", None, None).unwrap();
        let waiter = a.clone();
        let task = tokio::spawn(async move { waiter.wait_released().await });
        tokio::task::yield_now().await;
        a.release().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_off_zeroes_controls() {
        let (bank, mut rx) = test_bank();
        let _a = bank.acquire("backlight_colour", Some(RED), None).unwrap();
        drain(&mut rx);

        bank.shutdown(true);
        assert_eq!(
            bank.control("backlight_colour").unwrap().value,
            ControlValue::Rgb([0, 0, 0])
        );
        assert_eq!(bank.control("lcd_brightness").unwrap().value, ControlValue::Scalar(0));
    }

    #[tokio::test]
    async fn test_set_with_stacked_acquisition_updates_baseline() {
        let (bank, _rx) = test_bank();
        let a = bank.acquire("backlight_colour", Some(RED), None).unwrap();

        bank.set("backlight_colour", BLUE).unwrap();
        // Displayed value still the acquisition's
        assert_eq!(bank.control("backlight_colour").unwrap().value, RED);

        a.release().unwrap();
        assert_eq!(bank.control("backlight_colour").unwrap().value, BLUE);
    }

    #[test]
    fn test_hsv_roundtrip_primaries() {
        for rgb in [[255u8, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 0]] {
            let (h, s, v) = rgb_to_hsv(rgb);
            let back = hsv_to_rgb(h, s, v);
            for i in 0..3 {
                assert!((back[i] as i32 - rgb[i] as i32).abs() <= 3, "{:?} -> {:?}", rgb, back);
            }
        }
    }
}
