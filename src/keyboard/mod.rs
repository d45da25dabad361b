//! Key state machine
//!
//! Raw key edges from the driver arrive in batches on a channel and are
//! processed strictly in order by a single dispatch task. Each key carries a
//! small state record: its current edge, a hold timer, and consumption flags
//! that stop one physical press from triggering more than one binding.
//!
//! Matching order per batch: raw handlers (plugins that take over the keys
//! entirely) → uinput macros → held macros → up macros → action bindings.
//! A uinput macro mirrors native key semantics: pressing the G-key presses
//! the virtual key, releasing it releases the virtual key, with the repeat
//! mode deciding what happens in between.

use crate::driver::{Action, ActionBinding, Key, KeyEdge, KeyInput};
use crate::scheduler::{self, TimerHandle};
use crate::uinput::VirtualInput;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Default hold duration before a DOWN key synthesizes a HELD edge.
pub const DEFAULT_HOLD_DURATION: Duration = Duration::from_secs(2);

/// Default interval between repeats when a macro doesn't set its own.
const DEFAULT_REPEAT_DELAY: Duration = Duration::from_millis(100);

/// How a macro behaves while its keys stay pressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatMode {
    /// Synthetic press+release on DOWN; the real release is defeated.
    #[default]
    NoRepeat,
    /// Alternating presses start and stop a continuous repeat.
    RepeatToggle,
    /// Repeats only while the physical key is in the HELD state.
    RepeatWhileHeld,
}

/// What a macro does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MacroKind {
    /// Inject an evdev key code through the virtual input device.
    Uinput { code: u16 },
    /// Hand the macro to the daemon for script/command execution.
    Script { command: String },
    /// Re-map the keys to a built-in action.
    Action { action: Action },
}

/// A macro bound to a key combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMacro {
    pub name: String,
    pub keys: Vec<Key>,
    /// Edge the macro activates on (Up or Held); ignored for uinput macros,
    /// which follow the physical edges directly.
    pub activate_on: KeyEdge,
    pub kind: MacroKind,
    pub repeat_mode: RepeatMode,
    /// Interval between repeats; `None` uses the default rate.
    pub repeat_delay: Option<Duration>,
}

impl KeyMacro {
    fn delay(&self) -> Duration {
        self.repeat_delay.unwrap_or(DEFAULT_REPEAT_DELAY)
    }
}

/// The full set of bindings active for the current memory bank.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub macros: Vec<KeyMacro>,
    pub actions: Vec<ActionBinding>,
}

/// Plugins that take over key handling entirely (e.g. a screensaver that
/// swallows everything). Called before (`post == false`) and after
/// (`post == true`) macro matching; returning true stops further processing.
pub trait RawKeyHandler: Send + Sync {
    fn handle_key(&self, keys: &[Key], edge: KeyEdge, post: bool) -> bool;
}

/// Receives actions resolved from key presses. Returning true claims the
/// action.
pub trait ActionListener: Send + Sync {
    fn action_performed(&self, binding: &ActionBinding) -> bool;
}

struct KeyState {
    edge: Option<KeyEdge>,
    consumed: bool,
    defeat_release: bool,
    consume_until_release: bool,
    hold_timer: Option<TimerHandle>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            edge: None,
            consumed: false,
            defeat_release: false,
            consume_until_release: false,
            hold_timer: None,
        }
    }

    fn is_consumed(&self) -> bool {
        self.consumed || self.consume_until_release
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.hold_timer.take() {
            timer.cancel();
        }
    }
}

#[derive(Default)]
struct HandlerState {
    key_states: HashMap<Key, KeyState>,
    /// Names of macros currently repeating, with the loop driving each.
    repeating: HashMap<String, TimerHandle>,
}

/// Owns the key-state map and dispatches batches of key edges to bindings.
pub struct KeyHandler {
    state: Mutex<HandlerState>,
    bindings: Mutex<Bindings>,
    uinput: Arc<dyn VirtualInput>,
    hold_duration: Duration,
    macro_tx: mpsc::UnboundedSender<KeyMacro>,
    action_listeners: Mutex<Vec<Arc<dyn ActionListener>>>,
    raw_handlers: Mutex<Vec<Arc<dyn RawKeyHandler>>>,
    /// Sender for re-injecting synthesized HELD events in arrival order.
    self_tx: Mutex<Option<mpsc::UnboundedSender<KeyInput>>>,
    redraw: Box<dyn Fn() + Send + Sync>,
}

impl KeyHandler {
    /// The receiver yields macros of kind `Script` for the daemon to run.
    pub fn new(
        uinput: Arc<dyn VirtualInput>,
        hold_duration: Duration,
        redraw: impl Fn() + Send + Sync + 'static,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<KeyMacro>) {
        let (macro_tx, macro_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(HandlerState::default()),
                bindings: Mutex::new(Bindings::default()),
                uinput,
                hold_duration,
                macro_tx,
                action_listeners: Mutex::new(Vec::new()),
                raw_handlers: Mutex::new(Vec::new()),
                self_tx: Mutex::new(None),
                redraw: Box::new(redraw),
            }),
            macro_rx,
        )
    }

    /// Replace the active bindings (called when the memory bank or profile
    /// changes). Running repeats are stopped.
    pub fn set_bindings(&self, bindings: Bindings) {
        let mut state = self.state.lock();
        for (_, timer) in state.repeating.drain() {
            timer.cancel();
        }
        drop(state);
        *self.bindings.lock() = bindings;
    }

    pub fn add_action_listener(&self, listener: Arc<dyn ActionListener>) {
        self.action_listeners.lock().push(listener);
    }

    pub fn add_raw_handler(&self, handler: Arc<dyn RawKeyHandler>) {
        self.raw_handlers.lock().push(handler);
    }

    /// Start the dispatch task. The returned sender is handed to
    /// `Driver::grab_keys`; the same channel carries synthesized HELD events
    /// so processing stays strictly ordered.
    pub fn start(self: &Arc<Self>) -> mpsc::UnboundedSender<KeyInput> {
        let (tx, mut rx) = mpsc::unbounded_channel::<KeyInput>();
        *self.self_tx.lock() = Some(tx.clone());
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                handler.process(&input);
            }
            debug!("Key channel closed, dispatch task exiting");
        });
        tx
    }

    /// Snapshot of the live key states, for status display and tests.
    pub fn key_states(&self) -> HashMap<Key, KeyEdge> {
        self.state
            .lock()
            .key_states
            .iter()
            .filter_map(|(k, s)| s.edge.map(|e| (*k, e)))
            .collect()
    }

    /// Handle one batch of key edges. Whatever happens during matching, the
    /// visible page is redrawn at the end.
    fn process(self: &Arc<Self>, input: &KeyInput) {
        debug!("Keys {:?} now {:?}", input.keys, input.edge);
        if !self.dispatch_raw(&input.keys, input.edge, false) {
            for key in &input.keys {
                if self.configure_key_state(*key, input.edge) {
                    self.handle_uinput_macros();
                    self.handle_normal_macros();
                    self.handle_actions();
                }
            }
            self.dispatch_raw(&input.keys, input.edge, true);
            self.clear_if_all_up();
        }
        (self.redraw)();
    }

    fn dispatch_raw(&self, keys: &[Key], edge: KeyEdge, post: bool) -> bool {
        let handlers = self.raw_handlers.lock().clone();
        handlers.iter().any(|h| h.handle_key(keys, edge, post))
    }

    /// Update one key's state record. Returns false if the event should be
    /// ignored (stale HELD, or an edge that cannot follow the current state).
    fn configure_key_state(self: &Arc<Self>, key: Key, edge: KeyEdge) -> bool {
        let mut state = self.state.lock();

        if edge == KeyEdge::Held && !state.key_states.contains_key(&key) {
            // All keys were released before the hold timer fired
            return false;
        }
        let ks = state.key_states.entry(key).or_insert_with(KeyState::new);

        // A fresh edge resets per-press consumption
        ks.consumed = false;

        let valid = match (edge, ks.edge) {
            (KeyEdge::Up, Some(KeyEdge::Down) | Some(KeyEdge::Held)) => true,
            (KeyEdge::Up, _) => {
                warn!("Key up for {} without a preceding down, dropping", key);
                false
            }
            (KeyEdge::Held, Some(KeyEdge::Down)) => true,
            (KeyEdge::Held, _) => {
                warn!("Key held for {} without a preceding down, dropping", key);
                false
            }
            (KeyEdge::Down, _) => true,
        };
        if !valid {
            // Don't keep a record that never saw a real press
            if state.key_states.get(&key).and_then(|ks| ks.edge).is_none() {
                state.key_states.remove(&key);
            }
            return false;
        }
        let ks = state.key_states.entry(key).or_insert_with(KeyState::new);
        ks.edge = Some(edge);

        match edge {
            KeyEdge::Down => {
                ks.cancel_timer();
                let tx = self.self_tx.lock().clone();
                if let Some(tx) = tx {
                    ks.hold_timer = Some(scheduler::schedule(self.hold_duration, async move {
                        let _ = tx.send(KeyInput {
                            keys: vec![key],
                            edge: KeyEdge::Held,
                        });
                    }));
                }
            }
            KeyEdge::Up => {
                ks.cancel_timer();
                let released: Vec<String> = state
                    .repeating
                    .keys()
                    .cloned()
                    .collect();
                drop(state);
                // Stop while-held repeats whose keys just came up
                self.stop_released_repeats(key, &released);
                return true;
            }
            KeyEdge::Held => {}
        }
        true
    }

    fn stop_released_repeats(&self, key: Key, candidates: &[String]) {
        let bindings = self.bindings.lock().clone();
        let mut state = self.state.lock();
        for name in candidates {
            let Some(m) = bindings.macros.iter().find(|m| &m.name == name) else {
                continue;
            };
            if m.repeat_mode == RepeatMode::RepeatWhileHeld && m.keys.contains(&key) {
                if let Some(timer) = state.repeating.remove(name) {
                    timer.cancel();
                }
            }
        }
    }

    /// Match uinput macros against the current key states. These follow the
    /// physical edges: DOWN presses the virtual key, UP releases it.
    fn handle_uinput_macros(self: &Arc<Self>) {
        let bindings = self.bindings.lock().clone();
        for m in &bindings.macros {
            let MacroKind::Uinput { code } = m.kind else {
                continue;
            };
            let (down, up, held) = {
                let state = self.state.lock();
                let mut down = 0;
                let mut up = 0;
                let mut held = 0;
                for key in &m.keys {
                    let Some(ks) = state.key_states.get(key) else {
                        continue;
                    };
                    if ks.is_consumed() {
                        continue;
                    }
                    match ks.edge {
                        Some(KeyEdge::Down) => down += 1,
                        Some(KeyEdge::Up) if !ks.defeat_release => up += 1,
                        Some(KeyEdge::Held) => held += 1,
                        _ => {}
                    }
                }
                (down, up, held)
            };
            let total = m.keys.len();
            if down == total {
                self.uinput_macro_edge(m, code, KeyEdge::Down);
            }
            if up == total {
                self.uinput_macro_edge(m, code, KeyEdge::Up);
            }
            if held == total {
                self.uinput_macro_edge(m, code, KeyEdge::Held);
            }
        }
    }

    fn uinput_macro_edge(self: &Arc<Self>, m: &KeyMacro, code: u16, edge: KeyEdge) {
        self.consume_keys(&m.keys);
        let emit = |value: i32| {
            if let Err(e) = self.uinput.emit(code, value) {
                warn!("uinput emit failed: {}", e);
            }
        };
        match edge {
            KeyEdge::Up => {
                let was_repeating = self.stop_repeat(&m.name);
                if !was_repeating || m.repeat_mode == RepeatMode::RepeatWhileHeld {
                    emit(0);
                }
            }
            KeyEdge::Down => {
                if self.stop_repeat(&m.name) {
                    // Second press of a toggle: release and stop
                    emit(0);
                    self.defeat_release(&m.keys);
                    return;
                }
                match m.repeat_mode {
                    RepeatMode::NoRepeat => {
                        emit(1);
                        emit(0);
                        self.defeat_release(&m.keys);
                    }
                    RepeatMode::RepeatToggle => {
                        self.defeat_release(&m.keys);
                        self.start_repeat(m, code);
                    }
                    RepeatMode::RepeatWhileHeld => {
                        emit(1);
                        emit(0);
                    }
                }
            }
            KeyEdge::Held => {
                if m.repeat_mode == RepeatMode::RepeatWhileHeld {
                    self.start_repeat(m, code);
                }
            }
        }
    }

    /// Begin a repeat loop emitting press+release at the macro's rate until
    /// stopped.
    fn start_repeat(self: &Arc<Self>, m: &KeyMacro, code: u16) {
        let mut state = self.state.lock();
        if state.repeating.contains_key(&m.name) {
            return;
        }
        let name = m.name.clone();
        let delay = m.delay();
        let handler = self.clone();
        let timer = scheduler::spawn(async move {
            loop {
                {
                    let state = handler.state.lock();
                    if !state.repeating.contains_key(&name) {
                        return;
                    }
                }
                if handler.uinput.press(code).is_err() || handler.uinput.release(code).is_err() {
                    warn!("uinput repeat emit failed, stopping repeat of '{}'", name);
                    handler.state.lock().repeating.remove(&name);
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });
        state.repeating.insert(m.name.clone(), timer);
    }

    /// Stop a repeat loop if one is running. Returns whether it was running.
    fn stop_repeat(&self, name: &str) -> bool {
        match self.state.lock().repeating.remove(name) {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Held macros first so up macros don't steal their key states, then the
    /// up macros.
    fn handle_normal_macros(self: &Arc<Self>) {
        let bindings = self.bindings.lock().clone();
        let normal: Vec<&KeyMacro> = bindings
            .macros
            .iter()
            .filter(|m| !matches!(m.kind, MacroKind::Uinput { .. }))
            .collect();

        for m in normal.iter().filter(|m| m.activate_on == KeyEdge::Held) {
            if self.keys_all_at(&m.keys, KeyEdge::Held, false) {
                self.fire_macro(m, KeyEdge::Held);
                // Defeat the release so an up macro on the same keys stays quiet
                self.defeat_release(&m.keys);
            }
        }
        for m in normal.iter().filter(|m| m.activate_on == KeyEdge::Up) {
            if self.keys_all_at(&m.keys, KeyEdge::Up, true) {
                self.fire_macro(m, KeyEdge::Up);
            }
        }
    }

    fn keys_all_at(&self, keys: &[Key], edge: KeyEdge, honor_defeat: bool) -> bool {
        let state = self.state.lock();
        keys.iter().all(|key| {
            state.key_states.get(key).is_some_and(|ks| {
                ks.edge == Some(edge)
                    && !ks.is_consumed()
                    && !(honor_defeat && ks.defeat_release)
            })
        })
    }

    fn fire_macro(self: &Arc<Self>, m: &KeyMacro, edge: KeyEdge) {
        self.consume_keys(&m.keys);
        match &m.kind {
            MacroKind::Action { action } => {
                let binding = ActionBinding::new(*action, m.keys.clone(), edge);
                if self.dispatch_action(&binding) {
                    self.consume_until_release(&m.keys);
                }
            }
            MacroKind::Script { .. } => {
                info!("Running macro '{}'", m.name);
                match m.repeat_mode {
                    RepeatMode::NoRepeat => {
                        let _ = self.macro_tx.send(m.clone());
                    }
                    RepeatMode::RepeatToggle | RepeatMode::RepeatWhileHeld => {
                        if self.stop_repeat(&m.name) {
                            return;
                        }
                        self.start_macro_repeat(m);
                    }
                }
            }
            MacroKind::Uinput { .. } => {}
        }
    }

    /// Repeating script macro: re-sent to the daemon at the macro's rate.
    fn start_macro_repeat(self: &Arc<Self>, m: &KeyMacro) {
        let mut state = self.state.lock();
        if state.repeating.contains_key(&m.name) {
            return;
        }
        let name = m.name.clone();
        let delay = m.delay();
        let handler = self.clone();
        let mac = m.clone();
        let timer = scheduler::spawn(async move {
            loop {
                {
                    let state = handler.state.lock();
                    if !state.repeating.contains_key(&name) {
                        return;
                    }
                }
                let _ = handler.macro_tx.send(mac.clone());
                tokio::time::sleep(delay).await;
            }
        });
        state.repeating.insert(m.name.clone(), timer);
    }

    /// Default action bindings come last; keys claimed by a macro above are
    /// skipped, and matched keys are dead until released.
    fn handle_actions(&self) {
        let bindings = self.bindings.lock().clone();
        for binding in &bindings.actions {
            let matched = {
                let state = self.state.lock();
                binding.keys.iter().all(|key| {
                    state
                        .key_states
                        .get(key)
                        .is_some_and(|ks| ks.edge == Some(binding.edge) && !ks.is_consumed())
                })
            };
            if matched {
                self.dispatch_action(binding);
                self.consume_until_release(&binding.keys);
            }
        }
    }

    fn dispatch_action(&self, binding: &ActionBinding) -> bool {
        info!("Invoking action {:?}", binding.action);
        let listeners = self.action_listeners.lock().clone();
        listeners.iter().any(|l| l.action_performed(binding))
    }

    fn consume_keys(&self, keys: &[Key]) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(ks) = state.key_states.get_mut(key) {
                ks.consumed = true;
            }
        }
    }

    fn consume_until_release(&self, keys: &[Key]) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(ks) = state.key_states.get_mut(key) {
                ks.consume_until_release = true;
            }
        }
    }

    fn defeat_release(&self, keys: &[Key]) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(ks) = state.key_states.get_mut(key) {
                ks.defeat_release = true;
                ks.cancel_timer();
            }
        }
    }

    /// Once every tracked key is up, the whole map is dropped so the next
    /// press starts from a clean slate.
    fn clear_if_all_up(&self) {
        let mut state = self.state.lock();
        if !state.key_states.is_empty()
            && state
                .key_states
                .values()
                .all(|ks| ks.edge == Some(KeyEdge::Up))
        {
            state.key_states.clear();
        }
    }
}
