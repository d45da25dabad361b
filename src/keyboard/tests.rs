use super::*;
use crate::driver::{Action, ActionBinding};
use crate::uinput::RecordingInput;
use std::sync::atomic::{AtomicUsize, Ordering};

const KEY_A: u16 = 30;

struct Recorder {
    actions: Mutex<Vec<Action>>,
    claim: bool,
}

impl Recorder {
    fn new(claim: bool) -> Arc<Self> {
        Arc::new(Self {
            actions: Mutex::new(Vec::new()),
            claim,
        })
    }

    fn actions(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }
}

impl ActionListener for Recorder {
    fn action_performed(&self, binding: &ActionBinding) -> bool {
        self.actions.lock().push(binding.action);
        self.claim
    }
}

struct Swallower;

impl RawKeyHandler for Swallower {
    fn handle_key(&self, _keys: &[Key], _edge: KeyEdge, post: bool) -> bool {
        !post
    }
}

fn uinput_macro(name: &str, keys: Vec<Key>, repeat_mode: RepeatMode) -> KeyMacro {
    KeyMacro {
        name: name.to_string(),
        keys,
        activate_on: KeyEdge::Up,
        kind: MacroKind::Uinput { code: KEY_A },
        repeat_mode,
        repeat_delay: Some(Duration::from_millis(100)),
    }
}

fn script_macro(name: &str, keys: Vec<Key>, activate_on: KeyEdge) -> KeyMacro {
    KeyMacro {
        name: name.to_string(),
        keys,
        activate_on,
        kind: MacroKind::Script {
            command: "true".to_string(),
        },
        repeat_mode: RepeatMode::NoRepeat,
        repeat_delay: None,
    }
}

struct Fixture {
    handler: Arc<KeyHandler>,
    tx: mpsc::UnboundedSender<KeyInput>,
    input: Arc<RecordingInput>,
    macro_rx: mpsc::UnboundedReceiver<KeyMacro>,
    redraws: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let input = Arc::new(RecordingInput::new());
    let redraws = Arc::new(AtomicUsize::new(0));
    let redraws_clone = redraws.clone();
    let (handler, macro_rx) = KeyHandler::new(input.clone(), DEFAULT_HOLD_DURATION, move || {
        redraws_clone.fetch_add(1, Ordering::SeqCst);
    });
    let tx = handler.start();
    Fixture {
        handler,
        tx,
        input,
        macro_rx,
        redraws,
    }
}

fn send(tx: &mpsc::UnboundedSender<KeyInput>, keys: Vec<Key>, edge: KeyEdge) {
    tx.send(KeyInput { keys, edge }).unwrap();
}

/// Let the dispatch task drain the channel (paused clock auto-advances).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_down_synthesizes_held_after_hold_duration() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.set_bindings(Bindings {
        macros: vec![],
        actions: vec![ActionBinding::new(Action::NextPage, vec![Key::G1], KeyEdge::Held)],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    assert!(listener.actions().is_empty());
    assert_eq!(f.handler.key_states().get(&Key::G1), Some(&KeyEdge::Down));

    tokio::time::sleep(DEFAULT_HOLD_DURATION + Duration::from_millis(100)).await;
    assert_eq!(listener.actions(), vec![Action::NextPage]);
    assert_eq!(f.handler.key_states().get(&Key::G1), Some(&KeyEdge::Held));
}

#[tokio::test(start_paused = true)]
async fn test_up_cancels_hold_timer() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.set_bindings(Bindings {
        macros: vec![],
        actions: vec![ActionBinding::new(Action::Select, vec![Key::G1], KeyEdge::Held)],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    tokio::time::sleep(DEFAULT_HOLD_DURATION * 2).await;
    assert!(listener.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_up_without_down_is_dropped() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.set_bindings(Bindings {
        macros: vec![],
        actions: vec![ActionBinding::new(Action::Select, vec![Key::G1], KeyEdge::Up)],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;
    assert!(listener.actions().is_empty());
    assert!(f.handler.key_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_repeat_macro_defeats_real_release() {
    let f = fixture();
    f.handler.set_bindings(Bindings {
        macros: vec![uinput_macro("tap", vec![Key::G1], RepeatMode::NoRepeat)],
        actions: vec![],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    assert_eq!(f.input.events(), vec![(KEY_A, 1), (KEY_A, 0)]);

    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;
    // The real release was defeated; no further events
    assert_eq!(f.input.events(), vec![(KEY_A, 1), (KEY_A, 0)]);
    assert!(f.handler.key_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_toggle_repeats_until_second_press() {
    let f = fixture();
    f.handler.set_bindings(Bindings {
        macros: vec![uinput_macro("toggle", vec![Key::G1], RepeatMode::RepeatToggle)],
        actions: vec![],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    tokio::time::sleep(Duration::from_millis(350)).await;
    let running = f.input.events().len();
    assert!(running >= 4, "expected repeats, got {} events", running);

    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;

    // Second press stops the repeat
    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    let stopped = f.input.events().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.input.events().len(), stopped);
}

#[tokio::test(start_paused = true)]
async fn test_while_held_repeats_only_while_held() {
    let f = fixture();
    f.handler.set_bindings(Bindings {
        macros: vec![uinput_macro("hold", vec![Key::G1], RepeatMode::RepeatWhileHeld)],
        actions: vec![],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    // Initial tap only, no repeat before HELD
    assert_eq!(f.input.events(), vec![(KEY_A, 1), (KEY_A, 0)]);

    tokio::time::sleep(DEFAULT_HOLD_DURATION + Duration::from_millis(350)).await;
    let while_held = f.input.events().len();
    assert!(while_held > 2, "expected repeats after hold, got {}", while_held);

    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;
    let at_release = f.input.events().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.input.events().len(), at_release);
}

#[tokio::test(start_paused = true)]
async fn test_macro_consumes_key_before_action() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.set_bindings(Bindings {
        macros: vec![uinput_macro("tap", vec![Key::G1], RepeatMode::NoRepeat)],
        actions: vec![ActionBinding::new(Action::Select, vec![Key::G1], KeyEdge::Down)],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    assert_eq!(f.input.events(), vec![(KEY_A, 1), (KEY_A, 0)]);
    assert!(listener.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_action_match_consumes_until_release() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.set_bindings(Bindings {
        macros: vec![],
        actions: vec![
            ActionBinding::new(Action::Menu, vec![Key::G1], KeyEdge::Down),
            ActionBinding::new(Action::Select, vec![Key::G1], KeyEdge::Held),
        ],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    tokio::time::sleep(DEFAULT_HOLD_DURATION + Duration::from_millis(100)).await;

    // The DOWN match put the key out of play until released
    assert_eq!(listener.actions(), vec![Action::Menu]);
}

#[tokio::test(start_paused = true)]
async fn test_held_macro_defeats_up_macro() {
    let mut f = fixture();
    f.handler.set_bindings(Bindings {
        macros: vec![
            script_macro("on-held", vec![Key::G1], KeyEdge::Held),
            script_macro("on-up", vec![Key::G1], KeyEdge::Up),
        ],
        actions: vec![],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    tokio::time::sleep(DEFAULT_HOLD_DURATION + Duration::from_millis(100)).await;
    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;

    let fired = f.macro_rx.try_recv().unwrap();
    assert_eq!(fired.name, "on-held");
    assert!(f.macro_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_up_macro_fires_on_release() {
    let mut f = fixture();
    f.handler.set_bindings(Bindings {
        macros: vec![script_macro("on-up", vec![Key::G1, Key::G2], KeyEdge::Up)],
        actions: vec![],
    });

    send(&f.tx, vec![Key::G1, Key::G2], KeyEdge::Down);
    settle().await;
    assert!(f.macro_rx.try_recv().is_err());

    send(&f.tx, vec![Key::G1, Key::G2], KeyEdge::Up);
    settle().await;
    assert_eq!(f.macro_rx.try_recv().unwrap().name, "on-up");
}

#[tokio::test(start_paused = true)]
async fn test_state_cleared_once_all_keys_up() {
    let f = fixture();

    send(&f.tx, vec![Key::G1, Key::G2], KeyEdge::Down);
    settle().await;
    assert_eq!(f.handler.key_states().len(), 2);

    send(&f.tx, vec![Key::G1], KeyEdge::Up);
    settle().await;
    // G2 still down, map survives
    assert_eq!(f.handler.key_states().len(), 2);

    send(&f.tx, vec![Key::G2], KeyEdge::Up);
    settle().await;
    assert!(f.handler.key_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_redraw_runs_for_every_batch() {
    let f = fixture();

    send(&f.tx, vec![Key::G5], KeyEdge::Down);
    send(&f.tx, vec![Key::G5], KeyEdge::Up);
    settle().await;
    assert_eq!(f.redraws.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_raw_handler_swallows_batch() {
    let f = fixture();
    let listener = Recorder::new(true);
    f.handler.add_action_listener(listener.clone());
    f.handler.add_raw_handler(Arc::new(Swallower));
    f.handler.set_bindings(Bindings {
        macros: vec![],
        actions: vec![ActionBinding::new(Action::Select, vec![Key::G1], KeyEdge::Down)],
    });

    send(&f.tx, vec![Key::G1], KeyEdge::Down);
    settle().await;
    assert!(listener.actions().is_empty());
    // Redraw still happens
    assert_eq!(f.redraws.load(Ordering::SeqCst), 1);
}
