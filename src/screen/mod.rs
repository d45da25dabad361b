//! Page scheduler
//!
//! The screen owns an ordered collection of pages and decides which one is on
//! the LCD: the page with the highest `(priority, recency)` key among those
//! above `Invisible`. Temporary promotions (`revert_after`), timed deletions
//! (`delete_after`) and popup exclusivity are all resolved through that one
//! comparison.
//!
//! Lifecycle callbacks run while the page model is locked and must not call
//! back into the screen; schedule follow-up work instead.

use crate::driver::{hints, mkey_lights, ControlBank, ControlValue, Driver, DriverError};
use crate::framebuffer::Framebuffer;
use crate::scheduler::{self, TimerHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

mod page;

pub use page::{Page, Priority};

/// Applies a final transform to the assembled frame (fade-out, screenshots).
pub type GlobalPainterFn = Arc<dyn Fn(&mut Framebuffer) + Send + Sync>;

/// Blends the outgoing frame into the incoming one on a visibility change.
pub type TransitionFn = Arc<dyn Fn(&Framebuffer, &mut Framebuffer) + Send + Sync>;

/// Notifications about page model changes.
pub trait ScreenChangeListener: Send + Sync {
    fn page_added(&self, _page_id: &str) {}
    fn page_deleted(&self, _page_id: &str) {}
    fn page_changed(&self, _page_id: &str) {}
    fn memory_bank_changed(&self, _bank: u8) {}
}

#[derive(Default)]
struct PageModel {
    pages: Vec<Page>,
    visible: Option<String>,
    /// Pending priority reverts: original pre-chain priority + the timer.
    reverting: HashMap<String, (Priority, TimerHandle)>,
    /// Pending timed deletions.
    deleting: HashMap<String, TimerHandle>,
    painter: Option<GlobalPainterFn>,
    transition: Option<TransitionFn>,
    /// Last frame sent to the driver, kept for transitions.
    old_frame: Option<Framebuffer>,
}

/// The scheduler container: pages, visibility, timers, memory bank.
pub struct Screen {
    driver: Arc<dyn Driver>,
    controls: ControlBank,
    model: RwLock<PageModel>,
    seq: AtomicU64,
    memory_bank: AtomicU8,
    listeners: Mutex<Vec<Arc<dyn ScreenChangeListener>>>,
}

impl Screen {
    pub fn new(driver: Arc<dyn Driver>, controls: ControlBank) -> Arc<Self> {
        Arc::new(Self {
            driver,
            controls,
            model: RwLock::new(PageModel::default()),
            seq: AtomicU64::new(1),
            memory_bank: AtomicU8::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn add_listener(&self, listener: Arc<dyn ScreenChangeListener>) {
        self.listeners.lock().push(listener);
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a page and redraw. A new page clears any current popup's elevated
    /// priority, and a second exclusive page is downgraded to high.
    pub async fn add_page(self: &Arc<Self>, mut new_page: Page) -> Result<(), DriverError> {
        if self.driver.bpp() == 0 {
            return Err(DriverError::NoOutput);
        }
        let id = new_page.id.clone();
        {
            let mut model = self.model.write().await;
            info!("Adding page {} at {:?}", id, new_page.priority);
            clear_popup(&mut model);
            if new_page.priority == Priority::Exclusive
                && model.pages.iter().any(|p| p.priority == Priority::Exclusive)
            {
                warn!("Another page is already exclusive. Lowering {} to high", id);
                new_page.priority = Priority::High;
            }
            new_page.recency = self.next_seq();
            model.pages.push(new_page);
        }
        for l in self.listeners.lock().clone() {
            l.page_added(&id);
        }
        self.redraw().await;
        Ok(())
    }

    pub async fn page(&self, id: &str) -> Option<Page> {
        self.model
            .read()
            .await
            .pages
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// All pages, highest sort key first.
    pub async fn pages(&self) -> Vec<Page> {
        let model = self.model.read().await;
        let mut pages = model.pages.clone();
        pages.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        pages
    }

    pub async fn visible_page(&self) -> Option<Page> {
        let model = self.model.read().await;
        let id = model.visible.clone()?;
        model.pages.iter().find(|p| p.id == id).cloned()
    }

    /// Change a page's priority. With `revert_after`, the priority reverts
    /// automatically; re-arming before the timer fires preserves the original
    /// pre-chain priority, so a burst of temporary promotions never strands
    /// the page below its true baseline. With `delete_after`, the page is
    /// deleted once the delay expires.
    pub async fn set_priority(
        self: &Arc<Self>,
        id: &str,
        priority: Priority,
        revert_after: Option<Duration>,
        delete_after: Option<Duration>,
    ) {
        {
            let mut model = self.model.write().await;
            let seq = self.next_seq();
            let Some(target) = model.pages.iter_mut().find(|p| p.id == id) else {
                return;
            };
            let old_priority = target.priority;
            target.priority = priority;
            target.recency = seq;
            debug!("Page {} now {:?} (was {:?})", id, priority, old_priority);

            if let Some(delay) = revert_after {
                let restore = match model.reverting.remove(id) {
                    Some((original, timer)) => {
                        timer.cancel();
                        original
                    }
                    None => old_priority,
                };
                let screen = self.clone();
                let page_id = id.to_string();
                let timer = scheduler::schedule(delay, async move {
                    screen.on_revert_timer(&page_id).await;
                });
                model.reverting.insert(id.to_string(), (restore, timer));
            }
            if let Some(delay) = delete_after {
                arm_delete_timer(self, &mut model, id, delay);
            }
        }
        self.redraw().await;
    }

    /// Delete a page after a delay; re-arming cancels the previous timer.
    pub async fn delete_after(self: &Arc<Self>, id: &str, delay: Duration) {
        let mut model = self.model.write().await;
        if model.pages.iter().any(|p| p.id == id) {
            arm_delete_timer(self, &mut model, id, delay);
        }
    }

    /// Whether the page has a pending revert or delete timer.
    pub async fn is_on_timer(&self, id: &str) -> bool {
        let model = self.model.read().await;
        model.reverting.contains_key(id) || model.deleting.contains_key(id)
    }

    /// Remove a page: cancels its timers, fires hidden (if it was visible)
    /// and deleted callbacks, and shows the next page.
    pub async fn del_page(self: &Arc<Self>, id: &str) {
        let removed = {
            let mut model = self.model.write().await;
            if let Some((_, timer)) = model.reverting.remove(id) {
                timer.cancel();
            }
            if let Some(timer) = model.deleting.remove(id) {
                timer.cancel();
            }
            let Some(idx) = model.pages.iter().position(|p| p.id == id) else {
                return;
            };
            info!("Deleting page {}", id);
            let page = model.pages.remove(idx);
            let was_visible = model.visible.as_deref() == Some(id);
            if was_visible {
                model.visible = None;
                if let Some(f) = &page.on_hidden {
                    f();
                }
            }
            if let Some(f) = &page.on_deleted {
                f();
            }
            page
        };
        for l in self.listeners.lock().clone() {
            l.page_deleted(&removed.id);
        }
        self.redraw().await;
    }

    /// Raise a page: low becomes popup, anything else goes to the top of its
    /// own tier.
    pub async fn raise_page(self: &Arc<Self>, id: &str) {
        let low = {
            let model = self.model.read().await;
            match model.pages.iter().find(|p| p.id == id) {
                Some(p) => p.priority == Priority::Low,
                None => return,
            }
        };
        if low {
            self.set_priority(id, Priority::Popup, None, None).await;
        } else {
            {
                let mut model = self.model.write().await;
                let seq = self.next_seq();
                if let Some(p) = model.pages.iter_mut().find(|p| p.id == id) {
                    p.recency = seq;
                }
            }
            self.redraw().await;
        }
    }

    /// Rotate next/previous among the normal-priority pages. Timed reverts
    /// and deletions are flushed first so navigation lands on settled state.
    pub async fn cycle(self: &Arc<Self>, n: i32) {
        self.flush_timers().await;
        {
            let mut model = self.model.write().await;
            rotate_normal_recency(&mut model, n);
        }
        self.redraw().await;
    }

    /// Cycle directly to a page. A low page pops up; an invisible page gets a
    /// one-off draw (staying visible is its own problem); otherwise the
    /// normal tier is rotated so the page lands on top.
    pub async fn cycle_to(self: &Arc<Self>, id: &str) {
        let priority = {
            let model = self.model.read().await;
            match model.pages.iter().find(|p| p.id == id) {
                Some(p) => p.priority,
                None => return,
            }
        };
        match priority {
            Priority::Low => {
                self.set_priority(id, Priority::Popup, None, None).await;
            }
            Priority::Invisible => {
                {
                    let mut model = self.model.write().await;
                    clear_popup(&mut model);
                }
                self.draw_page_once(id).await;
            }
            _ => {
                self.flush_timers().await;
                {
                    let mut model = self.model.write().await;
                    clear_popup(&mut model);
                    let normal = sorted_normal_indices(&model);
                    if let Some(diff) = normal
                        .iter()
                        .position(|&i| model.pages[i].id == id)
                    {
                        rotate_normal_recency(&mut model, diff as i32);
                    }
                }
                self.redraw().await;
            }
        }
    }

    /// Called by an auto-cycle timer: advances unless something important
    /// (high or above) is on screen.
    pub async fn auto_cycle_tick(self: &Arc<Self>) {
        let advance = match self.visible_page().await {
            Some(p) => p.priority < Priority::High,
            None => false,
        };
        if advance {
            self.cycle(1).await;
        }
    }

    pub async fn set_transition(&self, f: impl Fn(&Framebuffer, &mut Framebuffer) + Send + Sync + 'static) {
        self.model.write().await.transition = Some(Arc::new(f));
    }

    /// Install or clear the global painter slot applied to every frame.
    pub async fn set_painter(&self, f: Option<GlobalPainterFn>) {
        self.model.write().await.painter = f;
    }

    /// Recompute the visible page and paint it. On a visibility change the
    /// old page's hidden and the new page's shown callbacks fire exactly
    /// once, and the transition function (if any) blends the two frames.
    pub async fn redraw(self: &Arc<Self>) {
        if !self.driver.is_connected() || self.driver.bpp() == 0 {
            return;
        }
        let changed_to = {
            let mut model = self.model.write().await;
            let next = model
                .pages
                .iter()
                .filter(|p| p.priority > Priority::Invisible)
                .max_by_key(|p| p.sort_key())
                .cloned();
            let Some(next) = next else {
                // Nothing to show, blank the LCD
                if let Some(old_id) = model.visible.take() {
                    if let Some(old) = model.pages.iter().find(|p| p.id == old_id) {
                        if let Some(f) = &old.on_hidden {
                            f();
                        }
                    }
                }
                let (w, h) = self.driver.lcd_size();
                let frame = Framebuffer::new(w, h);
                model.old_frame = Some(frame.clone());
                if let Err(e) = self.driver.paint(&frame).await {
                    warn!("Failed to blank the screen: {}", e);
                }
                return;
            };

            let changed = model.visible.as_deref() != Some(next.id.as_str());
            let old_frame = if changed {
                debug!("Visible page is now {}", next.id);
                if let Some(old_id) = model.visible.replace(next.id.clone()) {
                    if let Some(old) = model.pages.iter().find(|p| p.id == old_id) {
                        if let Some(f) = &old.on_hidden {
                            f();
                        }
                    }
                }
                if let Some(f) = &next.on_shown {
                    f();
                }
                model.old_frame.clone()
            } else {
                None
            };

            let (w, h) = self.driver.lcd_size();
            let mut frame = Framebuffer::new(w, h);
            if let Some(painter) = &next.painter {
                painter(&mut frame);
            }
            if let (Some(transition), Some(old)) = (&model.transition, &old_frame) {
                transition(old, &mut frame);
            }
            if let Some(global) = &model.painter {
                global(&mut frame);
            }
            model.old_frame = Some(frame.clone());
            if let Err(e) = self.driver.paint(&frame).await {
                warn!("Failed to paint page {}: {}", next.id, e);
            }
            changed.then(|| next.id)
        };
        if let Some(id) = changed_to {
            for l in self.listeners.lock().clone() {
                l.page_changed(&id);
            }
        }
    }

    /// Fire-and-forget redraw for sync contexts (key dispatch).
    pub fn request_redraw(self: &Arc<Self>) {
        let screen = self.clone();
        tokio::spawn(async move {
            screen.redraw().await;
        });
    }

    pub fn memory_bank(&self) -> u8 {
        self.memory_bank.load(Ordering::SeqCst)
    }

    /// Switch the active memory bank (1-3) and light the matching M-key LED.
    pub async fn set_memory_bank(&self, bank: u8) {
        let bank = bank.clamp(1, 3);
        self.memory_bank.store(bank, Ordering::SeqCst);
        if let Some(control) = self.controls.control_for_hint(hints::MKEYS) {
            let mask = mkey_lights::mask_for_bank(bank);
            if let Err(e) = self.controls.set(&control.id, ControlValue::Scalar(mask)) {
                warn!("Failed to update memory bank lights: {}", e);
            }
        }
        for l in self.listeners.lock().clone() {
            l.memory_bank_changed(bank);
        }
    }

    /// Settle all pending revert and delete timers immediately.
    async fn flush_timers(self: &Arc<Self>) {
        let (reverts, deletes) = {
            let mut model = self.model.write().await;
            let reverts: Vec<(String, Priority)> = model
                .reverting
                .drain()
                .map(|(id, (pri, timer))| {
                    timer.cancel();
                    (id, pri)
                })
                .collect();
            let deletes: Vec<String> = model
                .deleting
                .drain()
                .map(|(id, timer)| {
                    timer.cancel();
                    id
                })
                .collect();
            (reverts, deletes)
        };
        for (id, priority) in reverts {
            self.set_priority(&id, priority, None, None).await;
        }
        for id in deletes {
            self.del_page(&id).await;
        }
    }

    /// Restores the pre-chain priority inline rather than through
    /// `set_priority`, which would make the revert future recursive.
    async fn on_revert_timer(self: &Arc<Self>, id: &str) {
        let restored = {
            let mut model = self.model.write().await;
            let Some((priority, _)) = model.reverting.remove(id) else {
                return;
            };
            let seq = self.next_seq();
            match model.pages.iter_mut().find(|p| p.id == id) {
                Some(page) => {
                    debug!("Page {} reverts to {:?}", id, priority);
                    page.priority = priority;
                    page.recency = seq;
                    true
                }
                None => false,
            }
        };
        if restored {
            self.redraw().await;
        }
    }

    async fn on_delete_timer(self: &Arc<Self>, id: &str) {
        {
            let mut model = self.model.write().await;
            model.deleting.remove(id);
        }
        self.del_page(id).await;
    }

    /// Paint a page directly without making it the scheduled visible page.
    async fn draw_page_once(&self, id: &str) {
        if !self.driver.is_connected() || self.driver.bpp() == 0 {
            return;
        }
        let model = self.model.read().await;
        let Some(target) = model.pages.iter().find(|p| p.id == id) else {
            return;
        };
        let (w, h) = self.driver.lcd_size();
        let mut frame = Framebuffer::new(w, h);
        if let Some(painter) = &target.painter {
            painter(&mut frame);
        }
        if let Err(e) = self.driver.paint(&frame).await {
            warn!("Failed to paint page {}: {}", id, e);
        }
    }
}

/// Downgrade the current popup (if any) to low.
fn clear_popup(model: &mut PageModel) {
    if let Some(popup) = model.pages.iter_mut().find(|p| p.priority == Priority::Popup) {
        debug!("Clearing popup {}", popup.id);
        popup.priority = Priority::Low;
    }
}

fn arm_delete_timer(screen: &Arc<Screen>, model: &mut PageModel, id: &str, delay: Duration) {
    if let Some(timer) = model.deleting.remove(id) {
        timer.cancel();
    }
    let screen = screen.clone();
    let page_id = id.to_string();
    let timer = scheduler::schedule(delay, async move {
        screen.on_delete_timer(&page_id).await;
    });
    model.deleting.insert(id.to_string(), timer);
}

/// Indices of normal-priority pages, highest sort key first.
fn sorted_normal_indices(model: &PageModel) -> Vec<usize> {
    let mut indices: Vec<usize> = model
        .pages
        .iter()
        .enumerate()
        .filter(|(_, p)| p.priority == Priority::Normal)
        .map(|(i, _)| i)
        .collect();
    indices.sort_by(|&a, &b| model.pages[b].sort_key().cmp(&model.pages[a].sort_key()));
    indices
}

/// Ring-shift the recency stamps of the normal-priority pages by `n`
/// positions; navigation is a pure reordering, never a priority change.
fn rotate_normal_recency(model: &mut PageModel, n: i32) {
    let indices = sorted_normal_indices(model);
    let len = indices.len();
    if len < 2 || n == 0 {
        return;
    }
    let mut stamps: Vec<u64> = indices.iter().map(|&i| model.pages[i].recency).collect();
    let k = n.rem_euclid(len as i32) as usize;
    stamps.rotate_right(k);
    for (&i, stamp) in indices.iter().zip(stamps) {
        model.pages[i].recency = stamp;
    }
}
