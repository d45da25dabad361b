//! Pages and their priorities

use crate::framebuffer::Framebuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Priority tiers, lowest to highest. At most one `Exclusive` page may exist
/// at a time, and only one `Popup` dominates at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Never displayed; the page only paints thumbnails/panels.
    Invisible,
    /// Visible only when raised.
    Low,
    /// The regular cycling tier.
    Normal,
    /// Above the cycling tier; temporary "flash" promotions land here.
    High,
    /// Owns the screen outright (splash, full-screen takeover).
    Exclusive,
    /// Transient popup, above everything.
    Popup,
}

/// Paints page content into a framebuffer.
pub type PainterFn = Arc<dyn Fn(&mut Framebuffer) + Send + Sync>;

/// Page lifecycle notification (shown, hidden, deleted).
pub type LifecycleFn = Arc<dyn Fn() + Send + Sync>;

/// A page of LCD content. Ordering among pages is by `(priority, recency)`;
/// the recency stamp is a monotonic sequence number bumped whenever the page
/// is touched, so ties within a tier go to the most recently used page.
#[derive(Clone)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub(crate) recency: u64,
    pub(crate) painter: Option<PainterFn>,
    pub(crate) thumbnail_painter: Option<PainterFn>,
    pub(crate) panel_painter: Option<PainterFn>,
    pub(crate) on_shown: Option<LifecycleFn>,
    pub(crate) on_hidden: Option<LifecycleFn>,
    pub(crate) on_deleted: Option<LifecycleFn>,
}

impl Page {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: Priority::Normal,
            recency: 0,
            painter: None,
            thumbnail_painter: None,
            panel_painter: None,
            on_shown: None,
            on_hidden: None,
            on_deleted: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_painter(mut self, painter: impl Fn(&mut Framebuffer) + Send + Sync + 'static) -> Self {
        self.painter = Some(Arc::new(painter));
        self
    }

    pub fn with_thumbnail_painter(
        mut self,
        painter: impl Fn(&mut Framebuffer) + Send + Sync + 'static,
    ) -> Self {
        self.thumbnail_painter = Some(Arc::new(painter));
        self
    }

    pub fn with_panel_painter(
        mut self,
        painter: impl Fn(&mut Framebuffer) + Send + Sync + 'static,
    ) -> Self {
        self.panel_painter = Some(Arc::new(painter));
        self
    }

    pub fn with_on_shown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shown = Some(Arc::new(f));
        self
    }

    pub fn with_on_hidden(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_hidden = Some(Arc::new(f));
        self
    }

    pub fn with_on_deleted(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_deleted = Some(Arc::new(f));
        self
    }

    /// Sort key: priority tier first, then most recently touched.
    pub(crate) fn sort_key(&self) -> (Priority, u64) {
        (self.priority, self.recency)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("recency", &self.recency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Popup > Priority::Exclusive);
        assert!(Priority::Exclusive > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Invisible);
    }

    #[test]
    fn test_sort_key_breaks_ties_by_recency() {
        let mut a = Page::new("a", "A");
        let mut b = Page::new("b", "B");
        a.recency = 1;
        b.recency = 2;
        assert!(b.sort_key() > a.sort_key());

        a.priority = Priority::High;
        assert!(a.sort_key() > b.sort_key());
    }
}
