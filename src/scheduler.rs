//! Cancellable timers
//!
//! Every delayed action in the daemon (hold timers, priority reverts, blink and
//! fade steps, macro repeat, auto-release) goes through [`schedule`], which
//! returns a [`TimerHandle`]. Owners keep the handle and cancel it before
//! re-arming, so a stale callback can never fire against state that has since
//! been superseded.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to a pending timer. Dropping the handle does NOT cancel the timer;
/// cancellation is always an explicit decision by the owner.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. Safe to call after the timer has fired.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the timer has already fired (or been cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `task` after `delay`. Must be called from within a tokio runtime.
pub fn schedule<F>(delay: Duration, task: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    });
    TimerHandle { handle }
}

/// Spawn a repeating task immediately. The closure future runs to completion;
/// loops should check their own stop condition. Returned handle aborts the loop.
pub fn spawn<F>(task: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    TimerHandle {
        handle: tokio::spawn(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let timer = schedule(Duration::from_millis(100), async move {
            fired_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let timer = schedule(Duration::from_millis(100), async move {
            fired_clone.store(true, Ordering::SeqCst);
        });

        timer.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
