//! Single-shot cancellable timer on top of Tokio tasks.
//!
//! Runs on `tokio::time`, so a paused test clock drives it deterministically.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub(crate) struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Run `fire` once after `delay` on `runtime`, replacing any pending schedule.
    pub(crate) fn schedule<F>(&mut self, runtime: &Handle, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        }));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            // No-op for a timer that already fired
            handle.abort();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = Timer::default();

        let counter = fired.clone();
        timer.schedule(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_and_cancel_stops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = Timer::default();

        for _ in 0..3 {
            let counter = fired.clone();
            timer.schedule(&Handle::current(), Duration::from_millis(50), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = fired.clone();
        timer.schedule(&Handle::current(), Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        assert!(!timer.is_pending());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
