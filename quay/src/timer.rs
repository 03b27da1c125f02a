//! Fire-once cancellable deadline timer.

use std::time::Duration;

use tokio::task::JoinHandle;

/// A one-shot timer that runs a future when the deadline passes.
///
/// Cancelling (or dropping) the timer before it fires aborts the callback.
/// Connector state transitions pair every timer with a state epoch so that
/// a firing that lost the race against a transition is a no-op.
#[derive(Debug)]
pub struct DeadlineTimer {
    handle: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    /// Schedules `on_fire` to run once `after` has elapsed.
    pub fn schedule<F>(after: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Cancels the timer; a no-op if it already fired.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Lets the timer go without aborting it.
    ///
    /// The firing callback uses this to retire its own timer: aborting from
    /// inside the callback would cancel the callback itself at its next
    /// await point.
    pub fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn fires_once_after_deadline() {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&fired);
        let _timer = DeadlineTimer::schedule(Duration::from_millis(20), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&fired);
        let timer = DeadlineTimer::schedule(Duration::from_millis(20), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&fired);
        drop(DeadlineTimer::schedule(Duration::from_millis(20), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disarm_lets_the_callback_run() {
        let fired = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&fired);
        let timer = DeadlineTimer::schedule(Duration::from_millis(20), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        timer.disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
