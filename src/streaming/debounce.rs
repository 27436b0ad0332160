//! Trailing-edge debounce timer.
//!
//! Every `call` pushes the deadline one window into the future and replaces the
//! target; the target of the last call runs once the window passes quietly.
//! Driven by `tokio::time`, so paused-clock tests need no wall-clock waits.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Boxed future run when the debounce window elapses
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Target = Box<dyn FnOnce() -> BoxFuture + Send + 'static>;

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    target: Option<Target>,
    timer_running: bool,
}

/// Restartable debounce timer
pub struct Debouncer {
    window: Duration,
    state: Arc<Mutex<TimerState>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Restart the window with `target` as the action to fire.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call<F>(&self, target: F)
    where
        F: FnOnce() -> BoxFuture + Send + 'static,
    {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.deadline = Some(Instant::now() + self.window);
        state.target = Some(Box::new(target));

        if !state.timer_running {
            state.timer_running = true;
            tokio::spawn(run_timer(self.state.clone()));
        }
    }

    /// Drop the pending target, if any
    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.deadline = None;
            state.target = None;
        }
    }

    /// A target is waiting for its window to pass
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.deadline.is_some())
            .unwrap_or(false)
    }
}

async fn run_timer(state: Arc<Mutex<TimerState>>) {
    let target = loop {
        let deadline = match state.lock() {
            Ok(mut guard) => match guard.deadline {
                Some(deadline) => deadline,
                None => {
                    guard.timer_running = false;
                    return;
                }
            },
            Err(_) => return,
        };

        sleep_until(deadline).await;

        let Ok(mut guard) = state.lock() else {
            return;
        };
        if guard.deadline == Some(deadline) {
            guard.deadline = None;
            guard.timer_running = false;
            break guard.target.take();
        }
        // Deadline moved or was cancelled: go around again
    };

    if let Some(target) = target {
        target().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_target(counter: &Arc<AtomicUsize>, value: usize) -> impl FnOnce() -> BoxFuture + Send + 'static {
        let counter = counter.clone();
        move || -> BoxFuture {
            Box::pin(async move {
                counter.fetch_add(value, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_quiet_window() {
        let debouncer = Debouncer::new(Duration::from_millis(1000));
        let counter = Arc::new(AtomicUsize::new(0));

        debouncer.call(counting_target(&counter, 1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.call(counting_target(&counter, 10));
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.call(counting_target(&counter, 100));
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        // Only the last target runs
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));

        debouncer.call(counting_target(&counter, 1));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Restartable after cancel
        debouncer.call(counting_target(&counter, 1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
