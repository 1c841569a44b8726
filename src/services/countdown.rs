//! Restartable per-second countdown driving question timeouts.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, trace};

const TICK: Duration = Duration::from_secs(1);

/// Countdown ticking once per second on the tokio runtime.
///
/// `on_expire` fires exactly once when the remaining time reaches zero. A run
/// that was stopped or reset never fires, even if one of its ticks was
/// already scheduled.
pub struct CountdownTimer {
    duration: u32,
    remaining: Arc<watch::Sender<u32>>,
    task: Option<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownTimer {
    /// Idle timer at zero.
    pub fn new() -> Self {
        let (remaining, _receiver) = watch::channel(0);
        Self {
            duration: 0,
            remaining: Arc::new(remaining),
            task: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start counting down from `seconds`, replacing any run in progress.
    pub fn start<F>(&mut self, seconds: u32, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        self.duration = seconds;
        self.remaining.send_replace(seconds);

        let run = self.generation.load(Ordering::SeqCst);
        let generation = self.generation.clone();
        let remaining = self.remaining.clone();
        let first_tick = Instant::now() + TICK;

        self.task = Some(tokio::spawn(async move {
            if seconds > 0 {
                let mut ticks = interval_at(first_tick, TICK);
                loop {
                    ticks.tick().await;
                    if generation.load(Ordering::SeqCst) != run {
                        return;
                    }
                    let mut left = 0;
                    remaining.send_modify(|value| {
                        *value = value.saturating_sub(1);
                        left = *value;
                    });
                    trace!(left, "countdown tick");
                    if left == 0 {
                        break;
                    }
                }
            }

            if generation.load(Ordering::SeqCst) == run {
                debug!(seconds, "countdown expired");
                on_expire();
            }
        }));
    }

    /// Halt the countdown without firing.
    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Stop, then reinitialise the remaining time to `seconds` or the last duration.
    pub fn reset(&mut self, seconds: Option<u32>) {
        self.stop();
        if let Some(seconds) = seconds {
            self.duration = seconds;
        }
        self.remaining.send_replace(self.duration);
    }

    /// Seconds left.
    pub fn remaining(&self) -> u32 {
        *self.remaining.borrow()
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Receiver observing the remaining seconds.
    pub fn watch(&self) -> watch::Receiver<u32> {
        self.remaining.subscribe()
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::time::sleep;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = fired.clone();
        (fired, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_zero() {
        let mut timer = CountdownTimer::new();
        let (fired, on_expire) = counter();
        timer.start(3, on_expire);
        assert_eq!(timer.remaining(), 3);

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(timer.remaining(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(timer.remaining(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_never_fires() {
        let mut timer = CountdownTimer::new();
        let (fired, on_expire) = counter();
        timer.start(2, on_expire);

        sleep(Duration::from_millis(1500)).await;
        timer.stop();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(timer.remaining(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_duration_or_override() {
        let mut timer = CountdownTimer::new();
        let (fired, on_expire) = counter();
        timer.start(5, on_expire);
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(timer.remaining(), 3);

        timer.reset(None);
        assert_eq!(timer.remaining(), 5);
        assert!(!timer.is_running());

        timer.reset(Some(8));
        assert_eq!(timer.remaining(), 8);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_previous_run() {
        let mut timer = CountdownTimer::new();
        let (first, on_first) = counter();
        let (second, on_second) = counter();

        timer.start(2, on_first);
        sleep(Duration::from_millis(1500)).await;
        timer.start(2, on_second);
        sleep(Duration::from_secs(5)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_every_tick() {
        let mut timer = CountdownTimer::new();
        let (_fired, on_expire) = counter();
        timer.start(2, on_expire);
        let mut remaining = timer.watch();
        assert_eq!(*remaining.borrow(), 2);

        remaining.changed().await.unwrap();
        assert_eq!(*remaining.borrow_and_update(), 1);
        remaining.changed().await.unwrap();
        assert_eq!(*remaining.borrow_and_update(), 0);
    }
}
