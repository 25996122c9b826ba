//! Cancellable scheduled tasks
//!
//! Timers deliver their ticks as messages into the orchestrator's inbox
//! instead of running callbacks, so every tick is handled in queue order.
//! Dropping a handle aborts the task.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Sends a message every `period`, first one period after creation.
pub struct RepeatingTask {
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn every<T, F>(period: Duration, sink: mpsc::UnboundedSender<T>, message: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sink.send(message()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn cancel(self) {}

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sends one message after `delay`, unless cancelled first.
pub struct DelayedTask {
    handle: JoinHandle<()>,
}

impl DelayedTask {
    pub fn after<T>(delay: Duration, sink: mpsc::UnboundedSender<T>, message: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(message);
        });
        Self { handle }
    }

    pub fn cancel(self) {}

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_repeating_task_ticks_after_each_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let task = RepeatingTask::every(Duration::from_secs(5), tx, || "tick");

        for n in 1..=3u64 {
            assert_eq!(rx.recv().await, Some("tick"));
            assert_eq!(start.elapsed(), Duration::from_secs(5 * n));
        }
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_repeating_task_stops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = RepeatingTask::every(Duration::from_secs(1), tx, || 1u8);
        assert_eq!(rx.recv().await, Some(1));

        task.cancel();
        // The sender lived inside the aborted task, so the channel closes.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let _task = DelayedTask::after(Duration::from_secs(30), tx, "timeout");

        assert_eq!(rx.recv().await, Some("timeout"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_delayed_task_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = DelayedTask::after(Duration::from_secs(30), tx, "timeout");
        drop(task);
        assert_eq!(rx.recv().await, None);
    }
}
