//! Cooperative shutdown flag shared by workers, the reaper, and waiters.
//!
//! Long sleeps are chopped into short slices so every loop notices a
//! trigger within a quarter second, which is what lets `DecisionQueue::wait`
//! and the worker cool-downs return promptly on cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on trigger.
    ///
    /// Returns `true` when shutdown was triggered (before or during the
    /// sleep), `false` when the full duration elapsed quietly.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_triggered() {
                return true;
            }
            let slice = SLICE.min(remaining);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        self.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_runs_to_completion_when_untriggered() {
        let flag = ShutdownFlag::new();
        let started = Instant::now();
        let cancelled = flag.sleep(Duration::from_millis(300)).await;
        assert!(!cancelled);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_sleep_returns_early_on_trigger() {
        let flag = ShutdownFlag::new();
        let flag2 = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag2.trigger();
        });

        let started = Instant::now();
        let cancelled = flag.sleep(Duration::from_secs(30)).await;
        assert!(cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_triggered_sleep_is_immediate() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        let started = Instant::now();
        assert!(flag.sleep(Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
