//! Cooperative scheduling primitives for the capture and predict loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared on/off switch that keeps a repeating loop alive while raised
///
/// Loops check the flag once per iteration, so lowering it stops the loop
/// at the next iteration boundary rather than mid-step.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    raised: Arc<AtomicBool>,
}

impl CancellationFlag {
    /// Create a lowered flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a flag that is already raised
    pub fn raised() -> Self {
        let flag = Self::new();
        flag.raise();
        flag
    }

    /// Keep loops running
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Stop loops at their next check
    pub fn lower(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Whether loops should keep running
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Suspend until the next frame
///
/// A zero interval yields to the scheduler without sleeping.
pub async fn next_frame(interval: Duration) {
    if interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_clones_share_state() {
        let flag = CancellationFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_raised());

        handle.raise();
        assert!(flag.is_raised());
        flag.lower();
        assert!(!handle.is_raised());
        assert!(CancellationFlag::raised().is_raised());
    }

    #[tokio::test]
    async fn test_spawned_task_runs_during_frame_ticks() {
        let flag = CancellationFlag::raised();
        let handle = flag.clone();
        let stopper = tokio::spawn(async move { handle.lower() });

        let mut ticks = 0;
        while flag.is_raised() {
            next_frame(Duration::ZERO).await;
            ticks += 1;
            assert!(ticks < 1000, "loop never observed the lowered flag");
        }
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_interval_sleeps() {
        let start = std::time::Instant::now();
        next_frame(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
