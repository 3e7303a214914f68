use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::types::Timestamp;

/// Time source injected into every component that computes deadlines or
/// stamps documents. Tests substitute [`ManualClock`].
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time, epoch milliseconds.
    fn now_ms(&self) -> Timestamp;

    /// Suspend for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by the tokio timer.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually-advanced clock for tests. `sleep` advances the clock instead of
/// suspending, so bounded polling loops run to completion instantly.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_ms(duration.as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_sleep_advances_time() {
        let clock = ManualClock::at(1_000);
        clock.sleep(Duration::from_secs(60)).await;
        assert_eq!(clock.now_ms(), 61_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 61_500);
    }
}
