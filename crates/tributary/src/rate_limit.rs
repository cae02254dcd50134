//! Client-side throttling of outbound API calls.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;

/// Default number of requests allowed to start per second.
pub const DEFAULT_RPS: u32 = 80;

/// Shortest refill interval the limiter will schedule.
const MIN_REFILL_INTERVAL: Duration = Duration::from_micros(1);

/// A leaky-bucket limiter on the rate at which calls may start.
///
/// The bucket holds at most `count` slots and starts empty. A background task
/// adds one slot every `window / count`, so a caller issuing calls faster than
/// that simply queues in [`wait`](Self::wait). The refill task stops once the
/// last clone of the limiter is dropped.
///
/// Must be created inside a tokio runtime.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use tributary::rate_limit::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::new(50, Duration::from_secs(1));
///
/// // Before each API call:
/// limiter.wait().await;
/// client.fetch_list(&request).await?;
/// ```
#[derive(Clone, Debug)]
pub struct ApiRateLimiter {
    slots: Arc<Semaphore>,
    interval: Duration,
}

impl ApiRateLimiter {
    /// Allow at most `count` call starts per `window`. A count of zero is
    /// treated as one.
    pub fn new(count: u32, window: Duration) -> Self {
        let capacity = count.max(1);
        let interval = (window / capacity).max(MIN_REFILL_INTERVAL);
        let slots = Arc::new(Semaphore::new(0));

        tokio::spawn(refill(
            Arc::downgrade(&slots),
            capacity as usize,
            interval,
        ));

        Self { slots, interval }
    }

    /// Allow at most `requests_per_second` call starts per second.
    pub fn per_second(requests_per_second: u32) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Time between two refills.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a slot is available and take it.
    pub async fn wait(&self) {
        // The semaphore is never closed, so acquire only fails if that changes.
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
    }
}

async fn refill(slots: Weak<Semaphore>, capacity: usize, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(slots) = slots.upgrade() else {
            tracing::trace!("rate limiter dropped, stopping refill task");
            break;
        };
        if slots.available_permits() < capacity {
            slots.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced_by_the_refill_interval() {
        let limiter = ApiRateLimiter::new(2, Duration::from_secs(1));
        assert_eq!(limiter.interval(), Duration::from_millis(500));

        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(1500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_fills_up_to_capacity_only() {
        let limiter = ApiRateLimiter::new(3, Duration::from_secs(3));
        tokio::time::sleep(Duration::from_millis(30_500)).await;

        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_is_treated_as_one() {
        let limiter = ApiRateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.interval(), Duration::from_secs(1));
        limiter.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_one_bucket() {
        let limiter = ApiRateLimiter::per_second(1);
        let other = limiter.clone();

        let start = Instant::now();
        limiter.wait().await;
        other.wait().await;

        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
