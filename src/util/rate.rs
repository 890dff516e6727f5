use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Paces byte transfers to a maximum aggregate rate.
///
/// Each caller reserves the next free slot of `bytes / rate` seconds and
/// sleeps until it starts, so concurrent workers share the budget.
pub struct RateLimiter {
    bytes_per_second: u64,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// A `bytes_per_second` of 0 disables limiting.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }

    pub async fn acquire(&self, bytes: u64) {
        if !self.is_limited() || bytes == 0 {
            return;
        }

        let cost = Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64);
        let start = {
            let mut next_slot = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Idle time is not banked as burst credit.
            let start = (*next_slot).max(Instant::now());
            *next_slot = start + cost;
            start
        };
        tokio::time::sleep_until(start).await;
    }
}
