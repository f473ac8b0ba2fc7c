// src/limiter.rs

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::{sleep, Duration, Instant};

/// Byte-rate limit shared read-only across every in-flight transfer.
///
/// A rate of 0 disables the limit. Clones share the same budget.
#[derive(Clone)]
pub struct SpeedLimiter {
    shared: Arc<Mutex<Allowance>>,
}

struct Allowance {
    /// Bytes per second; 0 means unlimited.
    rate: u64,
    /// Bytes currently spendable. Goes negative when a caller overdraws,
    /// and the deficit determines how long that caller sleeps.
    available: f64,
    /// When `available` was last brought forward.
    updated: Instant,
}

impl SpeedLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Allowance {
                rate: bytes_per_sec,
                available: bytes_per_sec as f64,
                updated: Instant::now(),
            })),
        }
    }

    /// Changes the limit at runtime; 0 lifts it entirely.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut allowance = self.lock();
        allowance.rate = bytes_per_sec;
        allowance.available = allowance.available.min(bytes_per_sec as f64);
        allowance.updated = Instant::now();
    }

    pub fn rate(&self) -> u64 {
        self.lock().rate
    }

    /// Debits `amount` bytes from the shared budget, sleeping until the
    /// configured rate covers them. The lock is never held while sleeping.
    pub async fn acquire(&self, amount: u64) {
        let wait = {
            let mut allowance = self.lock();
            if allowance.rate == 0 || amount == 0 {
                return;
            }
            let now = Instant::now();
            let earned = now.duration_since(allowance.updated).as_secs_f64() * allowance.rate as f64;
            // The budget caps at one second's worth of bytes, bounding bursts.
            allowance.available = (allowance.available + earned).min(allowance.rate as f64);
            allowance.updated = now;
            allowance.available -= amount as f64;
            if allowance.available >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-allowance.available / allowance.rate as f64)
        };
        sleep(wait).await;
    }

    fn lock(&self) -> MutexGuard<'_, Allowance> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_rate_never_waits() {
        let limiter = SpeedLimiter::new(0);
        for _ in 0..1000 {
            limiter.acquire(u64::MAX / 2).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overdraw_sleeps_for_the_deficit() {
        let limiter = SpeedLimiter::new(1000);
        let started = Instant::now();

        // First second's budget is free, the next 2000 bytes cost two more.
        limiter.acquire(1000).await;
        limiter.acquire(1000).await;
        limiter.acquire(1000).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn raising_the_rate_takes_effect() {
        let limiter = SpeedLimiter::new(1);
        limiter.set_rate(0);
        assert_eq!(limiter.rate(), 0);
        limiter.acquire(10_000_000).await;
    }
}
