use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{AppError, Result};

/// Token bucket in front of every upstream call.
///
/// Capacity is the burst size; tokens refill continuously at
/// `requests_per_minute / 60` per second. Waiters sleep until the next token
/// is due instead of spinning.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Option<Duration>,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Both arguments are clamped to at least 1.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(requests_per_minute.max(1)) / 60.0,
            max_wait: None,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Fail with `RateLimitTimeout` instead of waiting longer than `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Waits for a token and consumes it.
    pub async fn acquire(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now(), self.capacity, self.refill_per_sec);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };

            if let Some(max_wait) = self.max_wait {
                if started.elapsed() + wait > max_wait {
                    return Err(AppError::RateLimitTimeout(max_wait));
                }
            }

            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for refill");
            sleep(wait).await;
        }
    }

    /// Tokens currently available, after refill.
    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.capacity, self.refill_per_sec);
        bucket.tokens
    }
}
