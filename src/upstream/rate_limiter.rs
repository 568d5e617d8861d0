//! Token-bucket pacing for upstream requests.
//!
//! One limiter is shared by every worker that talks to the same provider.
//! `acquire` suspends until a token is available; waiters are served in FIFO
//! order because the bucket lives behind a fair `tokio::sync::Mutex` and each
//! waiter sleeps out its own deficit while holding the lock.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    requests_per_second: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(0.01);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: rate.ceil(),
                last_refill: Instant::now(),
            }),
            requests_per_second: rate,
            capacity: rate.ceil().max(1.0),
        }
    }

    /// Take one token, waiting for the bucket to refill if necessary.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.requests_per_second).min(self.capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.requests_per_second);
            debug!("rate limiter: waiting {}ms for token", wait.as_millis());
            sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.last_refill = Instant::now();
        }

        bucket.tokens -= 1.0;
    }
}
