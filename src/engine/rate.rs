//! Bandwidth limiting
//!
//! Token buckets shared by every connection of the engine. Waiters queue on
//! a fair semaphore and keep their place while sleeping, so one busy
//! connection cannot starve the others.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug)]
struct TokenBucket {
    /// Bytes per second, 0 for unlimited
    rate: u64,
    /// May go negative: a large acquisition leaves debt that later callers wait out
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let burst = self.rate as f64;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(burst);
    }
}

/// A single token-bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    queue: Semaphore,
}

impl RateLimiter {
    /// Limiter allowing `bytes_per_sec` with a one second burst; 0 means unlimited
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket {
                rate: bytes_per_sec,
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
            queue: Semaphore::new(1),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Change the limit; 0 removes it
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.rate = bytes_per_sec;
        bucket.tokens = bucket.tokens.min(bytes_per_sec as f64);
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().rate
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: usize) {
        if self.rate() == 0 {
            return;
        }

        // Closed only if the limiter is dropped, which cannot happen while borrowed
        let Ok(_turn) = self.queue.acquire().await else {
            return;
        };

        let wait = {
            let mut bucket = self.bucket.lock();
            if bucket.rate == 0 {
                return;
            }
            bucket.refill();
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
            }
        };

        if !wait.is_zero() {
            trace!("Rate limited: waiting {:?} for {} bytes", wait, bytes);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Download and upload limiters shared across torrents
#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    download: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    /// A limit of 0 means unlimited
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: Arc::new(RateLimiter::new(download_limit)),
            upload: Arc::new(RateLimiter::new(upload_limit)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        self.download.set_rate(bytes_per_sec);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.upload.set_rate(bytes_per_sec);
    }

    pub async fn acquire_download(&self, bytes: usize) {
        self.download.acquire(bytes).await;
    }

    pub async fn acquire_upload(&self, bytes: usize) {
        self.upload.acquire(bytes).await;
    }
}
