//! Token-bucket rate limiting and outbound backpressure.
//!
//! Each session owns one [`TokenBucket`] per limited message kind. Unlike
//! the atomic/CAS bucket used for cross-thread limiters elsewhere in this
//! codebase's ecosystem, these buckets are only ever touched by the single
//! task that owns a session, so a plain field mutation under `&mut self` is
//! enough — no compare-and-swap loop required.

use tokio::time::Instant;

/// A single token bucket: `capacity` tokens, refilled at `refill_per_sec`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Construct a bucket starting full, refilling at `rate` tokens/second
    /// up to `burst` tokens.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            refill_per_sec: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempt to consume one token. Returns `true` if allowed.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-session rate limiting state for the two limited frame kinds.
pub struct SessionLimiter {
    op_bucket: TokenBucket,
    cursor_bucket: TokenBucket,
}

/// Limits that parameterize a [`SessionLimiter`] (from [`crate::ServerConfig`]).
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub op_rate: u32,
    pub op_burst: u32,
    pub cursor_rate: u32,
    pub cursor_burst: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            op_rate: 50,
            op_burst: 100,
            cursor_rate: 30,
            cursor_burst: 60,
        }
    }
}

impl SessionLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            op_bucket: TokenBucket::new(limits.op_rate, limits.op_burst),
            cursor_bucket: TokenBucket::new(limits.cursor_rate, limits.cursor_burst),
        }
    }

    /// Check and consume one token from the `OT_OP` bucket.
    pub fn allow_op(&mut self) -> bool {
        self.op_bucket.try_acquire()
    }

    /// Check and consume one token from the `CURSOR_UPDATE` bucket.
    pub fn allow_cursor(&mut self) -> bool {
        self.cursor_bucket.try_acquire()
    }
}
