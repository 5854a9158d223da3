//! Token bucket rate limiter for outbound Gmail calls
//!
//! One limiter guards one credential scope. Tokens refill continuously at
//! `refill_rate` per second up to `capacity`; an acquire either deducts its
//! cost right away or suspends until enough tokens have accumulated.
//!
//! Waiters are served in arrival order: a caller asking for a large cost is
//! never overtaken by a stream of smaller requests arriving after it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, TriageError};

/// Slowest refill rate accepted, in units per second
pub const MIN_REFILL_RATE: f64 = 0.001;

/// Longest single sleep while waiting for tokens; the waiter re-checks after
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Gmail API quota costs for common operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.get, messages.list, labels.list
    Read,
    /// messages.modify, labels.create
    Write,
    /// messages.batchModify
    Batch,
    Custom(u32),
}

impl QuotaCost {
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::Read => 5,
            QuotaCost::Write => 50,
            QuotaCost::Batch => 50,
            QuotaCost::Custom(units) => *units,
        }
    }
}

/// Shared token bucket
///
/// Cloning yields another handle to the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
    // Held by the caller at the head of the line; tokio's Mutex is fair,
    // so waiters acquire it in FIFO order.
    queue: Arc<Mutex<()>>,
}

#[derive(Debug)]
struct RateLimiterState {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    total_consumed: u64,
    total_acquisitions: u64,
}

impl RateLimiterState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            self.total_consumed += cost as u64;
            self.total_acquisitions += 1;
            true
        } else {
            false
        }
    }
}

impl RateLimiter {
    /// Create a bucket that starts full
    ///
    /// # Arguments
    /// * `capacity` - Maximum burst size in quota units
    /// * `refill_rate` - Quota units added per second, at least [`MIN_REFILL_RATE`]
    ///
    /// # Errors
    /// `InvalidRequest` for a zero capacity or a refill rate that is not
    /// finite or below the minimum.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(TriageError::InvalidRequest(
                "rate limiter capacity must be positive".to_string(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate < MIN_REFILL_RATE {
            return Err(TriageError::InvalidRequest(format!(
                "rate limiter refill rate must be at least {}, got {}",
                MIN_REFILL_RATE, refill_rate
            )));
        }

        Ok(Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                capacity: f64::from(capacity),
                tokens: f64::from(capacity),
                refill_rate,
                last_refill: Instant::now(),
                total_consumed: 0,
                total_acquisitions: 0,
            })),
            queue: Arc::new(Mutex::new(())),
        })
    }

    /// Gmail per-user defaults: 250 units/s with two seconds of burst
    pub fn gmail_default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                capacity: 500.0,
                tokens: 500.0,
                refill_rate: 250.0,
                last_refill: Instant::now(),
                total_consumed: 0,
                total_acquisitions: 0,
            })),
            queue: Arc::new(Mutex::new(())),
        }
    }

    /// Wait until `cost` tokens are available and deduct them
    ///
    /// This method will:
    /// 1. Queue behind earlier waiters
    /// 2. Refill the bucket based on elapsed time
    /// 3. Deduct the tokens if enough are available, otherwise sleep until
    ///    they should be and try again
    ///
    /// # Arguments
    /// * `cost` - Quota units to deduct
    ///
    /// # Returns
    /// A [`QuotaPermit`] recording the deducted cost
    ///
    /// # Errors
    /// `InvalidRequest` immediately when `cost` exceeds the capacity.
    pub async fn acquire(&self, cost: u32) -> Result<QuotaPermit> {
        let needed = f64::from(cost);
        self.check_cost(needed).await?;

        let _turn = self.queue.lock().await;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill();

                trace!(
                    "Bucket at {:.1}/{:.1} tokens, requesting {}",
                    state.tokens,
                    state.capacity,
                    cost
                );

                if state.take(needed) {
                    debug!("Acquired {} tokens, {:.1} remaining", cost, state.tokens);
                    return Ok(QuotaPermit { cost });
                }

                Duration::try_from_secs_f64((needed - state.tokens) / state.refill_rate)
                    .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
            };

            debug!(
                "Bucket exhausted, waiting {:.2}s for {} tokens",
                wait.as_secs_f64(),
                cost
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Acquire the tokens for a Gmail operation
    pub async fn acquire_quota(&self, cost: QuotaCost) -> Result<QuotaPermit> {
        self.acquire(cost.units()).await
    }

    /// Deduct `cost` tokens only if that is possible right now
    ///
    /// # Returns
    /// `Some(permit)` on success; `None` when tokens are short or other
    /// callers are already queued, so it never jumps the line.
    ///
    /// # Errors
    /// `InvalidRequest` when `cost` exceeds the capacity.
    pub async fn try_acquire(&self, cost: u32) -> Result<Option<QuotaPermit>> {
        let needed = f64::from(cost);
        self.check_cost(needed).await?;

        let Ok(_turn) = self.queue.try_lock() else {
            return Ok(None);
        };

        let mut state = self.state.lock().await;
        state.refill();
        Ok(state.take(needed).then_some(QuotaPermit { cost }))
    }

    /// Tokens available right now
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill();
        state.tokens
    }

    /// Snapshot of the bucket level and lifetime counters
    pub async fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().await;
        state.refill();
        RateLimiterStats {
            available: state.tokens,
            capacity: state.capacity,
            refill_rate: state.refill_rate,
            total_consumed: state.total_consumed,
            total_acquisitions: state.total_acquisitions,
        }
    }

    async fn check_cost(&self, needed: f64) -> Result<()> {
        let capacity = self.state.lock().await.capacity;
        if needed > capacity {
            return Err(TriageError::InvalidRequest(format!(
                "cost {} exceeds bucket capacity {}",
                needed, capacity
            )));
        }
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::gmail_default()
    }
}

/// Proof that tokens were deducted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPermit {
    cost: u32,
}

impl QuotaPermit {
    pub fn cost(&self) -> u32 {
        self.cost
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub available: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub total_consumed: u64,
    pub total_acquisitions: u64,
}
