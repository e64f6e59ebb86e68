//! Token bucket state and the refill/deduct arithmetic shared by all backends.

/// Idle buckets are never expired sooner than this many seconds.
pub const MIN_BUCKET_TTL_SECS: f64 = 60.0;

/// Largest `retry_after` ever reported; every value up to it is exact as `f64`.
pub const MAX_RETRY_AFTER_SECS: u64 = (1 << 53) - 1;

/// The per-key state held by a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Timestamp (fractional seconds) of the last update
    pub last_refill: f64,
}

/// Outcome of a single consume attempt against one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the requested tokens were granted
    pub allowed: bool,
    /// Whole tokens left in the bucket after this attempt
    pub remaining: u64,
    /// Seconds until the request could succeed, 0 when allowed
    pub retry_after: u64,
}

/// Result of applying a consume attempt to a bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refill {
    /// State to persist back under the bucket key
    pub state: BucketState,
    /// What to report to the caller
    pub consumption: Consumption,
    /// Set when `now` was earlier than the stored `last_refill`
    pub clock_skewed: bool,
}

impl BucketState {
    /// A freshly created bucket holding its full capacity.
    pub fn full(capacity: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Tokens available at `now`, saturating at `capacity`.
    ///
    /// A negative elapsed time is treated as zero; the second element reports
    /// whether that clamp happened.
    pub fn available_at(&self, now: f64, capacity: f64, refill_rate: f64) -> (f64, bool) {
        let elapsed = now - self.last_refill;
        let (elapsed, skewed) = if elapsed < 0.0 {
            (0.0, true)
        } else {
            (elapsed, false)
        };

        let available = (self.tokens.max(0.0) + elapsed * refill_rate).min(capacity);
        (available, skewed)
    }

    /// Refill the bucket up to `now` and try to take `requested` tokens.
    ///
    /// A missing state is initialized to a full bucket first.
    pub fn take(
        state: Option<BucketState>,
        now: f64,
        capacity: f64,
        refill_rate: f64,
        requested: u64,
    ) -> Refill {
        let state = state.unwrap_or_else(|| BucketState::full(capacity, now));
        let (available, clock_skewed) = state.available_at(now, capacity, refill_rate);
        let requested = requested as f64;

        let (left, consumption) = if available >= requested {
            let left = available - requested;
            (
                left,
                Consumption {
                    allowed: true,
                    remaining: left.floor() as u64,
                    retry_after: 0,
                },
            )
        } else {
            let retry_after = ((requested - available) / refill_rate)
                .ceil()
                .clamp(1.0, MAX_RETRY_AFTER_SECS as f64);
            (
                available,
                Consumption {
                    allowed: false,
                    remaining: available.floor() as u64,
                    retry_after: retry_after as u64,
                },
            )
        };

        Refill {
            state: BucketState {
                tokens: left,
                last_refill: now,
            },
            consumption,
            clock_skewed,
        }
    }
}

/// How long an idle bucket is kept: twice the time it takes to refill from
/// empty, never less than a minute.
pub fn bucket_ttl(capacity: f64, refill_rate: f64) -> f64 {
    (capacity / refill_rate * 2.0).max(MIN_BUCKET_TTL_SECS)
}
