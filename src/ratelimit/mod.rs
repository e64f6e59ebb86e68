//! Token bucket rate limiting and bucket storage.

mod backend;
mod bucket;
mod distributed;
mod key;
mod limiter;
mod memory;
mod rules;

pub use backend::{Backend, BackendKind, StorageBackend, StorageTarget};
pub use bucket::{bucket_ttl, BucketState, Consumption, Refill, MAX_RETRY_AFTER_SECS};
pub use distributed::RedisBackend;
pub use key::BucketKey;
pub use limiter::{
    Decision, RateLimiter, HEADER_LIMIT, HEADER_REMAINING, HEADER_RETRY_AFTER, HEADER_RULE,
};
pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use rules::{
    Rule, RuleSet, RuleSpec, DEFAULT_CAPACITY, DEFAULT_REFILL_RATE, DEFAULT_RULE, MIN_CAPACITY,
    MIN_REFILL_RATE,
};
