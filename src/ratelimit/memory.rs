//! In-process token bucket storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::backend::{Backend, BackendKind};
use super::bucket::{bucket_ttl, BucketState, Consumption};
use crate::error::Result;

/// Tuning for the in-memory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBackendConfig {
    /// Hard cap on stored buckets, enforced at each sweep
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Number of consume calls between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_buckets: default_max_buckets(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_max_buckets() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    256
}

struct Slot {
    state: BucketState,
    expires_at: f64,
}

struct Buckets {
    slots: HashMap<String, Slot>,
    ops: u64,
}

/// Token buckets held in a single mutex-guarded map.
///
/// Expired buckets are swept every `sweep_interval` calls; if the map is
/// still over `max_buckets` after that, the buckets closest to expiry are
/// evicted. This bounds memory under unbounded key cardinality.
pub struct MemoryBackend {
    buckets: Mutex<Buckets>,
    /// Reference point for the monotonic clock
    origin: Instant,
    config: MemoryBackendConfig,
}

impl MemoryBackend {
    /// Create a backend with default limits.
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    /// Create a backend with explicit limits.
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                slots: HashMap::new(),
                ops: 0,
            }),
            origin: Instant::now(),
            config,
        }
    }

    /// Seconds since this backend was created.
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Consume against the bucket at an explicit point in time.
    fn consume_at(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: u64,
        now: f64,
    ) -> Consumption {
        let mut buckets = self.buckets.lock();

        let current = buckets
            .slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.state);
        let refill = BucketState::take(current, now, capacity, refill_rate, tokens);

        if refill.clock_skewed {
            warn!(capacity, refill_rate, "Clock moved backwards, treating elapsed time as zero");
        }

        let expires_at = now + bucket_ttl(capacity, refill_rate);
        match buckets.slots.get_mut(key) {
            Some(slot) => {
                slot.state = refill.state;
                slot.expires_at = expires_at;
            }
            None => {
                debug!(capacity, refill_rate, "Creating token bucket");
                buckets.slots.insert(
                    key.to_string(),
                    Slot {
                        state: refill.state,
                        expires_at,
                    },
                );
            }
        }

        buckets.ops += 1;
        if buckets.ops % self.config.sweep_interval.max(1) == 0 {
            self.sweep(&mut buckets, now);
        }

        trace!(
            allowed = refill.consumption.allowed,
            remaining = refill.consumption.remaining,
            "Consumed from in-memory bucket"
        );

        refill.consumption
    }

    /// Drop expired buckets, then enforce the bucket cap.
    fn sweep(&self, buckets: &mut Buckets, now: f64) {
        let before = buckets.slots.len();
        buckets.slots.retain(|_, slot| slot.expires_at > now);
        let expired = before - buckets.slots.len();

        let mut evicted = 0;
        if buckets.slots.len() > self.config.max_buckets {
            let excess = buckets.slots.len() - self.config.max_buckets;
            let mut by_expiry: Vec<(f64, String)> = buckets
                .slots
                .iter()
                .map(|(key, slot)| (slot.expires_at, key.clone()))
                .collect();
            by_expiry.sort_by(|a, b| a.0.total_cmp(&b.0));

            for (_, key) in by_expiry.into_iter().take(excess) {
                buckets.slots.remove(&key);
            }
            evicted = excess;
        }

        if expired > 0 || evicted > 0 {
            debug!(
                expired,
                evicted,
                remaining = buckets.slots.len(),
                "Swept in-memory buckets"
            );
        }
    }

    /// Number of buckets currently stored.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().slots.len()
    }

    /// Remove all buckets.
    pub fn clear(&self) {
        self.buckets.lock().slots.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: u64,
    ) -> Result<Consumption> {
        Ok(self.consume_at(key, capacity, refill_rate, tokens, self.now()))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.buckets.lock().slots.remove(key);
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}
