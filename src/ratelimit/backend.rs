//! Storage backend abstraction for token buckets.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::bucket::Consumption;
use super::distributed::RedisBackend;
use super::memory::{MemoryBackend, MemoryBackendConfig};
use crate::error::Result;

/// Trait for token bucket storage implementations.
///
/// Every implementation applies the same refill/deduct rules (see
/// [`BucketState::take`](super::bucket::BucketState::take)) and performs the
/// read-refill-write sequence for one key without interleaving with other
/// callers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Refill the bucket under `key` and try to take `tokens` from it.
    async fn consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: u64,
    ) -> Result<Consumption>;

    /// Drop the bucket under `key`, so the next consume starts full.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Which kind of storage this is.
    fn kind(&self) -> BackendKind;
}

/// The kinds of storage a limiter can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local map
    Memory,
    /// Shared Redis server
    Redis,
    /// Anything supplied by the embedding application
    Custom,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
            BackendKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Where bucket state should live, parsed from a URI-like string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// In-process storage
    Memory,
    /// A Redis server, by connection URL
    Redis(String),
}

impl StorageTarget {
    /// Parse a storage target.
    ///
    /// Empty strings and the `memory` scheme select in-process storage;
    /// `redis`, `rediss`, `redis+unix` and `unix` select Redis. Anything else
    /// is logged and treated as in-process storage.
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        if target.is_empty() {
            return StorageTarget::Memory;
        }

        let scheme = target
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or(target)
            .to_ascii_lowercase();

        match scheme.as_str() {
            "memory" => StorageTarget::Memory,
            "redis" | "rediss" | "redis+unix" | "unix" => StorageTarget::Redis(target.to_string()),
            _ => {
                warn!(scheme = %scheme, "Unrecognized storage target, using in-memory storage");
                StorageTarget::Memory
            }
        }
    }
}

impl std::fmt::Display for StorageTarget {
    /// Formats the target with any credentials masked.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTarget::Memory => f.write_str("memory://"),
            StorageTarget::Redis(url) => match (url.split_once("://"), url.rfind('@')) {
                (Some((scheme, _)), Some(at)) => write!(f, "{}://***{}", scheme, &url[at..]),
                _ => f.write_str(url),
            },
        }
    }
}

/// The backend selected at startup.
///
/// Callers go through [`Backend`] and never branch on the variant.
pub enum StorageBackend {
    /// Process-local buckets
    Memory(MemoryBackend),
    /// Buckets shared through Redis
    Redis(RedisBackend),
}

impl StorageBackend {
    /// Build the backend for a storage target.
    ///
    /// A Redis target that cannot be reached falls back to in-memory storage;
    /// construction never fails.
    pub async fn from_target(target: &StorageTarget, memory: MemoryBackendConfig) -> Self {
        match target {
            StorageTarget::Memory => {
                debug!("Using in-memory rate limit storage");
                StorageBackend::Memory(MemoryBackend::with_config(memory))
            }
            StorageTarget::Redis(url) => match RedisBackend::connect(url).await {
                Ok(backend) => {
                    info!(target = %target, "Using Redis rate limit storage");
                    StorageBackend::Redis(backend)
                }
                Err(e) => {
                    warn!(
                        target = %target,
                        error = %e,
                        "Redis unavailable, falling back to in-memory rate limit storage"
                    );
                    StorageBackend::Memory(MemoryBackend::with_config(memory))
                }
            },
        }
    }
}

#[async_trait]
impl Backend for StorageBackend {
    async fn consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: u64,
    ) -> Result<Consumption> {
        match self {
            StorageBackend::Memory(backend) => {
                backend.consume(key, capacity, refill_rate, tokens).await
            }
            StorageBackend::Redis(backend) => {
                backend.consume(key, capacity, refill_rate, tokens).await
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        match self {
            StorageBackend::Memory(backend) => backend.reset(key).await,
            StorageBackend::Redis(backend) => backend.reset(key).await,
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            StorageBackend::Memory(_) => BackendKind::Memory,
            StorageBackend::Redis(_) => BackendKind::Redis,
        }
    }
}
