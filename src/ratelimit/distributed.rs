//! Redis-backed token bucket storage.
//!
//! The whole read-refill-deduct-write sequence runs inside one Lua script on
//! the Redis server, so concurrent callers in different processes never
//! interleave a read with another caller's write. The script reads the
//! server's clock, which keeps elapsed-time calculations consistent across
//! callers with drifting local clocks.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, trace, warn};

use super::backend::{Backend, BackendKind};
use super::bucket::{bucket_ttl, Consumption, MAX_RETRY_AFTER_SECS};
use crate::error::{Result, TollgateError};

/// Atomic token bucket update.
///
/// KEYS[1] bucket key; ARGV capacity, refill_rate, requested, ttl_secs,
/// max_retry_after. State is stored with microsecond precision.
/// Returns `{allowed, floor(remaining), retry_after, clock_skewed}`.
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local max_retry_after = tonumber(ARGV[5])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end
if tokens < 0 then
  tokens = 0
end

local skewed = 0
local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
  skewed = 1
end

local available = math.min(capacity, tokens + elapsed * refill_rate)
local allowed = 0
local retry_after = 0
if available >= requested then
  available = available - requested
  allowed = 1
else
  retry_after = math.max(1, math.ceil((requested - available) / refill_rate))
  if retry_after > max_retry_after then
    retry_after = max_retry_after
  end
end

redis.call('HSET', key,
  'tokens', string.format('%.6f', available),
  'last_refill', string.format('%.6f', now))
redis.call('EXPIRE', key, ttl)

return {allowed, math.floor(available), retry_after, skewed}
"#;

/// Token buckets shared through a Redis server.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    script: Script,
}

impl RedisBackend {
    /// Connect to Redis and check that it answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "Redis liveness probe succeeded");

        Ok(Self {
            conn,
            script: Script::new(CONSUME_SCRIPT),
        })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        tokens: u64,
    ) -> Result<Consumption> {
        let mut conn = self.conn.clone();
        let ttl_secs = bucket_ttl(capacity, refill_rate).ceil() as u64;

        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(capacity)
            .arg(refill_rate)
            .arg(tokens)
            .arg(ttl_secs)
            .arg(MAX_RETRY_AFTER_SECS)
            .invoke_async(&mut conn)
            .await?;

        let [allowed, remaining, retry_after, skewed] = reply[..] else {
            return Err(TollgateError::Backend(format!(
                "unexpected consume script reply: {:?}",
                reply
            )));
        };

        if skewed != 0 {
            warn!(capacity, refill_rate, "Redis clock moved backwards, treating elapsed time as zero");
        }

        trace!(
            allowed = allowed != 0,
            remaining,
            "Consumed from Redis bucket"
        );

        Ok(Consumption {
            allowed: allowed != 0,
            remaining: remaining.max(0) as u64,
            retry_after: retry_after.max(0) as u64,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Connect to the Redis named by `TOLLGATE_TEST_REDIS_URL`.
    async fn test_backend() -> RedisBackend {
        let url = std::env::var("TOLLGATE_TEST_REDIS_URL")
            .expect("TOLLGATE_TEST_REDIS_URL must name a Redis server");
        RedisBackend::connect(&url).await.unwrap()
    }

    fn unique_key(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("rate_limit:test:{}:{}", name, nanos)
    }

    #[tokio::test]
    async fn test_connect_fails_for_unreachable_server() {
        assert!(RedisBackend::connect("redis://127.0.0.1:1/0").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        assert!(RedisBackend::connect("not a url").await.is_err());
    }

    #[test]
    fn test_tls_urls_are_supported() {
        assert!(redis::Client::open("rediss://127.0.0.1:1/0").is_ok());
    }

    #[tokio::test]
    async fn test_tls_connect_fails_on_transport_not_config() {
        let Err(err) = RedisBackend::connect("rediss://127.0.0.1:1/0").await else {
            panic!("connected to an unreachable server");
        };
        match err {
            TollgateError::Redis(e) => {
                assert_ne!(e.kind(), redis::ErrorKind::InvalidClientConfig)
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    #[ignore = "needs a Redis server named by TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_drains_then_denies() {
        let backend = test_backend().await;
        let key = unique_key("drain");

        let first = backend.consume(&key, 2.0, 0.01, 1).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = backend.consume(&key, 2.0, 0.01, 1).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = backend.consume(&key, 2.0, 0.01, 1).await.unwrap();
        assert!(!third.allowed);
        assert!(third.retry_after >= 1);

        backend.reset(&key).await.unwrap();
        assert!(backend.consume(&key, 2.0, 0.01, 1).await.unwrap().allowed);
        backend.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a Redis server named by TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_caps_huge_retry_after() {
        let backend = test_backend().await;
        let key = unique_key("huge-cost");

        let denied = backend.consume(&key, 1.0, 0.001, u64::MAX).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, MAX_RETRY_AFTER_SECS);

        backend.reset(&key).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a Redis server named by TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_concurrent_callers_never_overdraw() {
        let backend = Arc::new(test_backend().await);
        let key = unique_key("contention");
        let capacity = 40;

        let handles: Vec<_> = (0..capacity * 2)
            .map(|_| {
                let backend = backend.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    backend
                        .consume(&key, capacity as f64, 0.001, 1)
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, capacity);

        backend.reset(&key).await.unwrap();
    }
}
