//! Core rate limiter implementation.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, error, info, trace, warn};

use super::backend::{Backend, BackendKind, StorageBackend, StorageTarget};
use super::key::BucketKey;
use super::memory::MemoryBackendConfig;
use super::rules::{Rule, RuleSet, RuleSpec, DEFAULT_RULE};
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Header carrying the seconds to wait before retrying (denials only).
pub const HEADER_RETRY_AFTER: &str = "retry-after";
/// Header carrying the capacity of the applied rule.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the tokens left after this call.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the name of the rule actually applied.
pub const HEADER_RULE: &str = "x-ratelimit-rule";

/// The outcome of one consume attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket
    pub remaining: u64,
    /// Seconds to wait before retrying, 0 when allowed
    pub retry_after: u64,
    /// Capacity of the applied rule
    pub capacity: u64,
    /// The rule actually applied, which is `"default"` for unknown names
    pub rule_name: String,
}

impl Decision {
    /// Decision returned while the limiter is switched off.
    fn unlimited(rule_name: &str) -> Self {
        Self {
            allowed: true,
            remaining: 0,
            retry_after: 0,
            capacity: 0,
            rule_name: rule_name.to_string(),
        }
    }

    /// Decision synthesized when the backend could not be consulted.
    fn fail_open(rule: &Rule) -> Self {
        Self {
            allowed: true,
            remaining: rule.capacity_whole(),
            retry_after: 0,
            capacity: rule.capacity_whole(),
            rule_name: rule.name.clone(),
        }
    }

    /// Response metadata for this decision as `(header, value)` pairs.
    ///
    /// `retry-after` is only included for denials.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if !self.allowed {
            pairs.push((HEADER_RETRY_AFTER, self.retry_after.to_string()));
        }
        pairs.push((HEADER_LIMIT, self.capacity.to_string()));
        pairs.push((HEADER_REMAINING, self.remaining.to_string()));
        pairs.push((HEADER_RULE, self.rule_name.clone()));
        pairs
    }
}

/// The rate limiter that maps rule names and identities onto token buckets.
///
/// Rules are fixed at construction. The limiter is thread-safe and meant to
/// be shared (behind an `Arc`) by every request handler in the process.
pub struct RateLimiter<B: Backend = StorageBackend> {
    enabled: bool,
    rules: RuleSet,
    backend: B,
    /// Unknown rule names that have already been logged
    warned_rules: Mutex<HashSet<String>>,
}

impl RateLimiter<StorageBackend> {
    /// Normalize the rules and select a backend for `storage_target`.
    ///
    /// An unreachable distributed store is logged and replaced by in-memory
    /// storage; this never fails.
    pub async fn configure<I, S>(enabled: bool, rules: I, storage_target: &str) -> Self
    where
        I: IntoIterator<Item = (S, RuleSpec)>,
        S: Into<String>,
    {
        Self::build(
            enabled,
            RuleSet::normalize(rules),
            storage_target,
            MemoryBackendConfig::default(),
        )
        .await
    }

    /// Build a limiter from the `rate_limiting` configuration section.
    pub async fn from_config(config: &RateLimitingConfig) -> Self {
        Self::build(
            config.enabled,
            RuleSet::normalize(config.rules.clone()),
            &config.storage_target,
            config.memory.clone(),
        )
        .await
    }

    async fn build(
        enabled: bool,
        rules: RuleSet,
        storage_target: &str,
        memory: MemoryBackendConfig,
    ) -> Self {
        let target = StorageTarget::parse(storage_target);
        let backend = StorageBackend::from_target(&target, memory).await;

        info!(
            enabled,
            rules = rules.len(),
            backend = %backend.kind(),
            "Rate limiter configured"
        );

        Self::with_backend(enabled, rules, backend)
    }
}

impl<B: Backend> RateLimiter<B> {
    /// Create a limiter over an already constructed backend.
    pub fn with_backend(enabled: bool, rules: RuleSet, backend: B) -> Self {
        Self {
            enabled,
            rules,
            backend,
            warned_rules: Mutex::new(HashSet::new()),
        }
    }

    /// Take one token for `identity` under `rule_name`.
    pub async fn consume(&self, rule_name: &str, identity: &str) -> Decision {
        self.consume_tokens(rule_name, identity, 1).await
    }

    /// Take `tokens` tokens for `identity` under `rule_name`.
    ///
    /// Unknown rule names use the default rule. Backend failures are logged
    /// and the request is allowed.
    pub async fn consume_tokens(&self, rule_name: &str, identity: &str, tokens: u64) -> Decision {
        if !self.enabled {
            return Decision::unlimited(rule_name);
        }

        let rule = self.effective_rule(rule_name);
        let key = BucketKey::new(&rule.name, identity).to_storage_key();

        trace!(rule = %rule.name, tokens, "Checking rate limit");

        match self
            .backend
            .consume(&key, rule.capacity, rule.refill_rate, tokens)
            .await
        {
            Ok(consumption) => {
                if !consumption.allowed {
                    debug!(
                        rule = %rule.name,
                        retry_after = consumption.retry_after,
                        "Rate limit exceeded"
                    );
                }

                Decision {
                    allowed: consumption.allowed,
                    remaining: consumption.remaining,
                    retry_after: consumption.retry_after,
                    capacity: rule.capacity_whole(),
                    rule_name: rule.name.clone(),
                }
            }
            Err(e) => {
                error!(
                    rule = %rule.name,
                    backend = %self.backend.kind(),
                    error = %e,
                    "Rate limit backend failed, allowing request"
                );
                Decision::fail_open(rule)
            }
        }
    }

    /// Forget the bucket for `identity` under `rule_name`.
    pub async fn reset(&self, rule_name: &str, identity: &str) -> Result<()> {
        let (rule, _) = self.rules.resolve(rule_name);
        let key = BucketKey::new(&rule.name, identity).to_storage_key();
        self.backend.reset(&key).await
    }

    /// Resolve a rule name, warning once per unknown name.
    fn effective_rule(&self, requested: &str) -> &Rule {
        let (rule, fell_back) = self.rules.resolve(requested);
        if fell_back {
            let mut warned = self.warned_rules.lock();
            if !warned.contains(requested) {
                warned.insert(requested.to_string());
                warn!(
                    rule = %requested,
                    fallback = DEFAULT_RULE,
                    "Unknown rate limit rule, using default"
                );
            }
        }
        rule
    }

    /// Whether limiting is switched on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The normalized rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Look up a configured rule.
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    /// The backend in use.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Which kind of storage the limiter ended up on.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }
}
