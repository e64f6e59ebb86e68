//! Bucket key generation.

/// Prefix shared by every bucket key, also used as the Redis key namespace.
pub const KEY_PREFIX: &str = "rate_limit";

/// A key that uniquely identifies one token bucket.
///
/// The key combines the effective rule name and the caller identity, so
/// different rules never share state and neither do different identities
/// under the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The rule this bucket belongs to
    pub rule: String,
    /// The identity the bucket is partitioned by
    pub identity: String,
}

impl BucketKey {
    /// Create a new bucket key from a rule name and identity.
    pub fn new(rule: &str, identity: &str) -> Self {
        Self {
            rule: rule.to_string(),
            identity: identity.to_string(),
        }
    }

    /// The storage key, `rate_limit:<rule>:<identity>`.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.rule, self.identity)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_format() {
        let key = BucketKey::new("ingest", "user:42");
        assert_eq!(key.to_storage_key(), "rate_limit:ingest:user:42");
        assert_eq!(key.to_string(), "rate_limit:ingest:user:42");
    }

    #[test]
    fn test_keys_are_isolated() {
        let a_x = BucketKey::new("a", "x");
        assert_ne!(a_x, BucketKey::new("b", "x"));
        assert_ne!(a_x, BucketKey::new("a", "y"));
        assert_eq!(a_x, BucketKey::new("a", "x"));
    }
}
