//! Rate limit rule configuration and normalization.
//!
//! Rules arrive from configuration as loosely typed values and are normalized
//! once, when the limiter is constructed. Missing or malformed values fall
//! back to the defaults, out-of-range values are clamped, and a `"default"`
//! rule is always present afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, TollgateError};

/// Name of the rule used when a requested rule is not configured.
pub const DEFAULT_RULE: &str = "default";
/// Capacity used when a rule has no usable capacity.
pub const DEFAULT_CAPACITY: f64 = 300.0;
/// Refill rate (tokens per second) used when a rule has no usable refill rate.
pub const DEFAULT_REFILL_RATE: f64 = 5.0;
/// Smallest allowed capacity.
pub const MIN_CAPACITY: f64 = 1.0;
/// Smallest allowed refill rate, in tokens per second.
pub const MIN_REFILL_RATE: f64 = 0.001;

/// A rule as written in configuration, before normalization.
///
/// Fields are kept untyped so that bad values (strings, nulls, negatives)
/// reach normalization instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Bucket capacity
    #[serde(default)]
    pub capacity: Option<Value>,
    /// Refill rate in tokens per second
    #[serde(default)]
    pub refill_rate: Option<Value>,
}

impl RuleSpec {
    /// Create a spec from concrete numbers.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity: Some(Value::from(capacity)),
            refill_rate: Some(Value::from(refill_rate)),
        }
    }
}

/// A normalized token bucket rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// The rule name
    pub name: String,
    /// Maximum tokens the bucket holds, at least [`MIN_CAPACITY`]
    pub capacity: f64,
    /// Tokens added per second, at least [`MIN_REFILL_RATE`]
    pub refill_rate: f64,
}

impl Rule {
    /// Normalize a raw spec into a rule.
    pub fn from_spec(name: &str, spec: &RuleSpec) -> Self {
        let capacity = coerce(name, "capacity", spec.capacity.as_ref(), DEFAULT_CAPACITY);
        let refill_rate = coerce(
            name,
            "refill_rate",
            spec.refill_rate.as_ref(),
            DEFAULT_REFILL_RATE,
        );

        let capacity = if capacity < MIN_CAPACITY {
            warn!(rule = %name, capacity, min = MIN_CAPACITY, "Clamping rule capacity");
            MIN_CAPACITY
        } else {
            capacity
        };

        let refill_rate = if refill_rate < MIN_REFILL_RATE {
            warn!(rule = %name, refill_rate, min = MIN_REFILL_RATE, "Clamping rule refill rate");
            MIN_REFILL_RATE
        } else {
            refill_rate
        };

        Self {
            name: name.to_string(),
            capacity,
            refill_rate,
        }
    }

    /// The capacity as reported in decisions and headers.
    pub fn capacity_whole(&self) -> u64 {
        self.capacity.floor() as u64
    }
}

impl From<&Rule> for RuleSpec {
    fn from(rule: &Rule) -> Self {
        RuleSpec::new(rule.capacity, rule.refill_rate)
    }
}

/// Read a numeric field, accepting numbers and numeric strings.
fn coerce(rule: &str, field: &str, value: Option<&Value>, fallback: f64) -> f64 {
    let parsed = match value {
        None | Some(Value::Null) => {
            debug!(rule = %rule, field, fallback, "Rule field missing, using default");
            return fallback;
        }
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match parsed.filter(|v| v.is_finite()) {
        Some(v) => v,
        None => {
            warn!(rule = %rule, field, value = ?value, fallback, "Invalid rule field, using default");
            fallback
        }
    }
}

/// The complete, normalized set of rules known to a limiter.
///
/// Immutable once built; a [`DEFAULT_RULE`] entry always exists.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: HashMap<String, Rule>,
    default: Rule,
}

impl RuleSet {
    /// Normalize raw rule specs into a rule set.
    pub fn normalize<I, S>(specs: I) -> Self
    where
        I: IntoIterator<Item = (S, RuleSpec)>,
        S: Into<String>,
    {
        let mut rules: HashMap<String, Rule> = specs
            .into_iter()
            .map(|(name, spec)| {
                let name = name.into();
                let rule = Rule::from_spec(&name, &spec);
                (name, rule)
            })
            .collect();

        let default = rules
            .entry(DEFAULT_RULE.to_string())
            .or_insert_with(|| {
                debug!("No default rule configured, synthesizing one");
                Rule::from_spec(DEFAULT_RULE, &RuleSpec::default())
            })
            .clone();

        Self { rules, default }
    }

    /// Load a rules mapping (`name -> {capacity, refill_rate}`) from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let specs: HashMap<String, RuleSpec> = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rules: {}", e)))?;
        Ok(Self::normalize(specs))
    }

    /// Load a rules mapping from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Look up a configured rule by name.
    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    /// The fallback rule.
    pub fn default_rule(&self) -> &Rule {
        &self.default
    }

    /// Resolve a requested rule name, falling back to the default rule.
    ///
    /// The flag is `true` when the fallback was taken.
    pub fn resolve(&self, name: &str) -> (&Rule, bool) {
        match self.rules.get(name) {
            Some(rule) => (rule, false),
            None => (&self.default, true),
        }
    }

    /// Iterate over all rules, including the default.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Number of rules, including the default.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Always `false`; the default rule is always present.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Convert back into raw specs.
    pub fn to_specs(&self) -> HashMap<String, RuleSpec> {
        self.rules
            .iter()
            .map(|(name, rule)| (name.clone(), RuleSpec::from(rule)))
            .collect()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::normalize(Vec::<(String, RuleSpec)>::new())
    }
}
