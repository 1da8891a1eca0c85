use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitAlgorithm {
    /// Counters reset at fixed wall-clock intervals of `valid_duration`.
    /// A client can consume up to twice `max_amount` around a window
    /// boundary: the tail of one window and the head of the next.
    #[default]
    FixedWindow,
    /// Counters are kept per `bucket_duration` and the decision sums the
    /// buckets covering the trailing `valid_duration`.
    RollingWindow,
}

/// A dimension-matched exception to a quota's default limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    // Sorted, so that the same dimensions always produce the same counter key.
    pub dimensions: BTreeMap<String, String>,
    pub max_amount: u64,
}

impl Override {
    pub fn new(
        dimensions: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        max_amount: u64,
    ) -> Self {
        Self {
            dimensions: dimensions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            max_amount,
        }
    }

    /// Every dimension must be present in `attributes` with an equal value.
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.dimensions
            .iter()
            .all(|(key, value)| attributes.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub name: String,
    pub max_amount: u64,
    #[serde(with = "humantime_serde")]
    pub valid_duration: Duration,
    #[serde(with = "humantime_serde", default)]
    pub bucket_duration: Duration,
    #[serde(default)]
    pub rate_limit_algorithm: RateLimitAlgorithm,
    #[serde(default)]
    pub overrides: Vec<Override>,
}

impl Quota {
    pub fn new(name: impl Into<String>, max_amount: u64, valid_duration: Duration) -> Self {
        Self {
            name: name.into(),
            max_amount,
            valid_duration,
            bucket_duration: Duration::ZERO,
            rate_limit_algorithm: RateLimitAlgorithm::FixedWindow,
            overrides: Vec::new(),
        }
    }

    pub fn rolling(mut self, bucket_duration: Duration) -> Self {
        self.rate_limit_algorithm = RateLimitAlgorithm::RollingWindow;
        self.bucket_duration = bucket_duration;
        self
    }

    pub fn with_override(mut self, quota_override: Override) -> Self {
        self.overrides.push(quota_override);
        self
    }

    /// The first override, in declaration order, whose dimensions are all
    /// satisfied by `attributes`.
    pub fn matching_override(&self, attributes: &HashMap<String, String>) -> Option<&Override> {
        self.overrides.iter().find(|o| o.matches(attributes))
    }

    pub fn effective_max_amount(&self, attributes: &HashMap<String, String>) -> u64 {
        self.matching_override(attributes)
            .map(|o| o.max_amount)
            .unwrap_or(self.max_amount)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.max_amount == 0 {
            return Err(ValidationError::NonPositiveMaxAmount(self.name.clone()));
        }
        if self.valid_duration.is_zero() {
            return Err(ValidationError::ZeroValidDuration(self.name.clone()));
        }
        if self.rate_limit_algorithm == RateLimitAlgorithm::RollingWindow {
            let bucket = self.bucket_duration.as_millis();
            let valid = self.valid_duration.as_millis();
            if bucket == 0 || bucket >= valid || valid % bucket != 0 {
                return Err(ValidationError::InvalidBucketDuration {
                    quota: self.name.clone(),
                    bucket_duration: self.bucket_duration,
                    valid_duration: self.valid_duration,
                });
            }
        }
        for (index, quota_override) in self.overrides.iter().enumerate() {
            if quota_override.dimensions.is_empty() {
                return Err(ValidationError::InvalidOverride {
                    quota: self.name.clone(),
                    index,
                });
            }
            if quota_override.max_amount == 0 {
                return Err(ValidationError::NonPositiveOverrideAmount {
                    quota: self.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("at least one quota must be configured")]
    NoQuotas,
    #[error("quota names must not be empty")]
    EmptyName,
    #[error("quota `{0}` is defined more than once")]
    DuplicateQuota(String),
    #[error("quota `{0}` must have a max_amount greater than 0")]
    NonPositiveMaxAmount(String),
    #[error("quota `{0}` must have a valid_duration greater than 0")]
    ZeroValidDuration(String),
    #[error(
        "quota `{quota}`: bucket_duration {bucket_duration:?} must be greater than 0, \
         lower than and a divisor of valid_duration {valid_duration:?}"
    )]
    InvalidBucketDuration {
        quota: String,
        bucket_duration: Duration,
        valid_duration: Duration,
    },
    #[error("quota `{quota}`: override #{index} has no dimensions")]
    InvalidOverride { quota: String, index: usize },
    #[error("quota `{quota}`: override #{index} must have a max_amount greater than 0")]
    NonPositiveOverrideAmount { quota: String, index: usize },
    #[error("redis_server_url must not be empty")]
    EmptyRedisUrl,
    #[error("connection_pool_size must be greater than 0")]
    EmptyConnectionPool,
}

/// An immutable, validated set of quotas, indexed by name.
#[derive(Debug, Default, Clone)]
pub struct QuotaSet {
    quotas: HashMap<String, Arc<Quota>>,
}

impl QuotaSet {
    pub fn new(quotas: impl IntoIterator<Item = Quota>) -> Result<Self, ValidationError> {
        let mut by_name = HashMap::new();
        for quota in quotas {
            quota.validate()?;
            if by_name.contains_key(&quota.name) {
                return Err(ValidationError::DuplicateQuota(quota.name));
            }
            by_name.insert(quota.name.clone(), Arc::new(quota));
        }
        if by_name.is_empty() {
            return Err(ValidationError::NoQuotas);
        }
        Ok(Self { quotas: by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Quota>> {
        self.quotas.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.quotas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}
