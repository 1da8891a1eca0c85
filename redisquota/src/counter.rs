use crate::quota::{Quota, RateLimitAlgorithm};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The position of a counter on the time axis, in units of its bucket
/// length.
///
/// For fixed windows a bucket is a whole `valid_duration` window, so `first`
/// and `current` are the same window index. For rolling windows the buckets
/// `first..=current` cover the trailing `valid_duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub current: u64,
    pub first: u64,
    /// Time for which the counter must be kept after this update.
    pub ttl: Duration,
}

impl Window {
    pub fn at(quota: &Quota, when: SystemTime) -> Self {
        let now = when
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        let valid = (quota.valid_duration.as_millis() as u64).max(1);

        match quota.rate_limit_algorithm {
            RateLimitAlgorithm::FixedWindow => {
                let index = now / valid;
                Self {
                    current: index,
                    first: index,
                    ttl: Duration::from_millis((index + 1) * valid - now),
                }
            }
            RateLimitAlgorithm::RollingWindow => {
                let bucket = (quota.bucket_duration.as_millis() as u64).max(1);
                let buckets = (valid / bucket).max(1);
                let index = now / bucket;
                Self {
                    current: index,
                    first: (index + 1).saturating_sub(buckets),
                    // The bucket written now stays in the window until it
                    // slides out, `buckets` buckets later.
                    ttl: Duration::from_millis((index + buckets) * bucket - now),
                }
            }
        }
    }
}

/// One counter of a quota: the base quota, or one of its overrides, at a
/// given point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    quota: String,
    dimensions: Option<BTreeMap<String, String>>,
    max_amount: u64,
    algorithm: RateLimitAlgorithm,
    valid_duration: Duration,
    window: Window,
}

// Identity of a counter, as stored in the counter keys.
#[derive(Serialize)]
struct CounterIdentity<'a> {
    quota: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<&'a BTreeMap<String, String>>,
}

impl Counter {
    pub fn new(quota: &Quota, attributes: &HashMap<String, String>, when: SystemTime) -> Self {
        let matched = quota.matching_override(attributes);
        Self {
            quota: quota.name.clone(),
            dimensions: matched.map(|o| o.dimensions.clone()),
            max_amount: matched.map(|o| o.max_amount).unwrap_or(quota.max_amount),
            algorithm: quota.rate_limit_algorithm,
            valid_duration: quota.valid_duration,
            window: Window::at(quota, when),
        }
    }

    pub fn quota(&self) -> &str {
        &self.quota
    }

    /// Dimensions of the override this counter accounts for, `None` for the
    /// base quota.
    pub fn dimensions(&self) -> Option<&BTreeMap<String, String>> {
        self.dimensions.as_ref()
    }

    pub fn max_amount(&self) -> u64 {
        self.max_amount
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    pub fn valid_duration(&self) -> Duration {
        self.valid_duration
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn is_rolling(&self) -> bool {
        self.algorithm == RateLimitAlgorithm::RollingWindow
    }

    /// Stable encoding of what this counter accounts for, independent of the
    /// window.
    pub fn identity(&self) -> String {
        serde_json::to_string(&CounterIdentity {
            quota: &self.quota,
            dimensions: self.dimensions.as_ref(),
        })
        .unwrap_or_else(|_| self.quota.clone())
    }
}
