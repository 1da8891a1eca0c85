//! Parameters of the quota adapter, as loaded at startup.
//!
//! ```yaml
//! redis_server_url: redis-master:6379
//! connection_pool_size: 20
//! timeout: 250ms
//! quotas:
//!   - name: requestcount.quota.istio-system
//!     max_amount: 50
//!     valid_duration: 60s
//!     bucket_duration: 500ms
//!     rate_limit_algorithm: ROLLING_WINDOW
//!     overrides:
//!       - dimensions:
//!           destination: ratings
//!           source: reviews
//!         max_amount: 12
//! ```

use crate::errors::QuotaError;
use crate::quota::{Quota, QuotaSet, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub quotas: Vec<Quota>,
    /// `host:port` of the Redis server. Full `redis://` URLs are accepted
    /// as well.
    #[serde(default)]
    pub redis_server_url: String,
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: u32,
    /// Bounds every operation on Redis. Unbounded when absent.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

pub fn default_connection_pool_size() -> u32 {
    u32::try_from(num_cpus::get() * 10).unwrap_or(u32::MAX)
}

impl Params {
    pub fn from_yaml(yaml: &str) -> Result<Self, QuotaError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QuotaError> {
        let f = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(f)?)
    }

    /// Checks the whole configuration and returns the quota set it defines.
    pub fn validate(&self) -> Result<QuotaSet, ValidationError> {
        if self.redis_server_url.trim().is_empty() {
            return Err(ValidationError::EmptyRedisUrl);
        }
        if self.connection_pool_size == 0 {
            return Err(ValidationError::EmptyConnectionPool);
        }
        QuotaSet::new(self.quotas.iter().cloned())
    }

    pub fn redis_url(&self) -> String {
        normalize_redis_url(&self.redis_server_url)
    }
}

/// Accepts both `host:port`, as written in the params, and full `redis://`
/// URLs.
pub fn normalize_redis_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("redis://{url}")
    }
}
