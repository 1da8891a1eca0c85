//! redisquota enforces named quotas over a shared counter store.
//!
//! # Basic operation
//!
//! Quotas allow at most `max_amount` units per `valid_duration`. The counters
//! can be kept in memory or in Redis. In memory is faster, but the counters
//! are not shared between instances. Redis lets every instance of a fleet
//! enforce the same quota.
//!
//! ```
//! use redisquota::QuotaEngine;
//! let engine = QuotaEngine::new(1000);
//! ```
//!
//! To use Redis:
//! ```no_run
//! #[cfg(feature = "redis_storage")]
//! # {
//! use redisquota::QuotaEngine;
//! use redisquota::storage::redis::RedisStorage;
//!
//! let engine = QuotaEngine::new_with_storage(
//!     Box::new(RedisStorage::new("redis://127.0.0.1:6379").unwrap())
//! );
//! # }
//! ```
//!
//! # Quotas
//!
//! A quota has a name, a maximum amount, the length of its window and a list
//! of overrides. An override applies a different maximum to the requests
//! whose attributes carry all of its dimensions. The first matching override,
//! in declaration order, wins, and each override is counted apart from the
//! base quota.
//!
//! ```
//! use redisquota::quota::{Override, Quota};
//! use std::time::Duration;
//!
//! let quota = Quota::new("requestcount", 500, Duration::from_secs(1))
//!     .rolling(Duration::from_millis(100))
//!     .with_override(Override::new([("destination", "ratings")], 20));
//! ```
//!
//! # Apply quotas
//!
//! ```
//! use redisquota::QuotaEngine;
//! use redisquota::quota::{Override, Quota};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! let engine = QuotaEngine::new(1000);
//! engine
//!     .configure_with(vec![
//!         Quota::new("requestcount", 10, Duration::from_secs(24 * 3600))
//!             .with_override(Override::new([("source", "reviews")], 2)),
//!     ])
//!     .unwrap();
//!
//! let mut attributes = HashMap::new();
//! attributes.insert("source".to_string(), "reviews".to_string());
//!
//! // The override allows 2 units
//! assert!(engine.check_and_decrement("requestcount", &attributes, 1).unwrap().allowed);
//! assert!(engine.check_and_decrement("requestcount", &attributes, 1).unwrap().allowed);
//! assert!(!engine.check_and_decrement("requestcount", &attributes, 1).unwrap().allowed);
//!
//! // Best effort grants what's left instead of denying
//! let result = engine
//!     .allocate("requestcount", &HashMap::new(), 25, true)
//!     .unwrap();
//! assert_eq!(result.granted, 10);
//! ```
//!
//! # Async
//!
//! The async engine exposes the same operations over an
//! [`AsyncCounterStorage`]:
//!
//! ```
//! #[cfg(feature = "redis_storage")]
//! # {
//! use redisquota::AsyncQuotaEngine;
//! use redisquota::storage::redis::AsyncRedisStorage;
//!
//! async {
//!     let engine = AsyncQuotaEngine::new_with_storage(
//!         Box::new(AsyncRedisStorage::new("redis://127.0.0.1:6379").await.unwrap())
//!     );
//! };
//! # }
//! ```
//!
//! # Accuracy
//!
//! Every decision is a single atomic check and update on the store. Denied
//! requests don't consume quota, and concurrent callers can't push a
//! counter over its maximum. Fixed windows do admit up to twice the maximum
//! around a window boundary; use rolling windows where that matters.
//!

#![deny(clippy::all, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::counter::Counter;
use crate::errors::QuotaError;
use crate::quota::{Quota, QuotaSet};
use crate::storage::in_memory::InMemoryStorage;
use crate::storage::{AsyncCounterStorage, Authorization, CounterStorage};

#[cfg(feature = "redis_storage")]
use crate::params::Params;
#[cfg(feature = "redis_storage")]
use crate::storage::redis::{AsyncRedisStorage, RedisStorage};

pub mod counter;
pub mod errors;
pub mod params;
pub mod quota;
pub mod storage;

/// Source of the current time. Replaced in tests to cross window
/// boundaries deterministically.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(SystemTime::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    /// Units allocated. Equal to the requested amount when allowed, unless
    /// the allocation was best effort.
    pub granted: u64,
    /// Units left in the current window after this decision.
    pub remaining: u64,
    /// For how long the decision holds: the quota's window.
    pub valid_duration: Duration,
}

impl CheckResult {
    fn from_authorization(authorization: Authorization, counter: &Counter) -> Self {
        match authorization {
            Authorization::Ok { granted, remaining } => Self {
                allowed: true,
                granted,
                remaining,
                valid_duration: counter.valid_duration(),
            },
            Authorization::Limited { remaining } => Self {
                allowed: false,
                granted: 0,
                remaining,
                valid_duration: counter.valid_duration(),
            },
        }
    }
}

impl From<CheckResult> for bool {
    fn from(result: CheckResult) -> Self {
        result.allowed
    }
}

pub struct QuotaEngine {
    quotas: RwLock<Arc<QuotaSet>>,
    counters: Box<dyn CounterStorage>,
    clock: Clock,
}

pub struct AsyncQuotaEngine {
    quotas: RwLock<Arc<QuotaSet>>,
    counters: Box<dyn AsyncCounterStorage>,
    clock: Clock,
}

pub struct QuotaEngineBuilder {
    storage: Box<dyn CounterStorage>,
    clock: Clock,
}

impl QuotaEngineBuilder {
    pub fn new(cache_size: usize) -> Self {
        Self::with_storage(Box::new(InMemoryStorage::new(cache_size)))
    }

    pub fn with_storage(storage: Box<dyn CounterStorage>) -> Self {
        Self {
            storage,
            clock: system_clock(),
        }
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> QuotaEngine {
        QuotaEngine {
            quotas: RwLock::new(Arc::new(QuotaSet::default())),
            counters: self.storage,
            clock: self.clock,
        }
    }
}

pub struct AsyncQuotaEngineBuilder {
    storage: Box<dyn AsyncCounterStorage>,
    clock: Clock,
}

impl AsyncQuotaEngineBuilder {
    pub fn new(storage: Box<dyn AsyncCounterStorage>) -> Self {
        Self {
            storage,
            clock: system_clock(),
        }
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> AsyncQuotaEngine {
        AsyncQuotaEngine {
            quotas: RwLock::new(Arc::new(QuotaSet::default())),
            counters: self.storage,
            clock: self.clock,
        }
    }
}

impl QuotaEngine {
    /// In-memory engine. See [`InMemoryStorage::new`] on sizing `cache_size`.
    pub fn new(cache_size: usize) -> Self {
        QuotaEngineBuilder::new(cache_size).build()
    }

    pub fn new_with_storage(counters: Box<dyn CounterStorage>) -> Self {
        QuotaEngineBuilder::with_storage(counters).build()
    }

    /// Validates the params, connects a pool of `connection_pool_size`
    /// connections to Redis and loads the quotas.
    #[cfg(feature = "redis_storage")]
    pub fn from_params(params: &Params) -> Result<Self, QuotaError> {
        let quotas = params.validate()?;
        let storage = RedisStorage::new_with_options(
            &params.redis_server_url,
            params.connection_pool_size,
            params.timeout,
        )?;
        let engine = Self::new_with_storage(Box::new(storage));
        engine.swap_quotas(quotas);
        Ok(engine)
    }

    /// Replaces all the quotas. The new set is validated as a whole: if any
    /// quota is invalid, the engine keeps serving the previous set.
    pub fn configure_with(&self, quotas: impl IntoIterator<Item = Quota>) -> Result<(), QuotaError> {
        let quotas = QuotaSet::new(quotas)
            .inspect_err(|err| warn!("rejected quota configuration: {}", err))?;
        self.swap_quotas(quotas);
        Ok(())
    }

    pub fn quotas(&self) -> Arc<QuotaSet> {
        Arc::clone(&self.quotas.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get_quota(&self, name: &str) -> Option<Arc<Quota>> {
        self.quotas().get(name).cloned()
    }

    /// Consumes `amount` units if they're all available.
    pub fn check_and_decrement(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<CheckResult, QuotaError> {
        self.allocate(quota_name, attributes, amount, false)
    }

    /// Like [`QuotaEngine::check_and_decrement`], but with `best_effort` a
    /// request exceeding what's left is granted the remainder instead of
    /// being denied.
    pub fn allocate(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
        best_effort: bool,
    ) -> Result<CheckResult, QuotaError> {
        let counter = self.counter_for(quota_name, attributes)?;
        let authorization = self
            .counters
            .check_and_update(&counter, amount, best_effort)
            .inspect_err(|err| warn!(quota = quota_name, "counter storage failed: {}", err))?;
        let result = CheckResult::from_authorization(authorization, &counter);
        debug!(
            quota = quota_name,
            amount,
            allowed = result.allowed,
            granted = result.granted,
            remaining = result.remaining,
            "quota decision"
        );
        Ok(result)
    }

    /// Whether `amount` units would be allowed right now, without consuming
    /// anything.
    pub fn is_within_quota(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<bool, QuotaError> {
        let counter = self.counter_for(quota_name, attributes)?;
        let used = self.counters.get_usage(&counter)?;
        Ok(used.saturating_add(amount) <= counter.max_amount())
    }

    /// Drops every counter in the store.
    pub fn clear(&self) -> Result<(), QuotaError> {
        Ok(self.counters.clear()?)
    }

    fn swap_quotas(&self, quotas: QuotaSet) {
        let mut current = self.quotas.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(quotas);
    }

    fn counter_for(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<Counter, QuotaError> {
        counter_for(&self.quotas, &self.clock, quota_name, attributes)
    }
}

// TODO: the code of this implementation is almost identical to the blocking
// one. The only exception is that the functions defined are "async".
// Consider a macro or trait to avoid the repetition.
impl AsyncQuotaEngine {
    pub fn new_with_storage(counters: Box<dyn AsyncCounterStorage>) -> Self {
        AsyncQuotaEngineBuilder::new(counters).build()
    }

    /// Validates the params, connects to Redis and loads the quotas. The
    /// async driver multiplexes a single connection, so
    /// `connection_pool_size` isn't used.
    #[cfg(feature = "redis_storage")]
    pub async fn from_params(params: &Params) -> Result<Self, QuotaError> {
        let quotas = params.validate()?;
        let mut storage = AsyncRedisStorage::new(&params.redis_server_url).await?;
        if let Some(timeout) = params.timeout {
            storage = storage.with_timeout(timeout);
        }
        let engine = Self::new_with_storage(Box::new(storage));
        engine.swap_quotas(quotas);
        Ok(engine)
    }

    pub fn configure_with(&self, quotas: impl IntoIterator<Item = Quota>) -> Result<(), QuotaError> {
        let quotas = QuotaSet::new(quotas)
            .inspect_err(|err| warn!("rejected quota configuration: {}", err))?;
        self.swap_quotas(quotas);
        Ok(())
    }

    pub fn quotas(&self) -> Arc<QuotaSet> {
        Arc::clone(&self.quotas.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get_quota(&self, name: &str) -> Option<Arc<Quota>> {
        self.quotas().get(name).cloned()
    }

    pub async fn check_and_decrement(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<CheckResult, QuotaError> {
        self.allocate(quota_name, attributes, amount, false).await
    }

    pub async fn allocate(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
        best_effort: bool,
    ) -> Result<CheckResult, QuotaError> {
        let counter = self.counter_for(quota_name, attributes)?;
        let authorization = self
            .counters
            .check_and_update(&counter, amount, best_effort)
            .await
            .inspect_err(|err| warn!(quota = quota_name, "counter storage failed: {}", err))?;
        let result = CheckResult::from_authorization(authorization, &counter);
        debug!(
            quota = quota_name,
            amount,
            allowed = result.allowed,
            granted = result.granted,
            remaining = result.remaining,
            "quota decision"
        );
        Ok(result)
    }

    pub async fn is_within_quota(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<bool, QuotaError> {
        let counter = self.counter_for(quota_name, attributes)?;
        let used = self.counters.get_usage(&counter).await?;
        Ok(used.saturating_add(amount) <= counter.max_amount())
    }

    pub async fn clear(&self) -> Result<(), QuotaError> {
        Ok(self.counters.clear().await?)
    }

    fn swap_quotas(&self, quotas: QuotaSet) {
        let mut current = self.quotas.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(quotas);
    }

    fn counter_for(
        &self,
        quota_name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<Counter, QuotaError> {
        counter_for(&self.quotas, &self.clock, quota_name, attributes)
    }
}

// The quota set lock is only held while resolving the quota, never across
// calls to the store.
fn counter_for(
    quotas: &RwLock<Arc<QuotaSet>>,
    clock: &Clock,
    quota_name: &str,
    attributes: &HashMap<String, String>,
) -> Result<Counter, QuotaError> {
    let quota = {
        let quotas = quotas.read().unwrap_or_else(PoisonError::into_inner);
        quotas.get(quota_name).cloned()
    };
    match quota {
        Some(quota) => Ok(Counter::new(&quota, attributes, clock())),
        None => {
            debug!(quota = quota_name, "unknown quota");
            Err(QuotaError::UnknownQuota(quota_name.to_string()))
        }
    }
}
