use redisquota::errors::QuotaError;
use redisquota::quota::Quota;
use redisquota::{AsyncQuotaEngine, CheckResult, Clock, QuotaEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

// This exposes a struct that wraps both implementations of the engine, the
// blocking and the async one. This allows us to avoid duplications in the
// tests.

enum EngineImpl {
    Blocking(QuotaEngine),
    #[allow(dead_code)]
    Async(AsyncQuotaEngine),
}

pub struct TestsEngine {
    engine_impl: EngineImpl,
}

impl TestsEngine {
    pub fn new_from_blocking_impl(engine: QuotaEngine) -> Self {
        Self {
            engine_impl: EngineImpl::Blocking(engine),
        }
    }

    #[allow(dead_code)]
    pub fn new_from_async_impl(engine: AsyncQuotaEngine) -> Self {
        Self {
            engine_impl: EngineImpl::Async(engine),
        }
    }

    pub fn configure_with(&self, quotas: Vec<Quota>) -> Result<(), QuotaError> {
        match &self.engine_impl {
            EngineImpl::Blocking(engine) => engine.configure_with(quotas),
            EngineImpl::Async(engine) => engine.configure_with(quotas),
        }
    }

    pub async fn check_and_decrement(
        &self,
        quota: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<CheckResult, QuotaError> {
        match &self.engine_impl {
            EngineImpl::Blocking(engine) => engine.check_and_decrement(quota, attributes, amount),
            EngineImpl::Async(engine) => {
                engine.check_and_decrement(quota, attributes, amount).await
            }
        }
    }

    pub async fn allocate(
        &self,
        quota: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
        best_effort: bool,
    ) -> Result<CheckResult, QuotaError> {
        match &self.engine_impl {
            EngineImpl::Blocking(engine) => engine.allocate(quota, attributes, amount, best_effort),
            EngineImpl::Async(engine) => {
                engine.allocate(quota, attributes, amount, best_effort).await
            }
        }
    }

    pub async fn is_within_quota(
        &self,
        quota: &str,
        attributes: &HashMap<String, String>,
        amount: u64,
    ) -> Result<bool, QuotaError> {
        match &self.engine_impl {
            EngineImpl::Blocking(engine) => engine.is_within_quota(quota, attributes, amount),
            EngineImpl::Async(engine) => engine.is_within_quota(quota, attributes, amount).await,
        }
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct TestClock {
    millis: Arc<AtomicU64>,
}

impl TestClock {
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn clock(&self) -> Clock {
        let millis = Arc::clone(&self.millis);
        Arc::new(move || UNIX_EPOCH + Duration::from_millis(millis.load(Ordering::SeqCst)))
    }
}
