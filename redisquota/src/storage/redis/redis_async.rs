extern crate redis;

use crate::counter::Counter;
use crate::params::normalize_redis_url;
use crate::storage::keys::{key_for_counter, KEY_PATTERN};
use crate::storage::redis::{
    authorization_from_script, decision_invocation, usage_invocation,
};
use crate::storage::{AsyncCounterStorage, Authorization, StorageErr};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const CLEAR_BATCH_SIZE: usize = 500;

/// Async Redis storage over a single multiplexed, self-reconnecting
/// connection. Every decision is a single script invocation.
#[derive(Clone)]
pub struct AsyncRedisStorage {
    conn_manager: ConnectionManager,
    timeout: Option<Duration>,
}

#[async_trait]
impl AsyncCounterStorage for AsyncRedisStorage {
    #[tracing::instrument(skip_all)]
    async fn get_usage(&self, counter: &Counter) -> Result<u64, StorageErr> {
        let mut con = self.conn_manager.clone();

        let used: Option<i64> = if counter.is_rolling() {
            let invocation = usage_invocation(counter);
            Some(self.bounded(invocation.invoke_async(&mut con)).await?)
        } else {
            self.bounded(con.get(key_for_counter(counter))).await?
        };

        Ok(used.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    #[tracing::instrument(skip_all)]
    async fn check_and_update(
        &self,
        counter: &Counter,
        delta: u64,
        best_effort: bool,
    ) -> Result<Authorization, StorageErr> {
        let mut con = self.conn_manager.clone();

        let invocation = decision_invocation(counter, delta, best_effort);
        let res: (i64, i64, i64) = self.bounded(invocation.invoke_async(&mut con)).await?;
        debug!(quota = counter.quota(), ?res, "quota script result");

        Ok(authorization_from_script(res))
    }

    #[tracing::instrument(skip_all)]
    async fn clear(&self) -> Result<(), StorageErr> {
        let mut con = self.conn_manager.clone();
        let keys: Vec<String> = self
            .bounded(async {
                let mut iter = con.scan_match::<_, String>(KEY_PATTERN).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok::<_, RedisError>(keys)
            })
            .await?;
        for batch in keys.chunks(CLEAR_BATCH_SIZE) {
            let mut unlink = redis::cmd("UNLINK");
            unlink.arg(batch);
            let _: () = self.bounded(unlink.query_async(&mut con)).await?;
        }
        Ok(())
    }
}

impl AsyncRedisStorage {
    pub async fn new(redis_url: &str) -> Result<Self, StorageErr> {
        let client = redis::Client::open(normalize_redis_url(redis_url))?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self {
            conn_manager,
            timeout: None,
        })
    }

    /// Bounds every operation. Operations that don't complete in time fail
    /// with a transient error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StorageErr> {
        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(StorageErr::new(
                    format!("Redis did not answer within {timeout:?}"),
                    true,
                )),
            },
            None => Ok(operation.await?),
        }
    }
}
