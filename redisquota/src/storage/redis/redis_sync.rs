extern crate redis;

use self::redis::{Commands, ConnectionInfo, ConnectionLike, IntoConnectionInfo, RedisError};
use crate::counter::Counter;
use crate::params::normalize_redis_url;
use crate::storage::keys::{key_for_counter, KEY_PATTERN};
use crate::storage::redis::{
    authorization_from_script, decision_invocation, usage_invocation,
};
use crate::storage::{Authorization, CounterStorage, StorageErr};
use r2d2::{ManageConnection, Pool};
use std::time::Duration;
use tracing::debug;

const DEFAULT_MAX_REDIS_CONNS: u32 = 20;
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
const CLEAR_BATCH_SIZE: usize = 500;

/// Blocking Redis storage over a pool of connections. Every decision is a
/// single script invocation.
pub struct RedisStorage {
    conn_pool: Pool<RedisConnectionManager>,
}

impl CounterStorage for RedisStorage {
    #[tracing::instrument(skip_all)]
    fn get_usage(&self, counter: &Counter) -> Result<u64, StorageErr> {
        let mut con = self.conn_pool.get()?;

        let used: Option<i64> = if counter.is_rolling() {
            Some(usage_invocation(counter).invoke(&mut *con)?)
        } else {
            redis::cmd("GET")
                .arg(key_for_counter(counter))
                .query(&mut *con)?
        };

        Ok(used.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    #[tracing::instrument(skip_all)]
    fn check_and_update(
        &self,
        counter: &Counter,
        delta: u64,
        best_effort: bool,
    ) -> Result<Authorization, StorageErr> {
        let mut con = self.conn_pool.get()?;

        let res: (i64, i64, i64) =
            decision_invocation(counter, delta, best_effort).invoke(&mut *con)?;
        debug!(quota = counter.quota(), ?res, "quota script result");

        Ok(authorization_from_script(res))
    }

    #[tracing::instrument(skip_all)]
    fn clear(&self) -> Result<(), StorageErr> {
        let mut con = self.conn_pool.get()?;
        let keys: Vec<String> = con.scan_match::<_, String>(KEY_PATTERN)?.collect();
        for batch in keys.chunks(CLEAR_BATCH_SIZE) {
            redis::cmd("UNLINK").arg(batch).query::<()>(&mut *con)?;
        }
        Ok(())
    }
}

impl RedisStorage {
    pub fn new(redis_url: &str) -> Result<Self, StorageErr> {
        Self::with_pool_size(redis_url, DEFAULT_MAX_REDIS_CONNS)
    }

    pub fn with_pool_size(redis_url: &str, max_connections: u32) -> Result<Self, StorageErr> {
        Self::new_with_options(redis_url, max_connections, None)
    }

    /// With a `timeout`, connecting, checking out a connection and every
    /// read or write on it are bounded. Expiry fails the operation with a
    /// transient error.
    pub fn new_with_options(
        redis_url: &str,
        max_connections: u32,
        timeout: Option<Duration>,
    ) -> Result<Self, StorageErr> {
        let conn_manager = RedisConnectionManager::new(normalize_redis_url(redis_url).as_str())?
            .with_timeout(timeout);
        let conn_pool = Pool::builder()
            .connection_timeout(timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT))
            .max_size(max_connections.max(1))
            .build(conn_manager)?;
        Ok(Self { conn_pool })
    }
}

// The RedisConnectionManager is very similar to the one found in the r2d2_redis
// crate. That crate has not been updated in a long time and depends on an old
// version of the Redis crate.

#[derive(Debug)]
pub struct RedisConnectionManager {
    connection_info: ConnectionInfo,
    timeout: Option<Duration>,
}

impl RedisConnectionManager {
    pub fn new<T: IntoConnectionInfo>(params: T) -> Result<Self, RedisError> {
        Ok(Self {
            connection_info: params.into_connection_info()?,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let client = redis::Client::open(self.connection_info.clone())?;
        match self.timeout {
            Some(timeout) => {
                let conn = client.get_connection_with_timeout(timeout)?;
                conn.set_read_timeout(Some(timeout))?;
                conn.set_write_timeout(Some(timeout))?;
                Ok(conn)
            }
            None => client.get_connection(),
        }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query(conn)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

impl From<::r2d2::Error> for StorageErr {
    fn from(e: ::r2d2::Error) -> Self {
        Self::new(e.to_string(), true)
    }
}

#[cfg(test)]
mod test {
    use crate::counter::Counter;
    use crate::quota::Quota;
    use crate::storage::redis::RedisStorage;
    use crate::storage::CounterStorage;
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::time::{Duration, Instant, SystemTime};

    #[test]
    fn errs_on_bad_url() {
        let result = RedisStorage::new("cassandra://127.0.0.1:6379");
        assert!(result.is_err());
        assert!(!result.err().unwrap().is_transient());
    }

    #[test]
    fn silent_server_times_out() {
        // Accepts connections, never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("redis://{}", listener.local_addr().unwrap());
        let quota = Quota::new("q", 10, Duration::from_secs(60));
        let counter = Counter::new(&quota, &HashMap::new(), SystemTime::now());

        let started = Instant::now();
        let result = RedisStorage::new_with_options(&url, 1, Some(Duration::from_millis(200)))
            .and_then(|storage| storage.check_and_update(&counter, 1, false));

        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(listener);
    }

    #[cfg(feature = "redis_integration")]
    #[test]
    #[serial_test::serial]
    fn clear_only_drops_quota_keys() {
        use ::redis::Commands;

        let storage = RedisStorage::new("redis://127.0.0.1:6379").unwrap();
        let quota = Quota::new("q", 10, Duration::from_secs(60));
        let counter = Counter::new(&quota, &HashMap::new(), SystemTime::now());
        storage.check_and_update(&counter, 1, false).unwrap();

        let mut con = storage.conn_pool.get().unwrap();
        let _: () = con.set("unrelated", "kept").unwrap();

        storage.clear().unwrap();
        assert_eq!(storage.get_usage(&counter).unwrap(), 0);
        let kept: Option<String> = con.get("unrelated").unwrap();
        assert_eq!(kept.as_deref(), Some("kept"));
        let _: () = con.del("unrelated").unwrap();
    }
}
