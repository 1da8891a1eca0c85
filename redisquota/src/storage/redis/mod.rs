use ::redis::RedisError;

mod redis_async;
mod redis_sync;
mod scripts;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

use crate::counter::Counter;
use crate::storage::keys::key_for_counter;
use crate::storage::{Authorization, StorageErr};
pub use redis_async::AsyncRedisStorage;
pub use redis_sync::RedisStorage;

impl From<RedisError> for StorageErr {
    fn from(e: RedisError) -> Self {
        let transient = e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal();
        Self::with_source(e.to_string(), e, transient)
    }
}

/// The decision script to run for a counter, with its keys and args set.
pub(crate) fn decision_invocation(
    counter: &Counter,
    delta: u64,
    best_effort: bool,
) -> ::redis::ScriptInvocation<'static> {
    let window = counter.window();
    let ttl = (window.ttl.as_millis() as u64).max(1);
    let best_effort: i64 = if best_effort { 1 } else { 0 };

    if counter.is_rolling() {
        let mut invocation = rolling_window_script().prepare_invoke();
        invocation
            .key(key_for_counter(counter))
            .arg(counter.max_amount())
            .arg(delta)
            .arg(window.current)
            .arg(window.first)
            .arg(ttl)
            .arg(best_effort);
        invocation
    } else {
        let mut invocation = fixed_window_script().prepare_invoke();
        invocation
            .key(key_for_counter(counter))
            .arg(counter.max_amount())
            .arg(delta)
            .arg(ttl)
            .arg(best_effort);
        invocation
    }
}

pub(crate) fn usage_invocation(counter: &Counter) -> ::redis::ScriptInvocation<'static> {
    let window = counter.window();
    let mut invocation = rolling_usage_script().prepare_invoke();
    invocation
        .key(key_for_counter(counter))
        .arg(window.first)
        .arg(window.current);
    invocation
}

fn fixed_window_script() -> &'static ::redis::Script {
    static SCRIPT: std::sync::OnceLock<::redis::Script> = std::sync::OnceLock::new();
    SCRIPT.get_or_init(|| ::redis::Script::new(scripts::SCRIPT_FIXED_WINDOW))
}

fn rolling_window_script() -> &'static ::redis::Script {
    static SCRIPT: std::sync::OnceLock<::redis::Script> = std::sync::OnceLock::new();
    SCRIPT.get_or_init(|| ::redis::Script::new(scripts::SCRIPT_ROLLING_WINDOW))
}

fn rolling_usage_script() -> &'static ::redis::Script {
    static SCRIPT: std::sync::OnceLock<::redis::Script> = std::sync::OnceLock::new();
    SCRIPT.get_or_init(|| ::redis::Script::new(scripts::SCRIPT_ROLLING_USAGE))
}

pub(crate) fn authorization_from_script(res: (i64, i64, i64)) -> Authorization {
    let (allowed, granted, remaining) = res;
    let remaining = u64::try_from(remaining).unwrap_or(0);
    if allowed == 1 {
        Authorization::Ok {
            granted: u64::try_from(granted).unwrap_or(0),
            remaining,
        }
    } else {
        Authorization::Limited { remaining }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_script_results() {
        assert_eq!(
            authorization_from_script((1, 3, 7)),
            Authorization::Ok {
                granted: 3,
                remaining: 7
            }
        );
        assert_eq!(
            authorization_from_script((0, 0, 2)),
            Authorization::Limited { remaining: 2 }
        );
    }
}
