// To use Redis cluster and some Redis proxies, all the keys used in a
// command or in a script need to be sharded to the same server.
// To help with that, Redis uses "hash tags". When a key contains "{" and
// "}" only what's inside them is hashed.
// All the keys of a quota are sharded by the quota name.
// When there are multiple pairs of "{" and "}" only the first one is taken
// into account. Ref: https://redis.io/topics/cluster-spec (key hash tags).
// Reminder: in format!(), "{" is escaped with "{{".

use crate::counter::Counter;

/// Matches every key written by the counter stores.
pub const KEY_PATTERN: &str = "quota:*";

/// Key of the counter for the current window.
///
/// Fixed windows get one key per window index, left to expire with the
/// window. Rolling windows keep all their buckets in a single hash.
pub fn key_for_counter(counter: &Counter) -> String {
    if counter.is_rolling() {
        format!(
            "quota:{{{}}},counter:{},buckets",
            counter.quota(),
            counter.identity()
        )
    } else {
        format!(
            "quota:{{{}}},counter:{},window:{}",
            counter.quota(),
            counter.identity(),
            counter.window().current
        )
    }
}

#[cfg(test)]
mod tests {
    use super::key_for_counter;
    use crate::counter::Counter;
    use crate::quota::{Override, Quota};
    use std::collections::HashMap;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn key_for_fixed_window_counter() {
        let quota = Quota::new("requestcount", 10, Duration::from_secs(60));
        let counter = Counter::new(
            &quota,
            &HashMap::new(),
            UNIX_EPOCH + Duration::from_secs(130),
        );
        assert_eq!(
            "quota:{requestcount},counter:{\"quota\":\"requestcount\"},window:2",
            key_for_counter(&counter)
        )
    }

    #[test]
    fn key_for_rolling_window_counter_with_override() {
        let quota = Quota::new("requestcount", 10, Duration::from_secs(60))
            .rolling(Duration::from_secs(1))
            .with_override(Override::new([("source", "reviews")], 2));
        let mut attributes = HashMap::new();
        attributes.insert("source".to_string(), "reviews".to_string());
        let counter = Counter::new(&quota, &attributes, UNIX_EPOCH);
        assert_eq!(
            "quota:{requestcount},counter:{\"quota\":\"requestcount\",\"dimensions\":{\"source\":\"reviews\"}},buckets",
            key_for_counter(&counter)
        )
    }
}
