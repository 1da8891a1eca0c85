use crate::counter::Counter;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod in_memory;

#[cfg(feature = "redis_storage")]
pub mod redis;

mod keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// `granted` units were allocated, leaving `remaining` in the window.
    Ok { granted: u64, remaining: u64 },
    /// Nothing was allocated.
    Limited { remaining: u64 },
}

/// Shared counter store. Implementations must perform the check and the
/// increment of `check_and_update` atomically with respect to other callers
/// on the same counter, and must never consume quota on a denied request.
pub trait CounterStorage: Sync + Send {
    /// Amount consumed in the counter's current window.
    fn get_usage(&self, counter: &Counter) -> Result<u64, StorageErr>;
    fn check_and_update(
        &self,
        counter: &Counter,
        delta: u64,
        best_effort: bool,
    ) -> Result<Authorization, StorageErr>;
    fn clear(&self) -> Result<(), StorageErr>;
}

#[async_trait]
pub trait AsyncCounterStorage: Sync + Send {
    async fn get_usage(&self, counter: &Counter) -> Result<u64, StorageErr>;
    async fn check_and_update(
        &self,
        counter: &Counter,
        delta: u64,
        best_effort: bool,
    ) -> Result<Authorization, StorageErr>;
    async fn clear(&self) -> Result<(), StorageErr>;
}

/// Decides on a request of `delta` units given what's already been used.
pub(crate) fn authorize(max: u64, used: u64, delta: u64, best_effort: bool) -> Authorization {
    let available = max.saturating_sub(used);
    if delta <= available {
        Authorization::Ok {
            granted: delta,
            remaining: available - delta,
        }
    } else if best_effort && available > 0 {
        Authorization::Ok {
            granted: available,
            remaining: 0,
        }
    } else {
        Authorization::Limited {
            remaining: available,
        }
    }
}

#[derive(Debug)]
pub struct StorageErr {
    msg: String,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
    transient: bool,
}

impl Display for StorageErr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "counter storage error: {}", self.msg)
    }
}

impl Error for StorageErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn Error + 'static))
    }
}

impl StorageErr {
    pub fn new(msg: impl Into<String>, transient: bool) -> Self {
        Self {
            msg: msg.into(),
            source: None,
            transient,
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
        transient: bool,
    ) -> Self {
        Self {
            msg: msg.into(),
            source: Some(Box::new(source)),
            transient,
        }
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_within_limits() {
        assert_eq!(
            authorize(10, 4, 6, false),
            Authorization::Ok {
                granted: 6,
                remaining: 0
            }
        );
    }

    #[test]
    fn authorize_denies_without_best_effort() {
        assert_eq!(
            authorize(10, 8, 3, false),
            Authorization::Limited { remaining: 2 }
        );
    }

    #[test]
    fn authorize_grants_leftovers_with_best_effort() {
        assert_eq!(
            authorize(10, 8, 3, true),
            Authorization::Ok {
                granted: 2,
                remaining: 0
            }
        );
        assert_eq!(
            authorize(10, 10, 3, true),
            Authorization::Limited { remaining: 0 }
        );
    }

    #[test]
    fn authorize_tolerates_overused_counters() {
        // Counters can exceed the max after an override's amount is lowered.
        assert_eq!(
            authorize(5, 9, 1, false),
            Authorization::Limited { remaining: 0 }
        );
    }
}
