use crate::quota::ValidationError;
use crate::storage::StorageErr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("unknown quota `{0}`")]
    UnknownQuota(String),
    #[error("invalid quota configuration: {0}")]
    Invalid(#[from] ValidationError),
    #[error("quota backend unavailable: {0}")]
    BackendUnavailable(#[from] StorageErr),
    #[error("couldn't parse quota params: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("couldn't read quota params: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    /// Whether the failure is the store's, rather than the request's or the
    /// configuration's. Callers pick fail-open or fail-closed on these.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, QuotaError::BackendUnavailable(_))
    }
}
