use serde::Serialize;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdsError {
    #[error("couldn't parse YAML input: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("couldn't encode or decode clusters: {0}")]
    Json(#[from] serde_json::Error),
    #[error("couldn't read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cluster name `{0}`")]
    InvalidClusterName(String),
}

/// Why a piece of input didn't make it into the generated clusters.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    #[error("service has no ports")]
    NoPorts,
    #[error("hostname is empty or contains `|`")]
    InvalidHostname,
    #[error("another service already uses this hostname")]
    DuplicateHostname,
    #[error("port name `{0}` contains `|`")]
    InvalidPortName(String),
    #[error("port `{0}` is defined more than once")]
    DuplicatePortName(String),
    #[error("destination policy has no labels")]
    EmptyLabels,
    #[error("destination `{0}` is not a known service")]
    UnknownDestination(String),
    #[error("destination has no port `{0}`")]
    UnknownPort(String),
    #[error("tag `{0}` is empty or contains `|`")]
    InvalidTag(String),
    #[error("cluster `{0}` is already defined by another policy")]
    DuplicateTag(String),
}

/// A skipped service or destination policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// The service hostname, or the destination of the policy.
    pub subject: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl Diagnostic {
    pub fn new(subject: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            subject: subject.into(),
            reason,
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}
