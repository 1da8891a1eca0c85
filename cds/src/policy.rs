//! Destination policies: label-scoped overrides of how traffic reaches a
//! service.

use crate::cluster::LbType;
use crate::errors::CdsError;
use crate::registry::Port;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// A service port, by number or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSelector {
    Number(u16),
    Name(String),
}

impl PortSelector {
    pub fn matches(&self, port: &Port) -> bool {
        match self {
            PortSelector::Number(number) => port.port == *number,
            PortSelector::Name(name) => port.name == *name,
        }
    }
}

impl Display for PortSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSelector::Number(number) => write!(f, "{number}"),
            PortSelector::Name(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_http_max_pending_requests")]
    pub http_max_pending_requests: u32,
    #[serde(default = "default_http_max_requests")]
    pub http_max_requests: u32,
    #[serde(default = "default_http_max_retries")]
    pub http_max_retries: u32,
    #[serde(default)]
    pub http_max_requests_per_connection: Option<u32>,
    /// Consecutive 5xx responses before a host is ejected.
    #[serde(default = "default_http_consecutive_errors")]
    pub http_consecutive_errors: u32,
    #[serde(with = "humantime_serde", default = "default_http_detection_interval")]
    pub http_detection_interval: Duration,
    /// Base time a host stays ejected.
    #[serde(with = "humantime_serde", default = "default_sleep_window")]
    pub sleep_window: Duration,
    #[serde(default = "default_http_max_ejection_percent")]
    pub http_max_ejection_percent: u32,
}

fn default_max_connections() -> u32 {
    1024
}

fn default_http_max_pending_requests() -> u32 {
    1024
}

fn default_http_max_requests() -> u32 {
    1024
}

fn default_http_max_retries() -> u32 {
    3
}

fn default_http_consecutive_errors() -> u32 {
    5
}

fn default_http_detection_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_sleep_window() -> Duration {
    Duration::from_secs(30)
}

fn default_http_max_ejection_percent() -> u32 {
    10
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            http_max_pending_requests: default_http_max_pending_requests(),
            http_max_requests: default_http_max_requests(),
            http_max_retries: default_http_max_retries(),
            http_max_requests_per_connection: None,
            http_consecutive_errors: default_http_consecutive_errors(),
            http_detection_interval: default_http_detection_interval(),
            sleep_window: default_sleep_window(),
            http_max_ejection_percent: default_http_max_ejection_percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationPolicy {
    /// Hostname of the service the policy applies to.
    pub destination: String,
    /// Restricts the policy to one port. All the ports otherwise.
    #[serde(default)]
    pub port: Option<PortSelector>,
    /// Names the override cluster. Defaults to the rendered labels.
    #[serde(default)]
    pub tag: Option<String>,
    /// Endpoints of the override cluster must carry all of these.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub load_balancing: Option<LbType>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl DestinationPolicy {
    pub fn new(
        destination: impl Into<String>,
        labels: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            destination: destination.into(),
            port: None,
            tag: None,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            load_balancing: None,
            circuit_breaker: None,
        }
    }

    pub fn on_port(mut self, port: PortSelector) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn load_balancing(mut self, lb_type: LbType) -> Self {
        self.load_balancing = Some(lb_type);
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// The tag, or `k=v,...` over the sorted labels.
    pub fn effective_tag(&self) -> String {
        match &self.tag {
            Some(tag) => tag.clone(),
            None => render_labels(&self.labels),
        }
    }

    pub fn list_from_yaml(yaml: &str) -> Result<Vec<Self>, CdsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

pub fn render_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
