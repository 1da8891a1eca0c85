//! Clusters in the shape of the v1 cluster discovery API.

use crate::errors::CdsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tracing::warn;

pub const MIXER_CLUSTER: &str = "mixer_server";

/// The name of a cluster, kept apart from its rendering so that nothing
/// has to parse names back to find out what a cluster is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClusterName {
    /// `in.{port}`: traffic to a local service instance.
    Inbound { port: u16 },
    /// `out.{host}|{port}[|{tag}]`: traffic to a service, or to the subset
    /// of it a destination policy selects.
    Outbound {
        host: String,
        port: String,
        tag: Option<String>,
    },
    /// Infrastructure clusters with a well-known name.
    Fixed(String),
}

impl ClusterName {
    pub fn inbound(port: u16) -> Self {
        ClusterName::Inbound { port }
    }

    pub fn outbound(host: impl Into<String>, port: impl Into<String>) -> Self {
        ClusterName::Outbound {
            host: host.into(),
            port: port.into(),
            tag: None,
        }
    }

    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        match self {
            ClusterName::Outbound { host, port, .. } => ClusterName::Outbound {
                host,
                port,
                tag: Some(tag.into()),
            },
            other => other,
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, ClusterName::Inbound { .. })
    }

    pub fn is_override(&self) -> bool {
        matches!(self, ClusterName::Outbound { tag: Some(_), .. })
    }
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterName::Inbound { port } => write!(f, "in.{port}"),
            ClusterName::Outbound { host, port, tag } => {
                write!(f, "out.{host}|{port}")?;
                if let Some(tag) = tag {
                    write!(f, "|{tag}")?;
                }
                Ok(())
            }
            ClusterName::Fixed(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for ClusterName {
    type Err = CdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CdsError::InvalidClusterName(s.to_string());

        if let Some(port) = s.strip_prefix("in.") {
            return port
                .parse()
                .map(ClusterName::inbound)
                .map_err(|_| invalid());
        }

        if let Some(rest) = s.strip_prefix("out.") {
            let parts: Vec<&str> = rest.split('|').collect();
            return match parts.as_slice() {
                [host, port] if !host.is_empty() && !port.is_empty() => {
                    Ok(ClusterName::outbound(*host, *port))
                }
                [host, port, tag] if !host.is_empty() && !port.is_empty() && !tag.is_empty() => {
                    Ok(ClusterName::outbound(*host, *port).with_tag(*tag))
                }
                _ => Err(invalid()),
            };
        }

        if !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Ok(ClusterName::Fixed(s.to_string()));
        }

        Err(invalid())
    }
}

impl TryFrom<String> for ClusterName {
    type Error = CdsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClusterName> for String {
    fn from(name: ClusterName) -> Self {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    Static,
    StrictDns,
    Sds,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
    RingHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Http2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub url: String,
}

impl Host {
    pub fn tcp(address: impl Display) -> Self {
        Self {
            url: format!("tcp://{address}"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub default: Thresholds,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlierDetection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_5xx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ejection_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ejection_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: ClusterName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub connect_timeout_ms: u64,
    #[serde(rename = "type")]
    pub discovery_type: DiscoveryType,
    #[serde(default)]
    pub lb_type: LbType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Host>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Feature>,
}

impl Cluster {
    pub fn new(name: ClusterName, discovery_type: DiscoveryType, connect_timeout_ms: u64) -> Self {
        Self {
            name,
            service_name: None,
            connect_timeout_ms,
            discovery_type,
            lb_type: LbType::RoundRobin,
            hosts: Vec::new(),
            max_requests_per_connection: None,
            circuit_breakers: None,
            outlier_detection: None,
            features: None,
        }
    }
}

/// The clusters served to a proxy: unique names, sorted by their rendering.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSet {
    clusters: Vec<Cluster>,
}

impl ClusterSet {
    /// Sorts the clusters by name. When two clusters share a name, the first
    /// one is kept.
    pub fn new(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let mut by_name = BTreeMap::new();
        for cluster in clusters {
            let name = cluster.name.to_string();
            if by_name.contains_key(&name) {
                warn!(cluster = %name, "dropping cluster with duplicate name");
                continue;
            }
            by_name.insert(name, cluster);
        }
        Self {
            clusters: by_name.into_values().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name.to_string() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.clusters.iter().map(|c| c.name.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn to_json(&self) -> Result<String, CdsError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CdsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CdsError> {
        let set: ClusterSet = serde_json::from_str(json)?;
        Ok(Self::new(set.clusters))
    }
}

impl IntoIterator for ClusterSet {
    type Item = Cluster;
    type IntoIter = std::vec::IntoIter<Cluster>;

    fn into_iter(self) -> Self::IntoIter {
        self.clusters.into_iter()
    }
}
