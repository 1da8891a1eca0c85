//! The service registry snapshot clusters are generated from.

use crate::errors::CdsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    Https,
    Tcp,
    Mongo,
    Redis,
}

impl Protocol {
    pub fn is_http2(&self) -> bool {
        matches!(self, Protocol::Http2 | Protocol::Grpc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn new(name: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            port,
            protocol,
        }
    }

    /// What the port is known as in cluster names: its name, or its number
    /// when unnamed.
    pub fn key(&self) -> String {
        if self.name.is_empty() {
            self.port.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// How the proxy finds the endpoints of a service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Endpoints are discovered out of band, through SDS.
    #[default]
    ClusterLocal,
    /// The hostname is resolved through DNS.
    Dns,
    /// Fixed IPs, listed in the service's `endpoints`.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEndpoint {
    pub address: IpAddr,
    /// Target port per service port name. Ports not listed here are reached
    /// on the service port number.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl StaticEndpoint {
    pub fn target_port(&self, port: &Port) -> u16 {
        self.ports.get(&port.name).copied().unwrap_or(port.port)
    }

    pub fn has_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub hostname: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<StaticEndpoint>,
}

impl Service {
    pub fn new(hostname: impl Into<String>, ports: Vec<Port>) -> Self {
        Self {
            hostname: hostname.into(),
            ports,
            resolution: Resolution::ClusterLocal,
            endpoints: Vec::new(),
        }
    }

    pub fn resolved_by_dns(mut self) -> Self {
        self.resolution = Resolution::Dns;
        self
    }

    pub fn with_static_endpoints(mut self, endpoints: Vec<StaticEndpoint>) -> Self {
        self.resolution = Resolution::Static;
        self.endpoints = endpoints;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

/// A service instance running next to the proxy the clusters are generated
/// for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub hostname: String,
    pub endpoint: Endpoint,
    pub service_port: Port,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

impl RegistrySnapshot {
    pub fn from_yaml(yaml: &str) -> Result<Self, CdsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CdsError> {
        let f = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(f)?)
    }
}
