use crate::errors::CdsError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_MIXER_ADDRESS: &str = "istio-mixer.istio-system:9091";

/// Mesh-wide settings that apply to every generated cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// `host:port` of the mixer, resolved through DNS.
    #[serde(default = "default_mixer_address")]
    pub mixer_address: String,
    /// Address the inbound clusters forward to.
    #[serde(default = "default_inbound_address")]
    pub inbound_address: IpAddr,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_mixer_address() -> String {
    DEFAULT_MIXER_ADDRESS.to_string()
}

fn default_inbound_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            mixer_address: default_mixer_address(),
            inbound_address: default_inbound_address(),
        }
    }
}

impl MeshConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, CdsError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
